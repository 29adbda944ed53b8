//! Small per-tick animation steppers used by the state machine.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::time::{Duration, Instant};

use crate::config::AnimationConfig;

pub const SERVO_CENTER: f32 = 90.0;

/// One full triangle wave on the arm servo: rest, up to the max, down to the
/// min, back to rest.
pub struct ArmWave {
    angle: f32,
    direction: f32,
    active: bool,
    last_end: Option<Instant>,
}

impl Default for ArmWave {
    fn default() -> Self {
        Self::new()
    }
}

impl ArmWave {
    pub fn new() -> Self {
        Self {
            angle: SERVO_CENTER,
            direction: 1.0,
            active: false,
            last_end: None,
        }
    }

    pub fn active(&self) -> bool {
        self.active
    }

    /// Enough rest since the last wave to start another?
    pub fn due(&self, now: Instant, interval: Duration) -> bool {
        !self.active
            && self
                .last_end
                .map_or(true, |end| now.duration_since(end) >= interval)
    }

    pub fn start(&mut self, animation: &AnimationConfig) {
        self.angle = animation.wave_min;
        self.direction = 1.0;
        self.active = true;
    }

    /// Advance one tick and return the arm target for this tick.
    pub fn tick(&mut self, animation: &AnimationConfig, now: Instant) -> f32 {
        if !self.active {
            return SERVO_CENTER;
        }
        self.angle += self.direction * animation.wave_speed;
        if self.direction > 0.0 && self.angle >= animation.wave_max {
            self.angle = animation.wave_max;
            self.direction = -1.0;
        } else if self.direction < 0.0 && self.angle <= animation.wave_min {
            self.angle = animation.wave_min;
            self.active = false;
            self.last_end = Some(now);
            return SERVO_CENTER;
        }
        self.angle
    }

    pub fn cancel(&mut self, now: Instant) {
        if self.active {
            self.active = false;
            self.last_end = Some(now);
        }
    }
}

/// Side-to-side refusal shake, an additive servo offset.
pub struct Shake {
    offset: f32,
    direction: f32,
}

impl Default for Shake {
    fn default() -> Self {
        Self::new()
    }
}

impl Shake {
    pub fn new() -> Self {
        Self {
            offset: 0.0,
            direction: 1.0,
        }
    }

    pub fn reset(&mut self) {
        self.offset = 0.0;
        self.direction = 1.0;
    }

    pub fn tick(&mut self, animation: &AnimationConfig) -> f32 {
        self.offset += self.direction * animation.shake_speed;
        if self.offset.abs() >= animation.shake_range {
            self.offset = self.offset.clamp(-animation.shake_range, animation.shake_range);
            self.direction = -self.direction;
        }
        self.offset
    }
}

/// Square-wave flash phase: true during the lit half of each cycle.
pub fn square_wave(elapsed: Duration, hz: f32) -> bool {
    (elapsed.as_secs_f32() * hz).fract() < 0.5
}

/// Move `current` toward `target` by at most `step` degrees.
pub fn drift_toward(current: f32, target: f32, step: f32) -> f32 {
    let diff = target - current;
    if diff.abs() <= step {
        target
    } else if diff > 0.0 {
        current + step
    } else {
        current - step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn animation() -> AnimationConfig {
        AnimationConfig::default()
    }

    #[test]
    fn wave_runs_one_full_triangle() {
        let animation = animation();
        let now = Instant::now();
        let mut wave = ArmWave::new();
        assert!(wave.due(now, animation.wave_interval()));

        wave.start(&animation);
        let mut angles = Vec::new();
        for _ in 0..100 {
            if !wave.active() {
                break;
            }
            angles.push(wave.tick(&animation, now));
        }
        assert!(!wave.active());
        let max = angles.iter().cloned().fold(f32::MIN, f32::max);
        assert!((max - animation.wave_max).abs() < animation.wave_speed);
        // 45 -> 135 -> 45 at 4 deg/tick is ~45 ticks.
        assert!(angles.len() >= 40 && angles.len() <= 50, "{}", angles.len());
        // Rest position once done.
        assert_eq!(wave.tick(&animation, now), SERVO_CENTER);
    }

    #[test]
    fn wave_interval_gates_restart() {
        let animation = animation();
        let start = Instant::now();
        let mut wave = ArmWave::new();
        wave.start(&animation);
        while wave.active() {
            wave.tick(&animation, start);
        }
        assert!(!wave.due(start + Duration::from_secs(3), animation.wave_interval()));
        assert!(wave.due(start + Duration::from_secs(4), animation.wave_interval()));
    }

    #[test]
    fn shake_stays_inside_range_and_oscillates() {
        let animation = animation();
        let mut shake = Shake::new();
        let mut saw_positive_peak = false;
        let mut saw_negative_peak = false;
        for _ in 0..40 {
            let offset = shake.tick(&animation);
            assert!(offset.abs() <= animation.shake_range);
            if offset >= animation.shake_range {
                saw_positive_peak = true;
            }
            if offset <= -animation.shake_range {
                saw_negative_peak = true;
            }
        }
        assert!(saw_positive_peak && saw_negative_peak);
    }

    #[test]
    fn square_wave_at_eight_hertz() {
        assert!(square_wave(Duration::from_millis(0), 8.0));
        assert!(square_wave(Duration::from_millis(30), 8.0));
        assert!(!square_wave(Duration::from_millis(80), 8.0));
        assert!(square_wave(Duration::from_millis(130), 8.0));
    }

    #[test]
    fn drift_clamps_final_step() {
        assert_eq!(drift_toward(87.0, 90.0, 2.0), 89.0);
        assert_eq!(drift_toward(89.0, 90.0, 2.0), 90.0);
        assert_eq!(drift_toward(94.0, 90.0, 2.0), 92.0);
    }
}
