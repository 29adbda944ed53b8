//! In-process MCU simulator for running without hardware.
//!
//! Accepts the host's command lines, moves three simulated servos toward
//! their targets, trips the limit switch at the pan extremes, runs the valve
//! watchdog, and emits a `$STS` line every 20 ms with a little position
//! noise.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::time::{Duration, Instant};

use rand::Rng;

use crate::comm::protocol::NUM_SERVOS;
use crate::comm::uart::SerialLink;

/// Simulation step, matching the firmware's 50 Hz status rate.
const STATUS_INTERVAL: Duration = Duration::from_millis(20);
/// Degrees a servo moves per simulation step.
const SERVO_STEP: f32 = 5.0;
/// The firmware force-closes the valve this long after it opened.
const VALVE_WATCHDOG_TICKS: u32 = 250; // 5 s of 20 ms ticks
/// LED test feedback stays high for one second.
const TEST_ACTIVE_TICKS: u32 = 50;

pub struct MockLink {
    out: Vec<u8>,
    servo_positions: [f32; NUM_SERVOS],
    servo_targets: [f32; NUM_SERVOS],
    light_on: bool,
    limit: u8,
    flags: u8,
    valve_open: bool,
    valve_ticks: u32,
    test_ticks_left: u32,
    last_status: Instant,
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            out: Vec::new(),
            servo_positions: [90.0; NUM_SERVOS],
            servo_targets: [90.0; NUM_SERVOS],
            light_on: false,
            limit: 0,
            flags: 0,
            valve_open: false,
            valve_ticks: 0,
            test_ticks_left: 0,
            last_status: Instant::now(),
        }
    }

    fn move_toward(current: f32, target: f32, speed: f32) -> f32 {
        let diff = target - current;
        if diff.abs() <= speed {
            target
        } else if diff > 0.0 {
            current + speed
        } else {
            current - speed
        }
    }

    fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        let Some(body) = line.strip_prefix('$') else {
            return;
        };
        let mut parts = body.split(',');
        let tag = parts.next().unwrap_or("");
        let fields: Vec<&str> = parts.collect();
        match tag {
            "SRV" => {
                if fields.len() == NUM_SERVOS {
                    for (i, f) in fields.iter().enumerate() {
                        if let Ok(v) = f.parse::<f32>() {
                            self.servo_targets[i] = v;
                        }
                    }
                }
            }
            "LGT" => match fields.first().and_then(|f| f.parse::<u8>().ok()) {
                Some(0) => self.light_on = false,
                Some(1) => self.light_on = true,
                // AUTO leaves the simulated light where it is.
                _ => {}
            },
            "VLV" => {
                if let Some(v) = fields.first().and_then(|f| f.parse::<u8>().ok()) {
                    if v == 1 {
                        self.valve_open = true;
                        self.valve_ticks = 0;
                    } else {
                        self.valve_open = false;
                        self.valve_ticks = 0;
                    }
                }
            }
            "FLG" => {
                if let Some(v) = fields.first().and_then(|f| f.parse::<u8>().ok()) {
                    if v & 0x01 != 0 && self.flags & 0x01 == 0 {
                        self.test_ticks_left = TEST_ACTIVE_TICKS;
                    }
                    self.flags = v;
                }
            }
            // LED detail messages have no observable effect on the status
            // stream, and EST is ignored just like the real firmware.
            _ => {}
        }
    }

    /// One 20 ms simulation step: servo motion, limit switch, valve
    /// watchdog, one emitted status line.
    fn step(&mut self) {
        for i in 0..NUM_SERVOS {
            self.servo_positions[i] =
                Self::move_toward(self.servo_positions[i], self.servo_targets[i], SERVO_STEP);
        }

        // Limit switch lives on the pan axis only.
        self.limit = if self.servo_positions[0] <= 5.0 {
            2 // CCW
        } else if self.servo_positions[0] >= 175.0 {
            1 // CW
        } else {
            0
        };

        if self.valve_open {
            self.valve_ticks += 1;
            if self.valve_ticks >= VALVE_WATCHDOG_TICKS {
                self.valve_open = false;
                self.valve_ticks = 0;
            }
        }

        let test_active = self.test_ticks_left > 0;
        self.test_ticks_left = self.test_ticks_left.saturating_sub(1);

        let mut rng = rand::thread_rng();
        let noise: [f32; NUM_SERVOS] = [
            rng.gen_range(-0.5..0.5),
            rng.gen_range(-0.5..0.5),
            rng.gen_range(-0.5..0.5),
        ];
        let status = format!(
            "$STS,{},{:.1},{:.1},{:.1},{},{},{},{},{},{}\n",
            self.limit,
            self.servo_positions[0] + noise[0],
            self.servo_positions[1] + noise[1],
            self.servo_positions[2] + noise[2],
            u8::from(self.light_on),
            self.flags,
            u8::from(test_active),
            u8::from(self.valve_open),
            1, // the firmware always reports the valve enabled
            self.valve_ticks * STATUS_INTERVAL.as_millis() as u32,
        );
        self.out.extend_from_slice(status.as_bytes());
    }

    /// Run however many simulation steps wall time owes us.
    fn pump(&mut self) {
        while self.last_status.elapsed() >= STATUS_INTERVAL {
            self.last_status += STATUS_INTERVAL;
            self.step();
        }
    }

    #[cfg(test)]
    fn step_n(&mut self, n: u32) {
        for _ in 0..n {
            self.step();
        }
    }

    #[cfg(test)]
    fn drain_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }
}

impl SerialLink for MockLink {
    fn bytes_to_read(&mut self) -> anyhow::Result<usize> {
        self.pump();
        Ok(self.out.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let n = self.out.len().min(buf.len());
        buf[..n].copy_from_slice(&self.out[..n]);
        self.out.drain(..n);
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if let Ok(text) = std::str::from_utf8(data) {
            for line in text.split_inclusive('\n') {
                self.handle_line(line);
            }
        }
        Ok(())
    }
}
