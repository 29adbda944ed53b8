//! Runtime configuration.
//!
//! All tunables live in one immutable [`Config`] value built at startup and
//! passed by reference to every component. Defaults cover a bench setup with
//! the simulated camera and MCU; a TOML overlay file can override any subset
//! of fields per machine.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub darkness: DarknessConfig,
    pub serial: SerialConfig,
    pub tracking: TrackingConfig,
    pub session: SessionConfig,
    pub animation: AnimationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            darkness: DarknessConfig::default(),
            serial: SerialConfig::default(),
            tracking: TrackingConfig::default(),
            session: SessionConfig::default(),
            animation: AnimationConfig::default(),
        }
    }
}

impl Config {
    /// Load defaults, overlaid with the TOML file at `path` if it exists.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            info!("No config file at {path}, using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("could not read config file {path}"))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("could not parse {path}"))?;
        info!("Loaded config overlay from {path}");
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Consecutive read failures tolerated before the camera is reported
    /// disconnected.
    pub failure_tolerance: u32,
    /// Use the in-process synthetic frame source instead of real hardware.
    pub mock: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: 640,
            height: 480,
            fps: 30,
            failure_tolerance: 30,
            mock: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DarknessConfig {
    /// A frame is dark when its brightness percentile falls below this.
    pub threshold: f32,
    /// Which luma percentile stands in for scene brightness. Percentile
    /// rather than mean so small bright LED spots inside the closed
    /// enclosure don't defeat the check.
    pub percentile: f32,
    /// Additionally require low luma spread, to tell a uniformly dark closed
    /// box apart from a varied dim scene.
    pub variance_check: bool,
    pub variance_threshold: f32,
}

impl Default for DarknessConfig {
    fn default() -> Self {
        Self {
            threshold: 40.0,
            percentile: 75.0,
            variance_check: true,
            variance_threshold: 40.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial device path. Autodetected when unset.
    pub port: Option<String>,
    pub baud: u32,
    pub tx_rate_hz: f32,
    pub connection_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub max_connect_attempts: u32,
    /// Use the in-process MCU simulator instead of a real port.
    pub mock: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud: 115_200,
            tx_rate_hz: 30.0,
            connection_timeout_ms: 500,
            io_timeout_ms: 10,
            max_connect_attempts: 10,
            mock: true,
        }
    }
}

impl SerialConfig {
    pub fn tx_interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.tx_rate_hz)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Proportional gain from horizontal face error to pan velocity.
    pub gain: f32,
    /// Horizontal error band (fraction of frame width) treated as centered.
    pub deadzone: f32,
    /// Degrees per tick.
    pub min_velocity: f32,
    pub max_velocity: f32,
    /// Faces narrower than this fraction of the frame are too far away to
    /// track.
    pub min_face_width_ratio: f32,
    /// Pose limits for the "facing the camera" judgement, degrees.
    pub facing_yaw_limit: f32,
    pub facing_pitch_limit: f32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            gain: 0.5,
            deadzone: 0.05,
            min_velocity: 0.5,
            max_velocity: 3.0,
            min_face_width_ratio: 0.06,
            facing_yaw_limit: 15.0,
            facing_pitch_limit: 20.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub tick_hz: f32,
    pub collapse_secs: f32,
    pub alive_entry_secs: f32,
    pub dead_entry_secs: f32,
    /// Sustained light needed to leave INACTIVE.
    pub light_to_collapse_secs: f32,
    /// Sustained darkness needed to end a session.
    pub dark_to_inactive_secs: f32,
    /// How long the cup must sit on the limit switch before pouring.
    pub dispense_hold_secs: f32,
    /// Valve-open time for one pour. Must stay at or below the MCU's 5 s
    /// valve watchdog.
    pub pour_secs: f32,
    pub dispense_flash_secs: f32,
    pub reject_flash_secs: f32,
    pub alive_probability: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_hz: 30.0,
            collapse_secs: 2.0,
            alive_entry_secs: 2.0,
            dead_entry_secs: 2.0,
            light_to_collapse_secs: 1.0,
            dark_to_inactive_secs: 2.0,
            dispense_hold_secs: 1.0,
            pour_secs: 3.0,
            dispense_flash_secs: 5.0,
            reject_flash_secs: 3.0,
            alive_probability: 0.5,
        }
    }
}

impl SessionConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.tick_hz)
    }

    pub fn collapse_duration(&self) -> Duration {
        Duration::from_secs_f32(self.collapse_secs)
    }

    pub fn alive_entry_duration(&self) -> Duration {
        Duration::from_secs_f32(self.alive_entry_secs)
    }

    pub fn dead_entry_duration(&self) -> Duration {
        Duration::from_secs_f32(self.dead_entry_secs)
    }

    pub fn light_to_collapse(&self) -> Duration {
        Duration::from_secs_f32(self.light_to_collapse_secs)
    }

    pub fn dark_to_inactive(&self) -> Duration {
        Duration::from_secs_f32(self.dark_to_inactive_secs)
    }

    pub fn dispense_hold(&self) -> Duration {
        Duration::from_secs_f32(self.dispense_hold_secs)
    }

    pub fn pour_duration(&self) -> Duration {
        Duration::from_secs_f32(self.pour_secs)
    }

    pub fn dispense_flash(&self) -> Duration {
        Duration::from_secs_f32(self.dispense_flash_secs)
    }

    pub fn reject_flash(&self) -> Duration {
        Duration::from_secs_f32(self.reject_flash_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnimationConfig {
    pub wave_min: f32,
    pub wave_max: f32,
    /// Degrees per tick.
    pub wave_speed: f32,
    pub wave_interval_secs: f32,
    pub shake_speed: f32,
    pub shake_range: f32,
    pub flash_hz: f32,
    /// Recentering speed while idle, degrees per tick.
    pub drift_speed: f32,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            wave_min: 45.0,
            wave_max: 135.0,
            wave_speed: 4.0,
            wave_interval_secs: 4.0,
            shake_speed: 15.0,
            shake_range: 30.0,
            flash_hz: 8.0,
            drift_speed: 2.0,
        }
    }
}

impl AnimationConfig {
    pub fn wave_interval(&self) -> Duration {
        Duration::from_secs_f32(self.wave_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.serial.baud, 115_200);
        assert_eq!(cfg.serial.connection_timeout_ms, 500);
        assert!((cfg.session.light_to_collapse_secs - 1.0).abs() < f32::EPSILON);
        assert!((cfg.session.dark_to_inactive_secs - 2.0).abs() < f32::EPSILON);
        assert!((cfg.tracking.min_face_width_ratio - 0.06).abs() < f32::EPSILON);
        assert!(cfg.session.pour_secs <= 5.0, "pour must fit the MCU valve watchdog");
    }

    #[test]
    fn partial_overlay_keeps_other_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [serial]
            mock = false
            port = "/dev/ttyUSB1"

            [session]
            pour_secs = 2.5
            "#,
        )
        .unwrap();
        assert!(!cfg.serial.mock);
        assert_eq!(cfg.serial.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(cfg.serial.baud, 115_200);
        assert!((cfg.session.pour_secs - 2.5).abs() < f32::EPSILON);
        assert!((cfg.session.collapse_secs - 2.0).abs() < f32::EPSILON);
        assert!(cfg.camera.mock);
    }
}
