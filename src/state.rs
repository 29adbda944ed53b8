//! Thread-safe shared snapshot store.
//!
//! One coarse mutex guards the latest face snapshot, MCU telemetry, command
//! record and system counters. Writers replace whole records; readers get
//! independent copies, so no consumer ever observes a torn record or is
//! affected by later writes.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Local;

use crate::comm::protocol::{CommandRecord, LightCommand, LimitDirection, MatrixPattern,
                            NpmMode, NprMode, Rgb, RgbMode, StatusRecord, NUM_SERVOS};

const ERROR_RING_CAPACITY: usize = 10;

/// Face detection bounding box, source-frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BBox {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

/// Latest per-frame vision result.
#[derive(Debug, Clone, Default)]
pub struct FaceSnapshot {
    pub detected: bool,
    pub bbox: Option<BBox>,
    pub landmarks: Option<Vec<(f32, f32)>>,
    /// Pose angles in degrees.
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    pub is_facing: bool,
    pub confidence: f32,
    pub num_faces: usize,
    pub num_facing: usize,
    pub frame_width: u32,
    pub frame_height: u32,
    pub is_dark: bool,
    pub camera_connected: bool,
    pub timestamp: Option<Instant>,
}

impl FaceSnapshot {
    /// A face is worth steering toward only if it is close enough to fill
    /// `min_ratio` of the frame horizontally.
    pub fn trackable(&self, min_ratio: f32) -> bool {
        match (self.detected, self.bbox, self.frame_width) {
            (true, Some(bbox), w) if w > 0 => bbox.w as f32 / w as f32 >= min_ratio,
            _ => false,
        }
    }
}

/// Latest MCU telemetry, aged out by [`AppState::check_connection`].
#[derive(Debug, Clone)]
pub struct Telemetry {
    pub connected: bool,
    pub limit_triggered: bool,
    pub limit_direction: LimitDirection,
    pub servo_positions: [f32; NUM_SERVOS],
    pub light_on: bool,
    pub flags: u8,
    pub test_active: bool,
    pub valve_open: bool,
    pub valve_enabled: bool,
    pub valve_open_ms: u32,
    pub last_rx_time: Option<Instant>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            connected: false,
            limit_triggered: false,
            limit_direction: LimitDirection::None,
            servo_positions: [90.0; NUM_SERVOS],
            light_on: false,
            flags: 0,
            test_active: false,
            valve_open: false,
            valve_enabled: true,
            valve_open_ms: 0,
            last_rx_time: None,
        }
    }
}

impl Telemetry {
    fn apply_status(&mut self, status: &StatusRecord, now: Instant) {
        self.connected = true;
        self.limit_triggered = status.limit != LimitDirection::None;
        self.limit_direction = status.limit;
        self.servo_positions = status.servo_positions;
        self.light_on = status.light_on;
        self.flags = status.flags;
        self.test_active = status.test_active;
        self.valve_open = status.valve_open;
        self.valve_enabled = status.valve_enabled;
        self.valve_open_ms = status.valve_open_ms;
        self.last_rx_time = Some(now);
    }
}

/// Counters and diagnostics for the operator side.
#[derive(Debug, Clone, Default)]
pub struct SystemStats {
    pub fps: f32,
    pub tracker_fps: f32,
    pub uart_tx_count: u64,
    pub uart_rx_count: u64,
    pub uptime: Duration,
    pub errors: Vec<String>,
    pub last_tx_line: String,
    pub last_rx_line: String,
}

/// Partial command update, merged field-wise under the store lock. Used by
/// operator-side callers that adjust a few fields without rewriting the
/// record the state machine publishes.
#[derive(Debug, Clone, Default)]
pub struct CommandUpdate {
    pub servo_targets: Option<[f32; NUM_SERVOS]>,
    pub servo_target_1: Option<f32>,
    pub servo_target_2: Option<f32>,
    pub servo_target_3: Option<f32>,
    pub valve_open: Option<bool>,
    pub light_command: Option<LightCommand>,
    pub rgb_mode: Option<RgbMode>,
    pub rgb_primary: Option<Rgb>,
    pub rgb_secondary: Option<Rgb>,
    pub rgb_speed: Option<u8>,
    pub npm_mode: Option<NpmMode>,
    pub npm_letter: Option<char>,
    pub npm_primary: Option<Rgb>,
    pub npr_mode: Option<NprMode>,
    pub npr_primary: Option<Rgb>,
    pub matrix_left: Option<MatrixPattern>,
    pub matrix_right: Option<MatrixPattern>,
    pub flags: Option<u8>,
}

impl CommandUpdate {
    fn apply(&self, cmd: &mut CommandRecord) {
        if let Some(targets) = self.servo_targets {
            cmd.servo_targets = targets;
        } else {
            if let Some(t) = self.servo_target_1 {
                cmd.servo_targets[0] = t;
            }
            if let Some(t) = self.servo_target_2 {
                cmd.servo_targets[1] = t;
            }
            if let Some(t) = self.servo_target_3 {
                cmd.servo_targets[2] = t;
            }
        }
        if let Some(v) = self.valve_open {
            cmd.valve_open = v;
        }
        if let Some(v) = self.light_command {
            cmd.light_command = v;
        }
        if let Some(v) = self.rgb_mode {
            cmd.rgb_mode = v;
        }
        if let Some(v) = self.rgb_primary {
            cmd.rgb_primary = v;
        }
        if let Some(v) = self.rgb_secondary {
            cmd.rgb_secondary = v;
        }
        if let Some(v) = self.rgb_speed {
            cmd.rgb_speed = v;
        }
        if let Some(v) = self.npm_mode {
            cmd.npm_mode = v;
        }
        if let Some(v) = self.npm_letter {
            cmd.npm_letter = v;
        }
        if let Some(v) = self.npm_primary {
            cmd.npm_primary = v;
        }
        if let Some(v) = self.npr_mode {
            cmd.npr_mode = v;
        }
        if let Some(v) = self.npr_primary {
            cmd.npr_primary = v;
        }
        if let Some(v) = self.matrix_left {
            cmd.matrix_left = v;
        }
        if let Some(v) = self.matrix_right {
            cmd.matrix_right = v;
        }
        if let Some(v) = self.flags {
            cmd.flags = v;
        }
    }
}

struct Inner {
    face: FaceSnapshot,
    telemetry: Telemetry,
    command: CommandRecord,
    fps: f32,
    tracker_fps: f32,
    uart_tx_count: u64,
    uart_rx_count: u64,
    errors: VecDeque<String>,
    last_tx_line: String,
    last_rx_line: String,
    start_time: Instant,
}

/// The shared snapshot store. Producers replace records; consumers copy them
/// out. This is the only multi-writer object in the process.
pub struct AppState {
    inner: Mutex<Inner>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                face: FaceSnapshot::default(),
                telemetry: Telemetry::default(),
                command: CommandRecord::default(),
                fps: 0.0,
                tracker_fps: 0.0,
                uart_tx_count: 0,
                uart_rx_count: 0,
                errors: VecDeque::with_capacity(ERROR_RING_CAPACITY),
                last_tx_line: String::new(),
                last_rx_line: String::new(),
                start_time: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means another worker already panicked; the data is
        // plain-old-state, so keep serving it rather than cascade.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put_face(&self, face: FaceSnapshot) {
        self.lock().face = face;
    }

    pub fn get_face(&self) -> FaceSnapshot {
        self.lock().face.clone()
    }

    /// Store a decoded status packet, bumping the RX counter and the last-RX
    /// display line.
    pub fn put_telemetry(&self, status: &StatusRecord) {
        let mut inner = self.lock();
        inner.telemetry.apply_status(status, Instant::now());
        inner.uart_rx_count += 1;
        inner.last_rx_line = status.canonical_line();
    }

    pub fn get_telemetry(&self) -> Telemetry {
        self.lock().telemetry.clone()
    }

    /// Age out the connection if no packet arrived inside `timeout`.
    pub fn check_connection(&self, timeout: Duration) {
        let mut inner = self.lock();
        let stale = match inner.telemetry.last_rx_time {
            Some(t) => t.elapsed() > timeout,
            None => true,
        };
        if stale {
            inner.telemetry.connected = false;
        }
    }

    pub fn put_command(&self, command: CommandRecord) {
        self.lock().command = command;
    }

    pub fn merge_command(&self, update: &CommandUpdate) {
        update.apply(&mut self.lock().command);
    }

    pub fn get_command(&self) -> CommandRecord {
        self.lock().command.clone()
    }

    pub fn set_command_flag(&self, flag: u8) {
        self.lock().command.flags |= flag;
    }

    pub fn clear_command_flag(&self, flag: u8) {
        self.lock().command.flags &= !flag;
    }

    /// Count one transmitted line and remember it for the operator display.
    pub fn bump_tx(&self, line: &str) {
        let mut inner = self.lock();
        inner.uart_tx_count += 1;
        inner.last_tx_line = line.trim_end().to_string();
    }

    /// Append to the bounded error ring (oldest entries drop first).
    pub fn add_error(&self, message: &str) {
        let mut inner = self.lock();
        let stamped = format!("{} - {}", Local::now().format("%H:%M:%S"), message);
        if inner.errors.len() == ERROR_RING_CAPACITY {
            inner.errors.pop_front();
        }
        inner.errors.push_back(stamped);
    }

    pub fn update_fps(&self, fps: f32, tracker_fps: f32) {
        let mut inner = self.lock();
        inner.fps = fps;
        if tracker_fps > 0.0 {
            inner.tracker_fps = tracker_fps;
        }
    }

    pub fn get_stats(&self) -> SystemStats {
        let inner = self.lock();
        SystemStats {
            fps: inner.fps,
            tracker_fps: inner.tracker_fps,
            uart_tx_count: inner.uart_tx_count,
            uart_rx_count: inner.uart_rx_count,
            uptime: inner.start_time.elapsed(),
            errors: inner.errors.iter().cloned().collect(),
            last_tx_line: inner.last_tx_line.clone(),
            last_rx_line: inner.last_rx_line.clone(),
        }
    }
}
