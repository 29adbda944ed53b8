//! UART wire protocol: outbound command encoding, inbound status framing.
//!
//! Every message is one ASCII line: `$` + three-letter tag + comma-separated
//! fields + `\n`, at most [`MAX_PACKET_SIZE`] bytes. The host sends one line
//! per message kind; the MCU answers with `$STS` lines.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt::Write as _;

pub const NUM_SERVOS: usize = 3;
pub const MAX_PACKET_SIZE: usize = 128;

const START_MARKER: u8 = b'$';
const END_MARKER: u8 = b'\n';

/// Command flag bit 0: run the MCU's LED blink test.
pub const CMD_FLAG_LED_TEST: u8 = 0x01;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("line is not a status packet")]
    NotStatus,
    #[error("expected 6 to 10 status fields, got {0}")]
    FieldCount(usize),
    #[error("malformed {kind} field `{text}`")]
    BadField { kind: &'static str, text: String },
}

// ---------------------------------------------------------------------------
// Wire enums. Inbound integers are validated here; nothing downstream sees a
// raw mode number.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitDirection {
    #[default]
    None,
    Cw,
    Ccw,
}

impl LimitDirection {
    pub fn from_wire(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Cw),
            2 => Some(Self::Ccw),
            _ => None,
        }
    }

    pub fn wire(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Cw => 1,
            Self::Ccw => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LightCommand {
    Off,
    On,
    #[default]
    Auto,
}

impl LightCommand {
    pub fn wire(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::On => 1,
            Self::Auto => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RgbMode {
    #[default]
    Solid,
    Rainbow,
    Gradient,
}

impl RgbMode {
    pub fn wire(self) -> u8 {
        match self {
            Self::Solid => 0,
            Self::Rainbow => 1,
            Self::Gradient => 2,
        }
    }
}

/// 5x5 NeoPixel matrix modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NpmMode {
    #[default]
    Off,
    Letter,
    /// Reserved in the firmware, unused by the host.
    Scroll,
    Rainbow,
    Solid,
    EyeClosed,
    EyeOpen,
    Circle,
    X,
    Gradient,
}

impl NpmMode {
    pub fn wire(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Letter => 1,
            Self::Scroll => 2,
            Self::Rainbow => 3,
            Self::Solid => 4,
            Self::EyeClosed => 5,
            Self::EyeOpen => 6,
            Self::Circle => 7,
            Self::X => 8,
            Self::Gradient => 9,
        }
    }
}

/// NeoPixel ring modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NprMode {
    #[default]
    Off,
    Solid,
    Rainbow,
    Chase,
    Breathe,
    Spinner,
    Gradient,
}

impl NprMode {
    pub fn wire(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Solid => 1,
            Self::Rainbow => 2,
            Self::Chase => 3,
            Self::Breathe => 4,
            Self::Spinner => 5,
            Self::Gradient => 6,
        }
    }
}

/// MAX7219 eye patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatrixPattern {
    #[default]
    Off,
    Circle,
    X,
}

impl MatrixPattern {
    pub fn wire(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Circle => 1,
            Self::X => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub const OFF: Rgb = Rgb::new(0, 0, 0);
}

// ---------------------------------------------------------------------------
// Outbound command record
// ---------------------------------------------------------------------------

/// Full actuator command set, produced once per state-machine tick.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub servo_targets: [f32; NUM_SERVOS],
    pub valve_open: bool,
    pub light_command: LightCommand,
    pub rgb_mode: RgbMode,
    pub rgb_primary: Rgb,
    pub rgb_secondary: Rgb,
    pub rgb_speed: u8,
    pub npm_mode: NpmMode,
    pub npm_letter: char,
    pub npm_primary: Rgb,
    pub npm_secondary: Rgb,
    pub npm_speed: u8,
    pub npr_mode: NprMode,
    pub npr_primary: Rgb,
    pub npr_secondary: Rgb,
    pub npr_speed: u8,
    pub matrix_left: MatrixPattern,
    pub matrix_right: MatrixPattern,
    pub flags: u8,
    /// Payload of the deprecated `$EST` message. The MCU ignores it; the
    /// real interlock is host-side.
    pub emergency_stop: bool,
}

impl Default for CommandRecord {
    fn default() -> Self {
        Self {
            servo_targets: [90.0; NUM_SERVOS],
            valve_open: false,
            light_command: LightCommand::Auto,
            rgb_mode: RgbMode::Solid,
            rgb_primary: Rgb::OFF,
            rgb_secondary: Rgb::OFF,
            rgb_speed: 10,
            npm_mode: NpmMode::Off,
            npm_letter: 'A',
            npm_primary: Rgb::OFF,
            npm_secondary: Rgb::OFF,
            npm_speed: 10,
            npr_mode: NprMode::Off,
            npr_primary: Rgb::OFF,
            npr_secondary: Rgb::OFF,
            npr_speed: 10,
            matrix_left: MatrixPattern::Off,
            matrix_right: MatrixPattern::Off,
            flags: 0,
            emergency_stop: false,
        }
    }
}

fn clamp_servo(angle: f32) -> f32 {
    angle.clamp(0.0, 180.0)
}

fn clamp_speed(speed: u8) -> u8 {
    speed.clamp(1, 50)
}

impl CommandRecord {
    /// Safe shutdown posture: everything centered, closed and dark.
    pub fn safe() -> Self {
        Self {
            light_command: LightCommand::Off,
            ..Self::default()
        }
    }

    /// `$SRV` heartbeat, sent every transmit period.
    pub fn encode_srv(&self) -> String {
        format!(
            "$SRV,{:.1},{:.1},{:.1}\n",
            clamp_servo(self.servo_targets[0]),
            clamp_servo(self.servo_targets[1]),
            clamp_servo(self.servo_targets[2]),
        )
    }

    pub fn encode_lgt(&self) -> String {
        format!("$LGT,{}\n", self.light_command.wire())
    }

    pub fn encode_vlv(&self) -> String {
        format!("$VLV,{}\n", u8::from(self.valve_open))
    }

    pub fn encode_flg(&self) -> String {
        format!("$FLG,{}\n", self.flags)
    }

    pub fn encode_est(&self) -> String {
        format!("$EST,{}\n", u8::from(self.emergency_stop))
    }

    pub fn encode_mtx(&self) -> String {
        format!(
            "$MTX,{},{}\n",
            self.matrix_left.wire(),
            self.matrix_right.wire()
        )
    }

    pub fn encode_rgb(&self) -> String {
        let mut line = format!(
            "$RGB,{},{},{},{}",
            self.rgb_mode.wire(),
            self.rgb_primary.r,
            self.rgb_primary.g,
            self.rgb_primary.b,
        );
        if self.rgb_mode == RgbMode::Gradient {
            let _ = write!(
                line,
                ",{},{},{},{}",
                self.rgb_secondary.r,
                self.rgb_secondary.g,
                self.rgb_secondary.b,
                clamp_speed(self.rgb_speed),
            );
        }
        line.push('\n');
        line
    }

    pub fn encode_npm(&self) -> String {
        let mut line = format!(
            "$NPM,{},{},{},{},{}",
            self.npm_mode.wire(),
            self.npm_letter,
            self.npm_primary.r,
            self.npm_primary.g,
            self.npm_primary.b,
        );
        if self.npm_mode == NpmMode::Gradient {
            let _ = write!(
                line,
                ",{},{},{},{}",
                self.npm_secondary.r,
                self.npm_secondary.g,
                self.npm_secondary.b,
                clamp_speed(self.npm_speed),
            );
        }
        line.push('\n');
        line
    }

    pub fn encode_npr(&self) -> String {
        let mut line = format!(
            "$NPR,{},{},{},{}",
            self.npr_mode.wire(),
            self.npr_primary.r,
            self.npr_primary.g,
            self.npr_primary.b,
        );
        if self.npr_mode == NprMode::Gradient {
            let _ = write!(
                line,
                ",{},{},{},{}",
                self.npr_secondary.r,
                self.npr_secondary.g,
                self.npr_secondary.b,
                clamp_speed(self.npr_speed),
            );
        }
        line.push('\n');
        line
    }
}

// ---------------------------------------------------------------------------
// Inbound status record
// ---------------------------------------------------------------------------

/// One decoded `$STS` line from the MCU.
///
/// `$STS,limit,s1,s2,s3,light,flags[,test,valve_open,valve_enabled,valve_ms]`
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord {
    pub limit: LimitDirection,
    pub servo_positions: [f32; NUM_SERVOS],
    pub light_on: bool,
    pub flags: u8,
    pub test_active: bool,
    pub valve_open: bool,
    pub valve_enabled: bool,
    pub valve_open_ms: u32,
}

fn parse_int(kind: &'static str, text: &str) -> Result<i64, ProtocolError> {
    text.trim().parse().map_err(|_| ProtocolError::BadField {
        kind,
        text: text.to_string(),
    })
}

fn parse_float(kind: &'static str, text: &str) -> Result<f32, ProtocolError> {
    text.trim().parse().map_err(|_| ProtocolError::BadField {
        kind,
        text: text.to_string(),
    })
}

impl StatusRecord {
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let line = std::str::from_utf8(data).map_err(|_| ProtocolError::NotStatus)?;
        let content = line
            .trim()
            .strip_prefix("$STS,")
            .ok_or(ProtocolError::NotStatus)?;

        let fields: Vec<&str> = content.split(',').collect();
        if !(6..=10).contains(&fields.len()) {
            return Err(ProtocolError::FieldCount(fields.len()));
        }

        let limit_raw = parse_int("limit", fields[0])?;
        let limit = LimitDirection::from_wire(limit_raw).ok_or(ProtocolError::BadField {
            kind: "limit",
            text: fields[0].to_string(),
        })?;

        let servo_positions = [
            parse_float("servo", fields[1])?,
            parse_float("servo", fields[2])?,
            parse_float("servo", fields[3])?,
        ];

        let light_on = parse_int("light", fields[4])? != 0;
        let flags = parse_int("flags", fields[5])? as u8;

        // Fields 6..=9 are optional for older firmware.
        let test_active = match fields.get(6) {
            Some(f) => parse_int("test", f)? != 0,
            None => false,
        };
        let valve_open = match fields.get(7) {
            Some(f) => parse_int("valve_open", f)? != 0,
            None => false,
        };
        let valve_enabled = match fields.get(8) {
            Some(f) => parse_int("valve_enabled", f)? != 0,
            None => true,
        };
        let valve_open_ms = match fields.get(9) {
            Some(f) => parse_int("valve_ms", f)? as u32,
            None => 0,
        };

        Ok(Self {
            limit,
            servo_positions,
            light_on,
            flags,
            test_active,
            valve_open,
            valve_enabled,
            valve_open_ms,
        })
    }

    /// Canonical single-line rendering, used for the "last RX" display.
    pub fn canonical_line(&self) -> String {
        format!(
            "$STS,{},{:.1},{:.1},{:.1},{},{},{},{},{},{}",
            self.limit.wire(),
            self.servo_positions[0],
            self.servo_positions[1],
            self.servo_positions[2],
            u8::from(self.light_on),
            self.flags,
            u8::from(self.test_active),
            u8::from(self.valve_open),
            u8::from(self.valve_enabled),
            self.valve_open_ms,
        )
    }
}

// ---------------------------------------------------------------------------
// Framer
// ---------------------------------------------------------------------------

/// Rolling receive buffer that slices the byte stream into `$…\n` frames.
///
/// Garbage ahead of a `$` is only dropped once a complete frame behind it is
/// extracted; an oversized buffer is trimmed back to its last `$` so a noisy
/// line can never wedge the decoder permanently.
#[derive(Default)]
pub struct Framer {
    rx_buffer: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.rx_buffer.clear();
    }

    #[cfg(test)]
    fn buffered(&self) -> &[u8] {
        &self.rx_buffer
    }

    /// Feed a chunk of received bytes, returning every status record that
    /// completed. Malformed frames are logged and skipped.
    pub fn feed(&mut self, data: &[u8]) -> Vec<StatusRecord> {
        self.rx_buffer.extend_from_slice(data);

        if self.rx_buffer.len() > MAX_PACKET_SIZE * 2 {
            match self.rx_buffer.iter().rposition(|&b| b == START_MARKER) {
                Some(last_start) => {
                    self.rx_buffer.drain(..last_start);
                }
                None => self.rx_buffer.clear(),
            }
        }

        let mut records = Vec::new();
        loop {
            let Some(start) = self.rx_buffer.iter().position(|&b| b == START_MARKER) else {
                // Nothing but garbage.
                self.rx_buffer.clear();
                break;
            };
            let Some(end) = self.rx_buffer[start..]
                .iter()
                .position(|&b| b == END_MARKER)
                .map(|rel| start + rel)
            else {
                // Incomplete frame, wait for more bytes.
                break;
            };

            let frame: Vec<u8> = self.rx_buffer[start..=end].to_vec();
            self.rx_buffer.drain(..=end);

            match StatusRecord::decode(&frame) {
                Ok(record) => records.push(record),
                Err(e) => debug!("Discarding frame: {e}"),
            }
        }
        records
    }
}
