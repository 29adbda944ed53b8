//! Command emission per session state.
//!
//! Each builder produces the complete actuator record for one tick; the
//! state machine only decides which builder runs and with what servo
//! targets.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::comm::protocol::{
    CommandRecord, LightCommand, MatrixPattern, NpmMode, NprMode, Rgb, RgbMode, NUM_SERVOS,
};

pub const GREEN: Rgb = Rgb::new(0, 255, 0);
pub const YELLOW_GREEN: Rgb = Rgb::new(150, 255, 0);
pub const AQUA: Rgb = Rgb::new(0, 255, 255);
pub const DIM_AQUA: Rgb = Rgb::new(0, 50, 50);
pub const RED: Rgb = Rgb::new(255, 0, 0);
pub const DIM_RED: Rgb = Rgb::new(60, 0, 0);

fn base(servos: [f32; NUM_SERVOS]) -> CommandRecord {
    CommandRecord {
        servo_targets: servos,
        ..CommandRecord::default()
    }
}

/// Enclosure closed: everything parked and dark.
pub fn inactive() -> CommandRecord {
    CommandRecord {
        light_command: LightCommand::Off,
        ..CommandRecord::default()
    }
}

/// Quantum-collapse show: rainbow on every pixel surface.
pub fn collapse() -> CommandRecord {
    let mut cmd = base([90.0; NUM_SERVOS]);
    cmd.rgb_mode = RgbMode::Rainbow;
    cmd.npm_mode = NpmMode::Rainbow;
    cmd.npr_mode = NprMode::Rainbow;
    cmd.matrix_left = MatrixPattern::Circle;
    cmd.matrix_right = MatrixPattern::Circle;
    cmd
}

fn alive_look(servos: [f32; NUM_SERVOS], color: Rgb) -> CommandRecord {
    let mut cmd = base(servos);
    cmd.npm_mode = NpmMode::EyeOpen;
    cmd.npm_primary = color;
    cmd.npr_mode = NprMode::Solid;
    cmd.npr_primary = color;
    cmd.rgb_mode = RgbMode::Solid;
    cmd.rgb_primary = color;
    cmd.matrix_left = MatrixPattern::Circle;
    cmd.matrix_right = MatrixPattern::Circle;
    cmd
}

/// First seconds of ALIVE: greeting wave, green eyes.
pub fn alive_entry(servos: [f32; NUM_SERVOS]) -> CommandRecord {
    alive_look(servos, GREEN)
}

/// Someone trackable in frame. Green while they face the cat, yellow-green
/// otherwise.
pub fn alive_detected(servos: [f32; NUM_SERVOS], facing: bool) -> CommandRecord {
    alive_look(servos, if facing { GREEN } else { YELLOW_GREEN })
}

/// Nobody close enough: drowsy idle.
pub fn alive_idle(servos: [f32; NUM_SERVOS]) -> CommandRecord {
    let mut cmd = base(servos);
    cmd.npm_mode = NpmMode::EyeClosed;
    cmd.npm_primary = DIM_AQUA;
    cmd.npr_mode = NprMode::Breathe;
    cmd.npr_primary = AQUA;
    cmd.rgb_mode = RgbMode::Solid;
    cmd.rgb_primary = DIM_AQUA;
    cmd.matrix_left = MatrixPattern::Circle;
    cmd.matrix_right = MatrixPattern::Circle;
    cmd
}

/// Pour window: aqua flash while the valve runs, flash continues after.
pub fn alive_dispensing(servos: [f32; NUM_SERVOS], valve_open: bool, lit: bool) -> CommandRecord {
    let color = if lit { AQUA } else { Rgb::OFF };
    let mut cmd = alive_look(servos, color);
    cmd.valve_open = valve_open;
    cmd
}

/// Second pour attempt in one session: red flash and a head shake.
pub fn alive_reject(servos: [f32; NUM_SERVOS], lit: bool) -> CommandRecord {
    let color = if lit { RED } else { Rgb::OFF };
    let mut cmd = base(servos);
    cmd.npm_mode = NpmMode::X;
    cmd.npm_primary = color;
    cmd.npr_mode = NprMode::Solid;
    cmd.npr_primary = color;
    cmd.rgb_mode = RgbMode::Solid;
    cmd.rgb_primary = color;
    cmd.matrix_left = MatrixPattern::Circle;
    cmd.matrix_right = MatrixPattern::Circle;
    cmd
}

/// The cat is dead; nothing pours.
pub fn dead_normal(servos: [f32; NUM_SERVOS]) -> CommandRecord {
    let mut cmd = base(servos);
    cmd.npm_mode = NpmMode::X;
    cmd.npm_primary = RED;
    cmd.npr_mode = NprMode::Solid;
    cmd.npr_primary = RED;
    cmd.rgb_mode = RgbMode::Solid;
    cmd.rgb_primary = DIM_RED;
    cmd.matrix_left = MatrixPattern::X;
    cmd.matrix_right = MatrixPattern::X;
    cmd
}

/// Cup pressed against a dead cat: flashing refusal.
pub fn dead_reject(servos: [f32; NUM_SERVOS], lit: bool) -> CommandRecord {
    let color = if lit { RED } else { Rgb::OFF };
    let mut cmd = base(servos);
    cmd.npm_mode = NpmMode::X;
    cmd.npm_primary = color;
    cmd.npr_mode = NprMode::Solid;
    cmd.npr_primary = color;
    cmd.rgb_mode = RgbMode::Solid;
    cmd.rgb_primary = color;
    cmd.matrix_left = MatrixPattern::X;
    cmd.matrix_right = MatrixPattern::X;
    cmd
}

/// MCU link lost: everything parked, red distress flash.
pub fn fault(lit: bool) -> CommandRecord {
    let color = if lit { RED } else { Rgb::OFF };
    let mut cmd = base([90.0; NUM_SERVOS]);
    cmd.npm_mode = NpmMode::X;
    cmd.npm_primary = color;
    cmd.npr_mode = NprMode::Solid;
    cmd.npr_primary = color;
    cmd.rgb_mode = RgbMode::Solid;
    cmd.rgb_primary = color;
    cmd.matrix_left = MatrixPattern::X;
    cmd.matrix_right = MatrixPattern::X;
    cmd
}
