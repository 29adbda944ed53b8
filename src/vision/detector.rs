//! Frame and face-detection seams.
//!
//! The camera device and the ML face detector are external collaborators:
//! real deployments implement [`FrameSource`] and [`FaceDetector`] against
//! whatever capture stack and model they use. This module defines the
//! contract plus the synthetic pair used when running without hardware.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::time::{Duration, Instant};

use crate::config::{CameraConfig, TrackingConfig};
use crate::state::BBox;

/// One captured color frame, packed RGB8.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl Frame {
    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            width,
            height,
            rgb: vec![value; (width * height * 3) as usize],
        }
    }
}

/// One detected face with pose.
#[derive(Debug, Clone)]
pub struct FaceDetection {
    pub bbox: BBox,
    pub landmarks: Option<Vec<(f32, f32)>>,
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    pub is_facing: bool,
    pub confidence: f32,
}

/// Frame producer. Implementations block in `read_frame` at the camera's
/// native rate.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> anyhow::Result<Frame>;
}

/// Face detector. Must not be handed dark frames; the producer skips it when
/// the enclosure is closed.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &Frame) -> anyhow::Result<Vec<FaceDetection>>;
}

/// Single definition of "facing the camera": pose inside the configured
/// yaw/pitch limits.
pub fn facing_within(yaw: f32, pitch: f32, tracking: &TrackingConfig) -> bool {
    yaw.abs() < tracking.facing_yaw_limit && pitch.abs() < tracking.facing_pitch_limit
}

// ---------------------------------------------------------------------------
// Synthetic implementations for mock mode
// ---------------------------------------------------------------------------

/// How long the simulated enclosure stays dark and lit per cycle.
const SCENE_DARK: Duration = Duration::from_secs(6);
const SCENE_BRIGHT: Duration = Duration::from_secs(14);

/// Scripted camera: the enclosure door opens and closes on a fixed cycle,
/// frames pace at the configured fps.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    frame_interval: Duration,
    started: Instant,
    last_frame: Instant,
}

impl SyntheticCamera {
    pub fn new(camera: &CameraConfig) -> Self {
        let now = Instant::now();
        Self {
            width: camera.width,
            height: camera.height,
            frame_interval: Duration::from_secs_f32(1.0 / camera.fps.max(1) as f32),
            started: now,
            last_frame: now,
        }
    }

    fn bright_now(&self) -> bool {
        let cycle = SCENE_DARK + SCENE_BRIGHT;
        let phase = Duration::from_nanos(
            (self.started.elapsed().as_nanos() % cycle.as_nanos()) as u64,
        );
        phase >= SCENE_DARK
    }
}

impl FrameSource for SyntheticCamera {
    fn read_frame(&mut self) -> anyhow::Result<Frame> {
        // Pace like a real capture device.
        let next = self.last_frame + self.frame_interval;
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        }
        self.last_frame = Instant::now();

        let value = if self.bright_now() { 120 } else { 8 };
        Ok(Frame::filled(self.width, self.height, value))
    }
}

/// Scripted detector: while the scene is lit, one confident face sways
/// slowly across the frame so the pan servo has something to chase.
pub struct ScriptedDetector {
    started: Instant,
}

impl Default for ScriptedDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl FaceDetector for ScriptedDetector {
    fn detect(&mut self, frame: &Frame) -> anyhow::Result<Vec<FaceDetection>> {
        // Treat a dim frame as empty; the producer normally filters these out
        // already.
        if frame.rgb.first().copied().unwrap_or(0) < 40 {
            return Ok(Vec::new());
        }

        let t = self.started.elapsed().as_secs_f32();
        let center_x = 0.5 + 0.25 * (t * 0.4).sin();
        let w = (frame.width as f32 * 0.2) as u32;
        let h = (frame.height as f32 * 0.3) as u32;
        let x = (frame.width as f32 * center_x) as i32 - (w / 2) as i32;
        let y = (frame.height / 4) as i32;

        Ok(vec![FaceDetection {
            bbox: BBox { x, y, w, h },
            landmarks: None,
            yaw: 0.0,
            pitch: 0.0,
            roll: 0.0,
            is_facing: true,
            confidence: 0.9,
        }])
    }
}

/// Detector that never sees anyone. Handy for soak-testing the door logic.
pub struct NullDetector;

impl FaceDetector for NullDetector {
    fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Vec<FaceDetection>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facing_respects_both_axes() {
        let tracking = TrackingConfig::default();
        assert!(facing_within(0.0, 0.0, &tracking));
        assert!(facing_within(-14.9, 19.9, &tracking));
        assert!(!facing_within(15.0, 0.0, &tracking));
        assert!(!facing_within(0.0, -20.0, &tracking));
    }

    #[test]
    fn scripted_detector_sees_one_facing_face_in_light() {
        let mut detector = ScriptedDetector::new();
        let bright = Frame::filled(640, 480, 120);
        let faces = detector.detect(&bright).unwrap();
        assert_eq!(faces.len(), 1);
        assert!(faces[0].is_facing);
        assert!(faces[0].bbox.w >= 640 / 6);

        let dark = Frame::filled(640, 480, 8);
        assert!(detector.detect(&dark).unwrap().is_empty());
    }
}
