//! Vision producer thread.
//!
//! Owns the camera. Each frame is checked for darkness first; only lit
//! frames reach the face detector. Results land in the snapshot store as a
//! whole [`FaceSnapshot`], never mutated downstream.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{Config, DarknessConfig};
use crate::state::{AppState, FaceSnapshot};
use crate::vision::detector::{FaceDetection, FaceDetector, Frame, FrameSource};

/// Luma percentile and spread of one frame.
pub(crate) fn darkness_metrics(frame: &Frame, percentile: f32) -> (f32, f32) {
    let mut histogram = [0u64; 256];
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0u64;

    for px in frame.rgb.chunks_exact(3) {
        // ITU-R BT.601 luma weights.
        let luma = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
        let bin = luma.round().clamp(0.0, 255.0) as usize;
        histogram[bin] += 1;
        sum += luma as f64;
        sum_sq += (luma as f64) * (luma as f64);
        count += 1;
    }

    if count == 0 {
        return (0.0, 0.0);
    }

    let rank = ((percentile / 100.0) as f64 * count as f64).ceil() as u64;
    let mut seen = 0u64;
    let mut percentile_value = 255.0;
    for (value, &n) in histogram.iter().enumerate() {
        seen += n;
        if seen >= rank.max(1) {
            percentile_value = value as f32;
            break;
        }
    }

    let mean = sum / count as f64;
    let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
    (percentile_value, variance.sqrt() as f32)
}

pub(crate) fn is_dark(frame: &Frame, darkness: &DarknessConfig) -> bool {
    let (p, sigma) = darkness_metrics(frame, darkness.percentile);
    p < darkness.threshold && (!darkness.variance_check || sigma < darkness.variance_threshold)
}

/// Pick the face the fixture should react to: the widest one in frame.
fn primary_face(faces: &[FaceDetection]) -> Option<&FaceDetection> {
    faces.iter().max_by_key(|f| f.bbox.w)
}

fn snapshot_from_detections(frame: &Frame, faces: &[FaceDetection]) -> FaceSnapshot {
    let mut snapshot = FaceSnapshot {
        camera_connected: true,
        frame_width: frame.width,
        frame_height: frame.height,
        num_faces: faces.len(),
        num_facing: faces.iter().filter(|f| f.is_facing).count(),
        timestamp: Some(Instant::now()),
        ..FaceSnapshot::default()
    };
    if let Some(face) = primary_face(faces) {
        snapshot.detected = true;
        snapshot.bbox = Some(face.bbox);
        snapshot.landmarks = face.landmarks.clone();
        snapshot.yaw = face.yaw;
        snapshot.pitch = face.pitch;
        snapshot.roll = face.roll;
        snapshot.is_facing = face.is_facing;
        snapshot.confidence = face.confidence;
    }
    snapshot
}

pub fn spawn(
    state: Arc<AppState>,
    config: Arc<Config>,
    stop: Arc<AtomicBool>,
    source: Box<dyn FrameSource>,
    detector: Box<dyn FaceDetector>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || run(state, config, stop, source, detector))
}

fn run(
    state: Arc<AppState>,
    config: Arc<Config>,
    stop: Arc<AtomicBool>,
    mut source: Box<dyn FrameSource>,
    mut detector: Box<dyn FaceDetector>,
) {
    info!("Vision thread starting");

    let mut consecutive_failures: u32 = 0;
    let mut fps_times: VecDeque<Instant> = VecDeque::new();

    while !stop.load(Ordering::Relaxed) {
        let frame = match source.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures == config.camera.failure_tolerance {
                    error!("Camera read failing persistently: {e}");
                    state.add_error(&format!("Camera read failure: {e}"));
                }
                if consecutive_failures >= config.camera.failure_tolerance {
                    state.put_face(FaceSnapshot {
                        camera_connected: false,
                        ..FaceSnapshot::default()
                    });
                } else {
                    warn!("Failed to capture frame: {e}");
                }
                thread::sleep(Duration::from_millis(10));
                continue;
            }
        };
        consecutive_failures = 0;

        if is_dark(&frame, &config.darkness) {
            state.put_face(FaceSnapshot {
                is_dark: true,
                camera_connected: true,
                frame_width: frame.width,
                frame_height: frame.height,
                timestamp: Some(Instant::now()),
                ..FaceSnapshot::default()
            });
        } else {
            match detector.detect(&frame) {
                Ok(faces) => state.put_face(snapshot_from_detections(&frame, &faces)),
                Err(e) => {
                    warn!("Detector error: {e}");
                    state.add_error(&format!("Detector error: {e}"));
                    state.put_face(FaceSnapshot {
                        camera_connected: true,
                        frame_width: frame.width,
                        frame_height: frame.height,
                        timestamp: Some(Instant::now()),
                        ..FaceSnapshot::default()
                    });
                }
            }
        }

        // Rolling one-second FPS window.
        let now = Instant::now();
        fps_times.push_back(now);
        while fps_times
            .front()
            .is_some_and(|t| now.duration_since(*t) > Duration::from_secs(1))
        {
            fps_times.pop_front();
        }
        if fps_times.len() > 1 {
            let span = fps_times
                .back()
                .unwrap()
                .duration_since(*fps_times.front().unwrap())
                .as_secs_f32();
            if span > 0.0 {
                let fps = fps_times.len() as f32 / span;
                state.update_fps(fps, fps);
            }
        }
    }

    info!("Vision thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::BBox;

    fn uniform(value: u8) -> Frame {
        Frame::filled(64, 48, value)
    }

    /// 90% of pixels at `low`, 10% at `high`.
    fn bimodal(low: u8, high: u8) -> Frame {
        let mut frame = Frame::filled(64, 48, low);
        let total = 64 * 48;
        for i in 0..total / 10 {
            let base = i * 10 * 3;
            frame.rgb[base] = high;
            frame.rgb[base + 1] = high;
            frame.rgb[base + 2] = high;
        }
        frame
    }

    #[test]
    fn uniform_dark_frame_is_dark() {
        let darkness = DarknessConfig::default();
        assert!(is_dark(&uniform(8), &darkness));
        assert!(is_dark(&uniform(39), &darkness));
    }

    #[test]
    fn bright_frame_is_not_dark() {
        let darkness = DarknessConfig::default();
        assert!(!is_dark(&uniform(41), &darkness));
        assert!(!is_dark(&uniform(200), &darkness));
    }

    #[test]
    fn small_bright_spots_do_not_defeat_percentile() {
        // LED pilot lights inside a closed enclosure: a tenth of the frame
        // glows but the 75th percentile stays low.
        let darkness = DarknessConfig {
            variance_check: false,
            ..DarknessConfig::default()
        };
        let (p, _) = darkness_metrics(&bimodal(10, 200), darkness.percentile);
        assert!(p < 40.0);
        assert!(is_dark(&bimodal(10, 200), &darkness));
    }

    #[test]
    fn variance_check_rejects_varied_dim_scene() {
        // Same frame, but with the spread check on the sigma of ~57 reads as
        // a dim open scene rather than a closed box.
        let darkness = DarknessConfig::default();
        let (p, sigma) = darkness_metrics(&bimodal(10, 200), darkness.percentile);
        assert!(p < 40.0);
        assert!(sigma > darkness.variance_threshold);
        assert!(!is_dark(&bimodal(10, 200), &darkness));
    }

    #[test]
    fn snapshot_counts_faces_and_picks_widest() {
        let frame = uniform(120);
        let face = |w: u32, facing: bool| FaceDetection {
            bbox: BBox { x: 0, y: 0, w, h: 30 },
            landmarks: None,
            yaw: 0.0,
            pitch: 0.0,
            roll: 0.0,
            is_facing: facing,
            confidence: 0.8,
        };
        let snapshot = snapshot_from_detections(&frame, &[face(20, false), face(40, true)]);
        assert!(snapshot.detected);
        assert_eq!(snapshot.num_faces, 2);
        assert_eq!(snapshot.num_facing, 1);
        assert_eq!(snapshot.bbox.unwrap().w, 40);
        assert!(snapshot.is_facing);
    }

    #[test]
    fn empty_detections_still_report_camera_alive() {
        let snapshot = snapshot_from_detections(&uniform(120), &[]);
        assert!(!snapshot.detected);
        assert!(snapshot.camera_connected);
        assert_eq!(snapshot.frame_width, 64);
    }
}
