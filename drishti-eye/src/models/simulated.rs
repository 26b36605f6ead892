//! Weight-free stand-ins for the enhancer and detector.
//!
//! `SimulatedDetector` finds bright regions on a coarse grid and follows them
//! across frames with IoU matching, so confidence rises as a target persists.
//! All tracking state lives in the instance.

use parking_lot::Mutex;
use tracing::debug;

use super::{Detector, Enhancer};
use crate::bridge::Tensor;
use crate::error::{Result, VisionError};
use drishti_core::Detection;

/// Identity enhancer.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEnhancer;

impl Enhancer for PassthroughEnhancer {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn enhance(&self, input: &Tensor) -> Result<Tensor> {
        Ok(input.clone())
    }
}

#[derive(Debug, Clone)]
struct Track {
    bbox: [f32; 4],
    confidence: f32,
    missed: u32,
}

#[derive(Debug, Default)]
struct TrackerState {
    tracks: Vec<Track>,
}

/// Brightness-driven detector with per-instance track memory.
#[derive(Debug)]
pub struct SimulatedDetector {
    cell: u32,
    brightness_floor: f32,
    iou_threshold: f32,
    max_missed: u32,
    label: String,
    state: Mutex<TrackerState>,
}

impl SimulatedDetector {
    pub fn new() -> Self {
        Self {
            cell: 32,
            brightness_floor: 0.55,
            iou_threshold: 0.3,
            max_missed: 5,
            label: "anomaly".to_string(),
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn track_count(&self) -> usize {
        self.state.lock().tracks.len()
    }

    /// Mean luminance of every grid cell, row-major.
    fn cell_means(&self, input: &Tensor) -> (usize, usize, Vec<f32>) {
        let cols = input.width().div_ceil(self.cell) as usize;
        let rows = input.height().div_ceil(self.cell) as usize;
        let mut sums = vec![0.0f32; cols * rows];
        let mut counts = vec![0u32; cols * rows];

        for (x, y, px) in input.enumerate_pixels() {
            let idx = (y / self.cell) as usize * cols + (x / self.cell) as usize;
            sums[idx] += 0.299 * px[0] + 0.587 * px[1] + 0.114 * px[2];
            counts[idx] += 1;
        }

        let means = sums
            .iter()
            .zip(&counts)
            .map(|(s, c)| if *c == 0 { 0.0 } else { s / *c as f32 })
            .collect();
        (cols, rows, means)
    }

    /// Group bright cells into 4-connected regions.
    fn regions(&self, input: &Tensor) -> Vec<([f32; 4], f32)> {
        let (cols, rows, means) = self.cell_means(input);
        let mut seen = vec![false; means.len()];
        let mut out = Vec::new();

        for start in 0..means.len() {
            if seen[start] || means[start] < self.brightness_floor {
                continue;
            }

            let (mut min_c, mut min_r, mut max_c, mut max_r) = (cols, rows, 0, 0);
            let (mut total, mut n) = (0.0f32, 0u32);
            let mut stack = vec![start];
            seen[start] = true;

            while let Some(idx) = stack.pop() {
                let (c, r) = (idx % cols, idx / cols);
                min_c = min_c.min(c);
                max_c = max_c.max(c);
                min_r = min_r.min(r);
                max_r = max_r.max(r);
                total += means[idx];
                n += 1;

                let mut neighbours = Vec::with_capacity(4);
                if c > 0 {
                    neighbours.push(idx - 1);
                }
                if c + 1 < cols {
                    neighbours.push(idx + 1);
                }
                if r > 0 {
                    neighbours.push(idx - cols);
                }
                if r + 1 < rows {
                    neighbours.push(idx + cols);
                }
                for nb in neighbours {
                    if !seen[nb] && means[nb] >= self.brightness_floor {
                        seen[nb] = true;
                        stack.push(nb);
                    }
                }
            }

            let cell = self.cell as f32;
            let x = min_c as f32 * cell;
            let y = min_r as f32 * cell;
            let w = ((max_c + 1) as f32 * cell).min(input.width() as f32) - x;
            let h = ((max_r + 1) as f32 * cell).min(input.height() as f32) - y;
            let mean = total / n as f32;
            let confidence = ((mean - self.brightness_floor) / (1.0 - self.brightness_floor)).clamp(0.0, 1.0);
            out.push(([x, y, w, h], confidence));
        }

        out
    }
}

impl Default for SimulatedDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = (a[0] + a[2]).min(b[0] + b[2]);
    let y2 = (a[1] + a[3]).min(b[1] + b[3]);
    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a[2] * a[3] + b[2] * b[3] - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

impl Detector for SimulatedDetector {
    fn name(&self) -> &str {
        "simulated"
    }

    fn detect(&self, input: &Tensor) -> Result<Vec<Detection>> {
        if input.width() == 0 || input.height() == 0 {
            return Err(VisionError::Model("detector input is empty".to_string()));
        }

        let regions = self.regions(input);
        let mut state = self.state.lock();
        for track in state.tracks.iter_mut() {
            track.missed += 1;
        }

        let mut detections = Vec::with_capacity(regions.len());
        for (bbox, raw) in regions {
            let best = state
                .tracks
                .iter()
                .enumerate()
                .map(|(i, t)| (iou(&t.bbox, &bbox), i))
                .filter(|(overlap, _)| *overlap > self.iou_threshold)
                .max_by(|a, b| a.0.total_cmp(&b.0))
                .map(|(_, i)| i);

            let confidence = match best {
                Some(i) => {
                    let track = &mut state.tracks[i];
                    // Persistent targets gain confidence, flicker does not.
                    track.confidence = (0.6 * raw + 0.4 * track.confidence + 0.05).min(1.0);
                    track.bbox = bbox;
                    track.missed = 0;
                    track.confidence
                }
                None => {
                    let confidence = raw * 0.8;
                    state.tracks.push(Track {
                        bbox,
                        confidence,
                        missed: 0,
                    });
                    confidence
                }
            };
            detections.push(Detection::new(bbox, confidence, self.label.clone()));
        }

        let max_missed = self.max_missed;
        state.tracks.retain(|t| t.missed <= max_missed);
        debug!("Simulated detector: {} detections, {} tracks", detections.len(), state.tracks.len());
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn scene(w: u32, h: u32, bright: Option<(u32, u32, u32, u32)>) -> Tensor {
        Tensor::from_fn(w, h, |x, y| match bright {
            Some((bx, by, bw, bh)) if x >= bx && x < bx + bw && y >= by && y < by + bh => Rgb([1.0, 1.0, 1.0]),
            _ => Rgb([0.1, 0.2, 0.3]),
        })
    }

    #[test]
    fn test_passthrough_is_identity() {
        let input = scene(8, 8, Some((0, 0, 4, 4)));
        assert_eq!(PassthroughEnhancer.enhance(&input).unwrap(), input);
    }

    #[test]
    fn test_dark_scene_has_no_detections() {
        let detector = SimulatedDetector::new();
        assert!(detector.detect(&scene(128, 128, None)).unwrap().is_empty());
    }

    #[test]
    fn test_bright_region_detected() {
        let detector = SimulatedDetector::new();
        let detections = detector.detect(&scene(128, 128, Some((32, 64, 32, 32)))).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].bbox, [32.0, 64.0, 32.0, 32.0]);
        assert_eq!(detections[0].label, "anomaly");
        assert!(detections[0].confidence > 0.0);
    }

    #[test]
    fn test_persistent_target_gains_confidence() {
        let detector = SimulatedDetector::new();
        let frame = scene(128, 128, Some((0, 0, 64, 64)));
        let first = detector.detect(&frame).unwrap()[0].confidence;
        let second = detector.detect(&frame).unwrap()[0].confidence;
        let third = detector.detect(&frame).unwrap()[0].confidence;
        assert!(second > first);
        assert!(third >= second);
        assert_eq!(detector.track_count(), 1);
    }

    #[test]
    fn test_instances_do_not_share_tracks() {
        let a = SimulatedDetector::new();
        let b = SimulatedDetector::new();
        a.detect(&scene(64, 64, Some((0, 0, 32, 32)))).unwrap();
        assert_eq!(a.track_count(), 1);
        assert_eq!(b.track_count(), 0);
    }

    #[test]
    fn test_tracks_expire() {
        let detector = SimulatedDetector::new();
        detector.detect(&scene(64, 64, Some((0, 0, 32, 32)))).unwrap();
        for _ in 0..6 {
            detector.detect(&scene(64, 64, None)).unwrap();
        }
        assert_eq!(detector.track_count(), 0);
    }

    #[test]
    fn test_iou() {
        assert_eq!(iou(&[0.0, 0.0, 10.0, 10.0], &[0.0, 0.0, 10.0, 10.0]), 1.0);
        assert_eq!(iou(&[0.0, 0.0, 10.0, 10.0], &[20.0, 20.0, 5.0, 5.0]), 0.0);
    }
}
