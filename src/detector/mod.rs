//! # Detection Backbone
//!
//! The detector is an external collaborator: the pipeline only needs a batch
//! loss with gradients back to the pixels, and predictions for validation.
//! [`DetectionBackbone`] is that seam. [`EdgeEnergyDetector`] is the built-in
//! implementation used for training and tests.
//!
//! Boxes are YOLO-style: class index plus centre and size normalized to the
//! image, so they survive letterboxing through [`tone_blur::presets::ScalePlan::map_box`].

pub mod edge_energy;
pub mod metrics;

use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};

use crate::error::PipelineResult;

pub use edge_energy::EdgeEnergyDetector;
pub use metrics::{average_precision, match_detections, DetectionMetrics, MatchCounts};

/// Ground-truth box, normalized to `[0, 1]` image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxAnnotation {
    pub class: usize,
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

impl BoxAnnotation {
    /// Parse one `class cx cy w h` line of a YOLO label file.
    pub fn parse_yolo_line(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let class = fields.next()?.parse::<f32>().ok()?;
        if class < 0.0 || class.fract() != 0.0 {
            return None;
        }
        let mut next = || fields.next().and_then(|v| v.parse::<f32>().ok());
        let (cx, cy, w, h) = (next()?, next()?, next()?, next()?);
        if [cx, cy, w, h].iter().any(|v| !v.is_finite()) || w <= 0.0 || h <= 0.0 {
            return None;
        }
        Some(Self { class: class as usize, cx, cy, w, h })
    }

    /// Corners `(x0, y0, x1, y1)` in normalized coordinates.
    pub fn corners(&self) -> (f32, f32, f32, f32) {
        (
            self.cx - self.w / 2.0,
            self.cy - self.h / 2.0,
            self.cx + self.w / 2.0,
            self.cy + self.h / 2.0,
        )
    }

    /// Pixel rows and columns `(y0, y1, x0, x1)` covered in an `h × w` image,
    /// clipped to the image. `None` when nothing is left.
    pub fn pixel_bounds(&self, height: usize, width: usize) -> Option<(usize, usize, usize, usize)> {
        let (x0, y0, x1, y1) = self.corners();
        let clip = |v: f32, n: usize| (v * n as f32).round().clamp(0.0, n as f32) as usize;
        let (px0, px1) = (clip(x0, width), clip(x1, width));
        let (py0, py1) = (clip(y0, height), clip(y1, height));
        (px1 > px0 && py1 > py0).then_some((py0, py1, px0, px1))
    }

    /// Intersection over union of two boxes.
    pub fn iou(&self, other: &BoxAnnotation) -> f32 {
        let (ax0, ay0, ax1, ay1) = self.corners();
        let (bx0, by0, bx1, by1) = other.corners();
        let iw = (ax1.min(bx1) - ax0.max(bx0)).max(0.0);
        let ih = (ay1.min(by1) - ay0.max(by0)).max(0.0);
        let inter = iw * ih;
        let union = self.w * self.h + other.w * other.h - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// A predicted box with its confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoxAnnotation,
    pub score: f32,
}

/// Batch loss and gradients from one backbone forward call.
#[derive(Debug, Clone)]
pub struct DetectionOutput {
    /// Mean loss over the batch
    pub loss: f32,
    /// `dL/d(images)`, same shape as the batch
    pub image_grads: Array4<f32>,
    /// `dL/d(weights)`, same length as [`DetectionBackbone::weights`]
    pub weight_grads: Vec<f32>,
}

/// Object detector consuming decoded images.
pub trait DetectionBackbone: Send + Sync {
    fn name(&self) -> &'static str;

    /// Loss and gradients for a batch with one target list per image.
    fn forward(&self, batch: ArrayView4<f32>, targets: &[Vec<BoxAnnotation>]) -> PipelineResult<DetectionOutput>;

    /// Detections for every image of a batch.
    fn predict(&self, batch: ArrayView4<f32>) -> Vec<Vec<Detection>>;

    /// Trainable weights, for fine-tuning and checkpoints.
    fn weights(&self) -> &[f32];

    fn weights_mut(&mut self) -> &mut [f32];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yolo_line() {
        let b = BoxAnnotation::parse_yolo_line("2 0.5 0.25 0.2 0.1").unwrap();
        assert_eq!(b.class, 2);
        assert_eq!((b.cx, b.cy, b.w, b.h), (0.5, 0.25, 0.2, 0.1));
        assert!(BoxAnnotation::parse_yolo_line("").is_none());
        assert!(BoxAnnotation::parse_yolo_line("1 0.5 0.5").is_none());
        assert!(BoxAnnotation::parse_yolo_line("-1 0.5 0.5 0.1 0.1").is_none());
        assert!(BoxAnnotation::parse_yolo_line("0 0.5 0.5 0.0 0.1").is_none());
    }

    #[test]
    fn test_iou() {
        let a = BoxAnnotation { class: 0, cx: 0.5, cy: 0.5, w: 0.2, h: 0.2 };
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        let b = BoxAnnotation { cx: 0.6, ..a };
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-4);
        let far = BoxAnnotation { cx: 0.9, ..a };
        assert_eq!(a.iou(&far), 0.0);
    }

    #[test]
    fn test_pixel_bounds_clip_to_image() {
        let b = BoxAnnotation { class: 0, cx: 0.0, cy: 0.5, w: 0.5, h: 0.5 };
        assert_eq!(b.pixel_bounds(16, 16), Some((4, 12, 0, 4)));
        let outside = BoxAnnotation { class: 0, cx: 1.5, cy: 0.5, w: 0.2, h: 0.2 };
        assert_eq!(outside.pixel_bounds(16, 16), None);
    }
}
