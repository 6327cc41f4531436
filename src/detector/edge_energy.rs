//! Edge-energy detector.
//!
//! Scores a region by its scaled mean squared luminance gradient
//!
//! ```text
//! E = energy_scale * mean_{p in box}((∂x L)² + (∂y L)²)
//! ```
//!
//! and treats `sigmoid(κ (E - τ_class))` as the confidence that an object of
//! that class is present. The loss on a ground-truth box is
//! `softplus(-κ (E - τ_class))`, so detail that survives preprocessing and
//! compression inside annotated boxes lowers the loss. The per-class
//! thresholds `τ` are the trainable weights.

use log::debug;
use ndarray::parallel::prelude::*;
use ndarray::{Array2, Array3, Array4, ArrayView3, ArrayView4, Axis};
use tone_blur::tone::{luminance, LUMA_WEIGHTS};

use super::{BoxAnnotation, Detection, DetectionBackbone, DetectionOutput};
use crate::config::DetectorConfig;
use crate::error::{PipelineError, PipelineResult};

/// Overlap above which a lower-scoring window is suppressed.
const SUPPRESSION_IOU: f32 = 0.5;

#[inline]
fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[inline]
fn softplus(z: f64) -> f64 {
    if z > 0.0 {
        z + (-z).exp().ln_1p()
    } else {
        z.exp().ln_1p()
    }
}

#[derive(Debug, Clone)]
pub struct EdgeEnergyDetector {
    thresholds: Vec<f32>,
    sharpness: f32,
    energy_scale: f32,
    window_fraction: f32,
    confidence: f32,
}

/// Per-image share of a batch forward.
struct ImageTerms {
    loss: f64,
    boxes: usize,
    grad: Array3<f32>,
    threshold_grads: Vec<f64>,
}

impl EdgeEnergyDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            thresholds: vec![config.initial_threshold; config.num_classes],
            sharpness: config.sharpness,
            energy_scale: config.energy_scale,
            window_fraction: config.window_fraction,
            confidence: config.confidence,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.thresholds.len()
    }

    /// Scaled gradient energy of the pixel rectangle `[y0, y1) × [x0, x1)`.
    fn region_energy(&self, lum: &Array2<f32>, (y0, y1, x0, x1): (usize, usize, usize, usize)) -> f64 {
        let mut sum = 0.0f64;
        for y in y0..y1 {
            for x in x0..x1 {
                let v = lum[[y, x]] as f64;
                if x + 1 < x1 {
                    sum += (lum[[y, x + 1]] as f64 - v).powi(2);
                }
                if y + 1 < y1 {
                    sum += (lum[[y + 1, x]] as f64 - v).powi(2);
                }
            }
        }
        self.energy_scale as f64 * sum / ((y1 - y0) * (x1 - x0)) as f64
    }

    /// Add `weight * dE/dL` for one region into `grad`.
    fn region_energy_grad(&self, lum: &Array2<f32>, (y0, y1, x0, x1): (usize, usize, usize, usize), weight: f64, grad: &mut Array2<f32>) {
        let k = weight * self.energy_scale as f64 * 2.0 / ((y1 - y0) * (x1 - x0)) as f64;
        for y in y0..y1 {
            for x in x0..x1 {
                let v = lum[[y, x]];
                if x + 1 < x1 {
                    let d = (k * (lum[[y, x + 1]] - v) as f64) as f32;
                    grad[[y, x + 1]] += d;
                    grad[[y, x]] -= d;
                }
                if y + 1 < y1 {
                    let d = (k * (lum[[y + 1, x]] - v) as f64) as f32;
                    grad[[y + 1, x]] += d;
                    grad[[y, x]] -= d;
                }
            }
        }
    }

    fn image_terms(&self, image: ArrayView3<f32>, targets: &[BoxAnnotation]) -> ImageTerms {
        let (c, h, w) = image.dim();
        let lum = luminance(image);
        let kappa = self.sharpness as f64;
        let mut lum_grad = Array2::<f32>::zeros((h, w));
        let mut threshold_grads = vec![0.0f64; self.thresholds.len()];
        let mut loss = 0.0f64;
        let mut boxes = 0usize;

        for target in targets {
            let Some(&tau) = self.thresholds.get(target.class) else {
                debug!("ignoring box with class {} beyond {} classes", target.class, self.thresholds.len());
                continue;
            };
            let Some(bounds) = target.pixel_bounds(h, w) else {
                continue;
            };
            let margin = kappa * (self.region_energy(&lum, bounds) - tau as f64);
            loss += softplus(-margin);
            boxes += 1;
            // d softplus(-m) / dm = -sigmoid(-m)
            let dm = -sigmoid(-margin);
            threshold_grads[target.class] -= dm * kappa;
            self.region_energy_grad(&lum, bounds, dm * kappa, &mut lum_grad);
        }

        let mut grad = Array3::<f32>::zeros((c, h, w));
        if boxes > 0 {
            for (ch, mut plane) in grad.axis_iter_mut(Axis(0)).enumerate() {
                let weight = if c == 3 { LUMA_WEIGHTS[ch] } else { 1.0 / c as f32 };
                plane.scaled_add(weight, &lum_grad);
            }
        }
        ImageTerms { loss, boxes, grad, threshold_grads }
    }

    fn image_predictions(&self, image: ArrayView3<f32>) -> Vec<Detection> {
        let (_, h, w) = image.dim();
        let lum = luminance(image);
        let side = ((h.min(w) as f32 * self.window_fraction).round() as usize).clamp(2, h.min(w).max(2));
        let stride = (side / 2).max(1);
        if h < side || w < side {
            return Vec::new();
        }

        let Some((class, &tau)) = self
            .thresholds
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
        else {
            return Vec::new();
        };

        let mut candidates = Vec::new();
        for y0 in (0..=h - side).step_by(stride) {
            for x0 in (0..=w - side).step_by(stride) {
                let energy = self.region_energy(&lum, (y0, y0 + side, x0, x0 + side));
                let score = sigmoid(self.sharpness as f64 * (energy - tau as f64)) as f32;
                if score >= self.confidence {
                    candidates.push(Detection {
                        bbox: BoxAnnotation {
                            class,
                            cx: (x0 as f32 + side as f32 / 2.0) / w as f32,
                            cy: (y0 as f32 + side as f32 / 2.0) / h as f32,
                            w: side as f32 / w as f32,
                            h: side as f32 / h as f32,
                        },
                        score,
                    });
                }
            }
        }

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        let mut kept: Vec<Detection> = Vec::new();
        for candidate in candidates {
            if kept.iter().all(|k| k.bbox.iou(&candidate.bbox) <= SUPPRESSION_IOU) {
                kept.push(candidate);
            }
        }
        kept
    }
}

impl DetectionBackbone for EdgeEnergyDetector {
    fn name(&self) -> &'static str {
        "edge-energy"
    }

    fn forward(&self, batch: ArrayView4<f32>, targets: &[Vec<BoxAnnotation>]) -> PipelineResult<DetectionOutput> {
        let n = batch.len_of(Axis(0));
        if targets.len() != n {
            return Err(PipelineError::shape_mismatch("detector targets", vec![n], vec![targets.len()]));
        }

        let terms: Vec<ImageTerms> = batch
            .axis_iter(Axis(0))
            .into_par_iter()
            .zip(targets.par_iter())
            .map(|(image, boxes)| self.image_terms(image, boxes))
            .collect();

        let total_boxes: usize = terms.iter().map(|t| t.boxes).sum();
        let mut image_grads = Array4::<f32>::zeros(batch.raw_dim());
        let mut weight_grads = vec![0.0f32; self.thresholds.len()];
        if total_boxes == 0 {
            return Ok(DetectionOutput { loss: 0.0, image_grads, weight_grads });
        }

        let scale = 1.0 / total_boxes as f64;
        let mut loss = 0.0f64;
        let mut threshold_sums = vec![0.0f64; self.thresholds.len()];
        for (i, t) in terms.into_iter().enumerate() {
            loss += t.loss;
            image_grads.index_axis_mut(Axis(0), i).assign(&t.grad.mapv(|g| (g as f64 * scale) as f32));
            for (sum, g) in threshold_sums.iter_mut().zip(&t.threshold_grads) {
                *sum += g;
            }
        }
        for (dst, sum) in weight_grads.iter_mut().zip(threshold_sums) {
            *dst = (sum * scale) as f32;
        }
        Ok(DetectionOutput { loss: (loss * scale) as f32, image_grads, weight_grads })
    }

    fn predict(&self, batch: ArrayView4<f32>) -> Vec<Vec<Detection>> {
        batch
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|image| self.image_predictions(image))
            .collect()
    }

    fn weights(&self) -> &[f32] {
        &self.thresholds
    }

    fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.thresholds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn detector() -> EdgeEnergyDetector {
        EdgeEnergyDetector::new(&DetectorConfig { num_classes: 2, ..DetectorConfig::default() })
    }

    /// Gray image with a checkerboard patch covering the centre quarter.
    fn patch_image() -> Array4<f32> {
        Array4::from_shape_fn((1, 3, 32, 32), |(_, _, y, x)| {
            if (8..24).contains(&y) && (8..24).contains(&x) {
                if (x + y) % 2 == 0 { 0.8 } else { 0.2 }
            } else {
                0.5
            }
        })
    }

    fn centre_box(class: usize) -> BoxAnnotation {
        BoxAnnotation { class, cx: 0.5, cy: 0.5, w: 0.5, h: 0.5 }
    }

    #[test]
    fn test_textured_box_scores_lower_loss_than_flat() {
        let d = detector();
        let textured = d.forward(patch_image().view(), &[vec![centre_box(0)]]).unwrap();
        let flat = Array4::from_elem((1, 3, 32, 32), 0.5f32);
        let empty = d.forward(flat.view(), &[vec![centre_box(0)]]).unwrap();
        assert!(textured.loss < 0.01, "textured loss {}", textured.loss);
        assert!((empty.loss as f64 - softplus(4.0 * 0.5)).abs() < 1e-4);
    }

    #[test]
    fn test_no_targets_means_zero_loss() {
        let d = detector();
        let out = d.forward(patch_image().view(), &[vec![]]).unwrap();
        assert_eq!(out.loss, 0.0);
        assert!(out.image_grads.iter().all(|&g| g == 0.0));
        let unknown = d.forward(patch_image().view(), &[vec![centre_box(9)]]).unwrap();
        assert_eq!(unknown.loss, 0.0);
    }

    #[test]
    fn test_image_gradient_matches_finite_difference() {
        let d = detector();
        // Soft texture keeps the margin in the logistic's sensitive range
        let batch = Array4::from_shape_fn((1, 3, 16, 16), |(_, c, y, x)| {
            0.5 + 0.01 * (((x * 3 + y * 5 + c) % 7) as f32 - 3.0)
        });
        let targets = vec![vec![BoxAnnotation { class: 1, cx: 0.5, cy: 0.5, w: 0.75, h: 0.5 }]];
        let out = d.forward(batch.view(), &targets).unwrap();
        let h = 1e-3f32;
        for &(c, y, x) in &[(0, 8, 8), (1, 5, 6), (2, 10, 11), (1, 0, 0)] {
            let mut up = batch.clone();
            up[[0, c, y, x]] += h;
            let mut down = batch.clone();
            down[[0, c, y, x]] -= h;
            let fd = (d.forward(up.view(), &targets).unwrap().loss - d.forward(down.view(), &targets).unwrap().loss)
                / (2.0 * h);
            let an = out.image_grads[[0, c, y, x]];
            assert!((fd - an).abs() <= 0.05 * fd.abs().max(an.abs()) + 1e-3, "({c},{y},{x}): fd {fd} vs {an}");
        }
    }

    #[test]
    fn test_threshold_gradient_sign() {
        let d = detector();
        let flat = Array4::from_elem((1, 3, 16, 16), 0.5f32);
        let out = d.forward(flat.view(), &[vec![centre_box(1)]]).unwrap();
        // Lowering the threshold of an undetected class lowers the loss
        assert!(out.weight_grads[1] > 0.0);
        assert_eq!(out.weight_grads[0], 0.0);
    }

    #[test]
    fn test_predict_finds_textured_patch() {
        let d = detector();
        let preds = d.predict(patch_image().view());
        assert_eq!(preds.len(), 1);
        assert!(!preds[0].is_empty());
        assert!(preds[0].iter().all(|d| d.score >= 0.5));
        assert!(preds[0].iter().any(|d| d.bbox.iou(&centre_box(0)) > 0.2), "{:?}", preds[0]);
        let flat = Array4::from_elem((1, 3, 32, 32), 0.5f32);
        assert!(d.predict(flat.view())[0].is_empty());
    }

    #[test]
    fn test_target_count_must_match_batch() {
        let d = detector();
        let err = d.forward(patch_image().view(), &[]).unwrap_err();
        assert_eq!(err.category(), "shape_mismatch");
    }
}
