//! # Rate-Accuracy Objective
//!
//! Combines the detection loss and the codec's bit estimates into the scalar
//! the predictor is trained on:
//!
//! ```text
//! L = L_detection + lambda(step) * mean_i(bits_i / normalizer)
//! ```
//!
//! `lambda` comes either from the fixed `lambda` field or from an optional
//! schedule indexed by the global training step. The normalizer is validated
//! positive, so the objective is defined for a zero bit estimate. When the
//! effective `lambda` is zero the rate term is skipped entirely and the result
//! is the detection loss bit for bit.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// How lambda changes over training steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LambdaSchedule {
    /// Always the base `lambda`.
    Fixed,
    /// Linear ramp from `start` to `end` over `steps`, then held at `end`.
    Linear { start: f32, end: f32, steps: u64 },
    /// Piecewise constant: the value of the greatest key not after the
    /// current step, or the base `lambda` before the first key.
    Steps { values: BTreeMap<u64, f32> },
}

/// Divisor applied to raw bits before weighting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RateNormalization {
    /// Raw bits.
    None,
    /// Bits per sub-pixel (`C * H * W`).
    PerPixel,
    /// Bits relative to a reference bit count.
    Baseline { bits: f32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectiveConfig {
    /// Weight on the rate term
    pub lambda: f32,
    pub lambda_schedule: Option<LambdaSchedule>,
    pub rate_normalization: RateNormalization,
}

impl Default for ObjectiveConfig {
    fn default() -> Self {
        Self {
            lambda: 0.125,
            lambda_schedule: None,
            rate_normalization: RateNormalization::PerPixel,
        }
    }
}

fn check_weight(field: &str, value: f32) -> PipelineResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(PipelineError::config(field, value, "lambda must be finite and >= 0"));
    }
    Ok(())
}

impl ObjectiveConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        check_weight("objective.lambda", self.lambda)?;
        match &self.lambda_schedule {
            None | Some(LambdaSchedule::Fixed) => {}
            Some(LambdaSchedule::Linear { start, end, .. }) => {
                check_weight("objective.lambda_schedule.start", *start)?;
                check_weight("objective.lambda_schedule.end", *end)?;
            }
            Some(LambdaSchedule::Steps { values }) => {
                for (step, value) in values {
                    check_weight(&format!("objective.lambda_schedule.values[{step}]"), *value)?;
                }
            }
        }
        if let RateNormalization::Baseline { bits } = self.rate_normalization {
            if !(bits > 0.0) || !bits.is_finite() {
                return Err(PipelineError::config(
                    "objective.rate_normalization.bits",
                    bits,
                    "reference baseline must be finite and > 0",
                ));
            }
        }
        Ok(())
    }
}

/// Values of one objective evaluation, plus the partials backward needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveTerms {
    pub detection: f32,
    /// Mean normalized rate over the batch
    pub rate: f32,
    /// Mean raw bits per image
    pub mean_bits: f32,
    pub lambda: f32,
    pub total: f32,
    /// `dL/d(bits_i)` for every image of the batch
    pub grad_bits: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct RateAccuracyObjective {
    config: ObjectiveConfig,
}

impl RateAccuracyObjective {
    pub fn new(config: ObjectiveConfig) -> PipelineResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ObjectiveConfig {
        &self.config
    }

    /// Effective lambda at a global training step.
    pub fn lambda_at(&self, step: u64) -> f32 {
        match &self.config.lambda_schedule {
            None | Some(LambdaSchedule::Fixed) => self.config.lambda,
            Some(LambdaSchedule::Linear { start, end, steps }) => {
                let progress = (step as f32 / (*steps).max(1) as f32).clamp(0.0, 1.0);
                start + (end - start) * progress
            }
            Some(LambdaSchedule::Steps { values }) => values
                .range(..=step)
                .next_back()
                .map(|(_, v)| *v)
                .unwrap_or(self.config.lambda),
        }
    }

    /// Divisor for one image of `pixels` sub-pixels. Always > 0.
    pub fn normalizer(&self, pixels: usize) -> f32 {
        match self.config.rate_normalization {
            RateNormalization::None => 1.0,
            RateNormalization::PerPixel => pixels.max(1) as f32,
            RateNormalization::Baseline { bits } => bits,
        }
    }

    /// Evaluate the composite objective for one batch.
    ///
    /// # Arguments
    /// * `detection_loss` - backbone loss for the batch
    /// * `bits` - bit estimate of every image that reached the detector
    /// * `pixels` - `C * H * W` of one image
    /// * `step` - global step, used by the lambda schedule
    pub fn evaluate(&self, detection_loss: f32, bits: &[f32], pixels: usize, step: u64) -> ObjectiveTerms {
        let lambda = self.lambda_at(step);
        let norm = self.normalizer(pixels);
        let n = bits.len();
        let mean_bits = if n == 0 { 0.0 } else { bits.iter().sum::<f32>() / n as f32 };
        let rate = mean_bits / norm;

        let (total, grad_bits) = if lambda == 0.0 || n == 0 {
            (detection_loss, vec![0.0; n])
        } else {
            let g = lambda / (norm * n as f32);
            (detection_loss + lambda * rate, vec![g; n])
        };

        ObjectiveTerms {
            detection: detection_loss,
            rate,
            mean_bits,
            lambda,
            total,
            grad_bits,
        }
    }
}
