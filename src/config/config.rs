//! # Configuration Module
//!
//! Run configuration shared by the `train`, `val` and `infer` commands. A
//! config file is JSON; every field has a default, so a file only needs the
//! values it changes. CLI flags override file values afterwards.
//!
//! ## Configuration Parameters
//!
//! | Parameter | Type | Default | Description |
//! |-----------|------|---------|-------------|
//! | `image_size` | `usize` | 320 | Square input side, multiple of 8 |
//! | `channels` | `usize` | 3 | 1 (gray) or 3 (RGB) |
//! | `predictor.grid` | `usize` | 4 | Pooled feature grid per channel |
//! | `predictor.hidden` | `usize` | 32 | Hidden width of the MLP |
//! | `transform.tone_curve` | enum | `reinhard` | `reinhard`, `gamma`, `channel-gamma` |
//! | `transform.tone_min/max` | `f32` | 0.0 / 2.0 | Monotonic parameter bounds |
//! | `transform.max_sigma` | `f32` | 2.0 | Upper bound on blur sigma |
//! | `codec.quality` | `u8` | 80 | JPEG quality 1-100 |
//! | `codec.strategy` | enum | `entropy-proxy` | `entropy-proxy` or `jpeg` |
//! | `objective.lambda` | `f32` | 0.125 | Weight on the rate term |
//! | `detector.*` | | | Built-in detector shape and validation thresholds |
//! | `training.*` | | | Optimizer, schedule, logging, checkpoints |
//!
//! ## Examples
//!
//! ```rust
//! use tonecast::config::config::PipelineConfig;
//!
//! let config: PipelineConfig = serde_json::from_str(r#"{"image_size": 64, "codec": {"quality": 90}}"#).unwrap();
//! assert_eq!(config.codec.quality, 90);
//! assert_eq!(config.channels, 3);
//! assert!(config.validate().is_ok());
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tone_blur::tone::ToneCurve;

use crate::codec::{CodecStrategy, Reconstruction};
use crate::error::{PipelineError, PipelineResult};
use crate::objective::ObjectiveConfig;

/// JPEG block size; spatial dimensions must be a multiple of it.
pub const BLOCK_SIZE: usize = 8;

/// Parameter Predictor shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Side of the average-pooled grid taken from each channel
    pub grid: usize,
    /// Width of both hidden layers
    pub hidden: usize,
    /// Seed for weight initialization
    pub seed: u64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self { grid: 4, hidden: 32, seed: 0 }
    }
}

/// Tone-Blur Transform family and parameter bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub tone_curve: ToneCurve,
    /// Lower bound of every tone parameter
    pub tone_min: f32,
    /// Upper bound of every tone parameter
    pub tone_max: f32,
    /// Blur sigma is squashed into `[0, max_sigma]`
    pub max_sigma: f32,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            tone_curve: ToneCurve::Reinhard,
            tone_min: 0.0,
            tone_max: 2.0,
            max_sigma: 2.0,
        }
    }
}

/// Codec surrogate settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// JPEG quality factor, fixed for the run
    pub quality: u8,
    pub strategy: CodecStrategy,
    /// Reconstruction used by the entropy proxy
    pub reconstruction: Reconstruction,
    /// Fixed container cost (markers, tables) in bytes
    pub header_bytes: f32,
    /// Cost of the DC size code plus end-of-block per 8x8 block and plane
    pub block_overhead_bits: f32,
    /// Bits charged per unit of `log2(1 + |c/q|)`
    pub bits_per_magnitude: f32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            quality: 80,
            strategy: CodecStrategy::EntropyProxy,
            reconstruction: Reconstruction::Quantized,
            header_bytes: 600.0,
            block_overhead_bits: 6.0,
            bits_per_magnitude: 2.0,
        }
    }
}

/// Built-in edge-energy detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub num_classes: usize,
    /// Slope of the per-box logistic loss
    pub sharpness: f32,
    /// Multiplier on the mean squared luminance gradient inside a box
    pub energy_scale: f32,
    /// Initial per-class energy threshold
    pub initial_threshold: f32,
    /// Sliding window side as a fraction of the image side
    pub window_fraction: f32,
    /// Minimum score for a prediction
    pub confidence: f32,
    /// IoU for a prediction to count as a match during validation
    pub iou_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            num_classes: 80,
            sharpness: 4.0,
            energy_scale: 100.0,
            initial_threshold: 0.5,
            window_fraction: 0.25,
            confidence: 0.5,
            iou_threshold: 0.5,
        }
    }
}

/// Optimizer, schedule and bookkeeping for the training loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: u32,
    pub batch_size: usize,
    /// Adam step size at epoch 0
    pub learning_rate: f32,
    /// Learning rate multiplier applied once per epoch
    pub lr_decay: f32,
    /// Global gradient-norm clip
    pub grad_clip: f32,
    /// Also update the detection backbone's weights
    pub fine_tune_detector: bool,
    pub detector_learning_rate: f32,
    /// Steps between metric log lines
    pub log_interval: u64,
    /// Steps between checkpoints
    pub checkpoint_interval: u64,
    pub checkpoint_dir: PathBuf,
    /// Seed for batch shuffling
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 8,
            learning_rate: 1e-3,
            lr_decay: 0.95,
            grad_clip: 10.0,
            fine_tune_detector: false,
            detector_learning_rate: 1e-3,
            log_interval: 10,
            checkpoint_interval: 100,
            checkpoint_dir: PathBuf::from("runs/train"),
            seed: 0,
        }
    }
}

/// Complete configuration for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Square input side in pixels
    pub image_size: usize,
    /// Expected channel count of every input image
    pub channels: usize,
    pub predictor: PredictorConfig,
    pub transform: TransformConfig,
    pub codec: CodecConfig,
    pub objective: ObjectiveConfig,
    pub detector: DetectorConfig,
    pub training: TrainingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            image_size: 320,
            channels: 3,
            predictor: PredictorConfig::default(),
            transform: TransformConfig::default(),
            codec: CodecConfig::default(),
            objective: ObjectiveConfig::default(),
            detector: DetectorConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::config("config", path.display(), format!("cannot read file: {e}")))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| PipelineError::config("config", path.display(), format!("invalid JSON: {e}")))?;
        Ok(config)
    }

    /// `(C, H, W)` every input image must have.
    pub fn input_shape(&self) -> [usize; 3] {
        [self.channels, self.image_size, self.image_size]
    }

    /// Number of tone parameters per image.
    pub fn tone_arity(&self) -> usize {
        self.transform.tone_curve.arity(self.channels)
    }

    /// Parameter Vector length: tone parameters plus blur sigma.
    pub fn param_arity(&self) -> usize {
        self.tone_arity() + 1
    }

    /// Validate every section, returning the first violation.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.image_size == 0 || self.image_size % BLOCK_SIZE != 0 {
            return Err(PipelineError::config(
                "image_size",
                self.image_size,
                format!("must be a positive multiple of {BLOCK_SIZE}"),
            ));
        }
        if self.channels != 1 && self.channels != 3 {
            return Err(PipelineError::config("channels", self.channels, "must be 1 or 3"));
        }
        if self.predictor.grid == 0 || self.predictor.grid > self.image_size {
            return Err(PipelineError::config(
                "predictor.grid",
                self.predictor.grid,
                "must be between 1 and image_size",
            ));
        }
        if self.predictor.hidden == 0 {
            return Err(PipelineError::config("predictor.hidden", 0, "must be greater than 0"));
        }

        let t = &self.transform;
        if !t.tone_curve.valid_bounds(t.tone_min, t.tone_max) {
            return Err(PipelineError::config(
                "transform.tone_min/tone_max",
                format!("[{}, {}]", t.tone_min, t.tone_max),
                format!("bounds do not keep the {:?} curve monotonic", t.tone_curve),
            ));
        }
        if !t.max_sigma.is_finite() || t.max_sigma < 0.0 {
            return Err(PipelineError::config("transform.max_sigma", t.max_sigma, "must be finite and >= 0"));
        }

        let c = &self.codec;
        if !(1..=100).contains(&c.quality) {
            return Err(PipelineError::config("codec.quality", c.quality, "must be between 1 and 100"));
        }
        if !(c.header_bytes >= 0.0) || !(c.block_overhead_bits >= 0.0) {
            return Err(PipelineError::config(
                "codec.header_bytes/block_overhead_bits",
                format!("{}/{}", c.header_bytes, c.block_overhead_bits),
                "must be >= 0",
            ));
        }
        if !(c.bits_per_magnitude > 0.0) || !c.bits_per_magnitude.is_finite() {
            return Err(PipelineError::config("codec.bits_per_magnitude", c.bits_per_magnitude, "must be > 0"));
        }

        self.objective.validate()?;

        let d = &self.detector;
        if d.num_classes == 0 {
            return Err(PipelineError::config("detector.num_classes", 0, "must be greater than 0"));
        }
        for (field, value) in [("detector.sharpness", d.sharpness), ("detector.energy_scale", d.energy_scale)] {
            if !(value > 0.0) || !value.is_finite() {
                return Err(PipelineError::config(field, value, "must be finite and > 0"));
            }
        }
        if !d.initial_threshold.is_finite() {
            return Err(PipelineError::config("detector.initial_threshold", d.initial_threshold, "must be finite"));
        }
        for (field, value) in [
            ("detector.window_fraction", d.window_fraction),
            ("detector.confidence", d.confidence),
            ("detector.iou_threshold", d.iou_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(PipelineError::config(field, value, "must be in (0, 1]"));
            }
        }

        let tr = &self.training;
        if tr.batch_size == 0 {
            return Err(PipelineError::config("training.batch_size", 0, "must be greater than 0"));
        }
        if tr.epochs == 0 {
            return Err(PipelineError::config("training.epochs", 0, "must be greater than 0"));
        }
        for (field, value) in [
            ("training.learning_rate", tr.learning_rate),
            ("training.detector_learning_rate", tr.detector_learning_rate),
            ("training.grad_clip", tr.grad_clip),
        ] {
            if !(value > 0.0) || !value.is_finite() {
                return Err(PipelineError::config(field, value, "must be finite and > 0"));
            }
        }
        if !(tr.lr_decay > 0.0 && tr.lr_decay <= 1.0) {
            return Err(PipelineError::config("training.lr_decay", tr.lr_decay, "must be in (0, 1]"));
        }
        if tr.log_interval == 0 || tr.checkpoint_interval == 0 {
            return Err(PipelineError::config(
                "training.log_interval/checkpoint_interval",
                format!("{}/{}", tr.log_interval, tr.checkpoint_interval),
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objective::LambdaSchedule;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.image_size, 320);
        assert_eq!(config.channels, 3);
        assert_eq!(config.codec.quality, 80);
        assert_eq!(config.transform.tone_curve, ToneCurve::Reinhard);
        assert_eq!(config.param_arity(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = PipelineConfig::default();

        config.image_size = 100;
        assert!(config.validate().is_err());
        config.image_size = 64;

        config.codec.quality = 0;
        assert!(config.validate().is_err());
        config.codec.quality = 80;

        config.objective.lambda = -0.5;
        assert!(config.validate().is_err());
        config.objective.lambda = 0.0;
        assert!(config.validate().is_ok());

        config.training.lr_decay = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_monotonic_tone_bounds_rejected() {
        let mut config = PipelineConfig::default();
        config.transform.tone_min = 1.5;
        config.transform.tone_max = 0.5;
        let err = config.validate().unwrap_err();
        assert_eq!(err.category(), "configuration");

        config.transform.tone_curve = ToneCurve::Gamma;
        config.transform.tone_min = 0.0;
        config.transform.tone_max = 2.0;
        assert!(config.validate().is_err(), "gamma of zero flattens the curve");
    }

    #[test]
    fn test_channel_gamma_arity() {
        let mut config = PipelineConfig::default();
        config.transform.tone_curve = ToneCurve::ChannelGamma;
        config.transform.tone_min = 0.5;
        assert_eq!(config.param_arity(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "image_size": 128,
            "objective": {"lambda": 0.5, "lambda_schedule": {"kind": "linear", "start": 0.0, "end": 1.0, "steps": 100}},
            "training": {"batch_size": 4}
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.image_size, 128);
        assert_eq!(config.training.batch_size, 4);
        assert_eq!(config.training.epochs, 10);
        assert!(matches!(config.objective.lambda_schedule, Some(LambdaSchedule::Linear { .. })));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = PipelineConfig::from_json_file(Path::new("/definitely/not/here.json")).unwrap_err();
        assert_eq!(err.category(), "configuration");
    }
}
