//! # Configuration Module
//!
//! Run configuration: JSON file layer, defaults and validation.

pub mod config;

pub use config::{CodecConfig, DetectorConfig, PipelineConfig, PredictorConfig, TrainingConfig, TransformConfig};
