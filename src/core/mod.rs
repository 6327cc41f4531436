//! # Core Types
//!
//! Planar image tensors and the running metrics reported by training and
//! validation.

pub mod metrics;
pub mod tensor;

pub use metrics::{RunningMean, StepMetrics};
pub use tensor::{Image, ImageBatch};
