//! # Processing Module
//!
//! The differentiable front half of the pipeline: the [`ParameterPredictor`]
//! looks at an image and emits its Parameter Vector, and the
//! [`ToneBlurTransform`] applies the tone curve and blur it describes.
//!
//! Both stages expose a `forward` that records what `backward` needs, so the
//! training loop can chain them with the codec surrogate and the detector.

pub mod predictor;
pub mod transform;

pub use predictor::{ParameterPredictor, PredictorPass};
pub use transform::{ToneBlurTransform, TransformPass};
