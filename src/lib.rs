//! # tonecast
//!
//! Learned, per-image tone mapping and Gaussian blur applied ahead of a JPEG
//! encoder, so that frames sent from an edge device cost fewer bits while a
//! downstream object detector still finds what it needs.
//!
//! ## Architecture
//!
//! The library is organized into several key modules:
//! - `processing`: the Parameter Predictor and the Tone-Blur Transform
//! - `codec`: differentiable stand-ins for JPEG and the real encoder
//! - `objective`: rate-accuracy loss with a scheduled lambda
//! - `detector`: the detection backbone seam, a built-in detector and metrics
//! - `training`: datasets, Adam, checkpoints and the training loop
//! - `inference`: the deployed edge-encode / server-decode split
//! - `config`, `core`, `error`: configuration, tensors, typed errors
//!
//! Images are planar `f32` arrays shaped `(C, H, W)` with values in `[0, 1]`;
//! batches add a leading `N` axis.
//!
//! ## Example
//!
//! ```rust
//! use ndarray::Array3;
//! use tonecast::config::{PipelineConfig, PredictorConfig};
//! use tonecast::inference::EdgeEncoder;
//! use tonecast::processing::ParameterPredictor;
//!
//! # fn example() -> tonecast::PipelineResult<()> {
//! let config = PipelineConfig {
//!     image_size: 32,
//!     predictor: PredictorConfig { grid: 2, hidden: 8, seed: 7 },
//!     ..PipelineConfig::default()
//! };
//! let predictor = ParameterPredictor::new(&config)?;
//! let encoder = EdgeEncoder::new(predictor, &config);
//!
//! let image = Array3::from_elem((3, 32, 32), 0.5f32);
//! let frame = encoder.encode("frame_0", image.view())?;
//! assert_eq!(frame.params.len(), config.param_arity());
//! assert!(frame.bits() > 0.0);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

pub mod codec;
pub mod config;
pub mod core;
pub mod detector;
pub mod error;
pub mod inference;
pub mod objective;
pub mod processing;
pub mod training;

/// Re-export error types for convenience
pub use error::{HasRecoverySuggestion, HasSeverity, PipelineError, PipelineResult, Recoverable};

pub use codec::{CodecPass, CodecSurrogate};
pub use config::PipelineConfig;
pub use detector::{BoxAnnotation, Detection, DetectionBackbone, EdgeEnergyDetector};
pub use inference::{EdgeEncoder, EncodedFrame, ServerDecoder};
pub use objective::RateAccuracyObjective;
pub use processing::{ParameterPredictor, ToneBlurTransform};
pub use training::{BatchLoader, Checkpoint, Trainer};
