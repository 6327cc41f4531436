//! # Training
//!
//! End-to-end optimization of the Parameter Predictor through the transform,
//! the codec surrogate and the detector.
//!
//! - [`dataset`]: sample sources and the shuffling batch loader
//! - [`optimizer`]: Adam and gradient clipping
//! - [`context`]: the step state machine and running statistics
//! - [`checkpoint`]: atomic JSON checkpoints
//! - [`trainer`]: the loop itself

pub mod checkpoint;
pub mod context;
pub mod dataset;
pub mod optimizer;
pub mod trainer;

pub use checkpoint::{load_checkpoint, Checkpoint, CheckpointStore, JsonCheckpointStore};
pub use context::{TrainPhase, TrainingContext};
pub use dataset::{Batch, BatchLoader, Dataset, ImageFolderDataset, InMemoryDataset, Sample};
pub use optimizer::{clip_grad_norm, Adam, AdamState};
pub use trainer::{SkipReason, StepOutcome, TrainSummary, Trainer};
