//! # Pipeline Error Handling
//!
//! Typed errors for the preprocessing, codec and training pipeline, each
//! carrying an [`ErrorContext`] with severity and recovery metadata.
//!
//! ## Architecture
//!
//! - **Error Types**: one variant per failure category the pipeline can act on
//! - **Error Traits**: [`Recoverable`] and [`HasSeverity`] drive the skip-or-abort
//!   decision in the training loop and the CLI
//! - **Error Context**: operation, recovery suggestion, severity
//! - **Recovery Strategies**: [`Recoverable::recovery_strategies`] tells the
//!   training loop whether to drop a sample, drop the batch or stop
//!
//! ## Propagation Policy
//!
//! | Variant          | Scope        | Handling                          |
//! |------------------|--------------|-----------------------------------|
//! | `ShapeMismatch`  | one sample   | skip the sample, log a warning    |
//! | `CodecFailure`   | sample/batch | skip, log, continue with the run  |
//! | `Dataset`        | sample       | skip; fatal when the root is bad  |
//! | `Configuration`  | run          | fatal at startup                  |
//! | `CheckpointIo`   | run          | fatal                             |
//! | `Io`             | run          | fatal                             |
//! | `InvalidState`   | run          | fatal                             |
//!
//! ## Usage
//!
//! ```rust
//! use tonecast::error::{PipelineError, Recoverable, classify};
//!
//! let error = PipelineError::shape_mismatch("img_0042", vec![3, 64, 64], vec![1, 64, 64])
//!     .with_operation("fetching batch 7");
//! assert!(error.is_recoverable());
//! assert!(!classify::is_fatal(&error));
//! ```

use std::{error::Error as StdError, fmt, path::Path, time::SystemTime};

/// Severity levels for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Warnings: the current sample or batch is dropped
    Warning,
    /// Errors that stop the current command
    Error,
    /// Fatal errors that must abort the run
    Fatal,
}

/// Metadata about when and where an error occurred
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// When the error occurred
    pub timestamp: SystemTime,
    /// The operation being performed when the error occurred
    pub operation: Option<String>,
    /// Suggested recovery action
    pub recovery_suggestion: Option<String>,
    /// Error severity level
    pub severity: ErrorSeverity,
    /// Whether the caller may drop the offending unit of work and continue
    pub recoverable: bool,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            timestamp: SystemTime::now(),
            operation: None,
            recovery_suggestion: None,
            severity: ErrorSeverity::Error,
            recoverable: false,
        }
    }
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn recoverable(mut self) -> Self {
        self.recoverable = true;
        self
    }
}

/// Base error type for the pipeline
#[derive(Debug)]
pub enum PipelineError {
    /// Input image shape differs from the configured input shape
    ShapeMismatch {
        sample: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
        context: ErrorContext,
    },
    /// Surrogate or real codec could not process an image
    CodecFailure {
        codec: String,
        reason: String,
        context: ErrorContext,
    },
    /// Invalid hyperparameter or CLI setting
    Configuration {
        field: String,
        value: String,
        reason: String,
        context: ErrorContext,
    },
    /// Checkpoint save or load failed
    CheckpointIo {
        operation: String,
        path: String,
        reason: String,
        source: Option<Box<dyn StdError + Send + Sync>>,
        context: ErrorContext,
    },
    /// Dataset root or sample could not be read
    Dataset {
        path: String,
        reason: String,
        context: ErrorContext,
    },
    /// Other I/O errors
    Io {
        operation: String,
        path: Option<String>,
        source: std::io::Error,
        context: ErrorContext,
    },
    /// A component was driven out of order, e.g. a training phase change
    /// the loop does not allow
    InvalidState {
        component: String,
        from: String,
        to: String,
        context: ErrorContext,
    },
}

impl PipelineError {
    /// Create a shape mismatch error for one sample
    pub fn shape_mismatch(sample: impl Into<String>, expected: Vec<usize>, actual: Vec<usize>) -> Self {
        Self::ShapeMismatch {
            sample: sample.into(),
            expected,
            actual,
            context: ErrorContext::new().with_severity(ErrorSeverity::Warning).recoverable(),
        }
    }

    /// Create a codec failure
    pub fn codec(codec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CodecFailure {
            codec: codec.into(),
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Warning).recoverable(),
        }
    }

    /// Create a configuration error
    pub fn config(field: impl Into<String>, value: impl ToString, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Fatal),
        }
    }

    /// Create a checkpoint I/O error
    pub fn checkpoint(operation: impl Into<String>, path: &Path, reason: impl Into<String>) -> Self {
        Self::CheckpointIo {
            operation: operation.into(),
            path: path.display().to_string(),
            reason: reason.into(),
            source: None,
            context: ErrorContext::new().with_severity(ErrorSeverity::Fatal),
        }
    }

    /// Create a checkpoint I/O error wrapping its cause
    pub fn checkpoint_with_source(
        operation: impl Into<String>,
        path: &Path,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::CheckpointIo {
            operation: operation.into(),
            path: path.display().to_string(),
            reason: source.to_string(),
            source: Some(Box::new(source)),
            context: ErrorContext::new().with_severity(ErrorSeverity::Fatal),
        }
    }

    /// Create a dataset error for an unreadable sample
    pub fn dataset(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Dataset {
            path: path.into(),
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Warning).recoverable(),
        }
    }

    /// Create a dataset error that cannot be skipped (missing root, empty set)
    pub fn dataset_fatal(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Dataset {
            path: path.into(),
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Fatal),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, path: Option<&Path>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.map(|p| p.display().to_string()),
            source,
            context: ErrorContext::new(),
        }
    }

    /// Create an error for an illegal state change
    pub fn invalid_state(component: impl Into<String>, from: impl fmt::Debug, to: impl fmt::Debug) -> Self {
        Self::InvalidState {
            component: component.into(),
            from: format!("{from:?}"),
            to: format!("{to:?}"),
            context: ErrorContext::new().with_severity(ErrorSeverity::Fatal),
        }
    }

    /// Add operation context
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.context_mut().operation = Some(operation.into());
        self
    }

    /// Add recovery suggestion
    pub fn with_recovery_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.context_mut().recovery_suggestion = Some(suggestion.into());
        self
    }

    /// Get the error context
    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::ShapeMismatch { context, .. } => context,
            Self::CodecFailure { context, .. } => context,
            Self::Configuration { context, .. } => context,
            Self::CheckpointIo { context, .. } => context,
            Self::Dataset { context, .. } => context,
            Self::Io { context, .. } => context,
            Self::InvalidState { context, .. } => context,
        }
    }

    fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            Self::ShapeMismatch { context, .. } => context,
            Self::CodecFailure { context, .. } => context,
            Self::Configuration { context, .. } => context,
            Self::CheckpointIo { context, .. } => context,
            Self::Dataset { context, .. } => context,
            Self::Io { context, .. } => context,
            Self::InvalidState { context, .. } => context,
        }
    }

    /// Get the error category as a string
    pub fn category(&self) -> &'static str {
        match self {
            Self::ShapeMismatch { .. } => "shape_mismatch",
            Self::CodecFailure { .. } => "codec_failure",
            Self::Configuration { .. } => "configuration",
            Self::CheckpointIo { .. } => "checkpoint_io",
            Self::Dataset { .. } => "dataset",
            Self::Io { .. } => "io",
            Self::InvalidState { .. } => "invalid_state",
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::ShapeMismatch {
                sample,
                expected,
                actual,
                ..
            } => {
                write!(
                    f,
                    "Shape mismatch for sample '{}': expected {:?}, got {:?}",
                    sample, expected, actual
                )
            }
            PipelineError::CodecFailure { codec, reason, .. } => {
                write!(f, "Codec '{}' failed: {}", codec, reason)
            }
            PipelineError::Configuration {
                field,
                value,
                reason,
                ..
            } => {
                write!(
                    f,
                    "Configuration error in '{}': {} (value: {})",
                    field, reason, value
                )
            }
            PipelineError::CheckpointIo {
                operation,
                path,
                reason,
                ..
            } => {
                write!(f, "Checkpoint {} failed for '{}': {}", operation, path, reason)
            }
            PipelineError::Dataset { path, reason, .. } => {
                write!(f, "Dataset error at '{}': {}", path, reason)
            }
            PipelineError::Io {
                operation,
                path,
                source,
                ..
            } => {
                if let Some(path) = path {
                    write!(f, "I/O error during {} on '{}': {}", operation, path, source)
                } else {
                    write!(f, "I/O error during {}: {}", operation, source)
                }
            }
            PipelineError::InvalidState { component, from, to, .. } => {
                write!(f, "Invalid {} transition {} -> {}", component, from, to)
            }
        }
    }
}

impl StdError for PipelineError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::CheckpointIo {
                source: Some(source),
                ..
            } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Result type alias using the pipeline error
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Trait for errors that can be recovered from
pub trait Recoverable {
    /// Check if this error can be recovered from
    fn is_recoverable(&self) -> bool;

    /// Get recovery strategies for this error
    fn recovery_strategies(&self) -> Vec<RecoveryStrategy>;
}

/// Recovery strategies for handling errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Drop the offending sample and continue with the batch
    SkipSample { reason: String },
    /// Drop the whole batch and continue with the next one
    SkipBatch { reason: String },
    /// Stop the run
    Abort { reason: String },
}

impl Recoverable for PipelineError {
    fn is_recoverable(&self) -> bool {
        self.context().recoverable
    }

    fn recovery_strategies(&self) -> Vec<RecoveryStrategy> {
        match self {
            Self::ShapeMismatch { .. } => vec![RecoveryStrategy::SkipSample {
                reason: "sample shape differs from the configured input".to_string(),
            }],
            Self::CodecFailure { .. } => vec![
                RecoveryStrategy::SkipSample {
                    reason: "codec rejected the transformed image".to_string(),
                },
                RecoveryStrategy::SkipBatch {
                    reason: "every sample of the batch failed to encode".to_string(),
                },
            ],
            Self::Dataset { .. } if self.is_recoverable() => vec![RecoveryStrategy::SkipSample {
                reason: "sample could not be read".to_string(),
            }],
            _ => vec![RecoveryStrategy::Abort {
                reason: format!("{} errors end the run", self.category()),
            }],
        }
    }
}

/// Trait for errors with severity levels
pub trait HasSeverity {
    /// Get the severity level of this error
    fn severity(&self) -> ErrorSeverity;
}

impl HasSeverity for PipelineError {
    fn severity(&self) -> ErrorSeverity {
        self.context().severity
    }
}

/// Trait for errors that provide recovery suggestions
pub trait HasRecoverySuggestion {
    /// Get recovery suggestion for this error
    fn recovery_suggestion(&self) -> Option<&str>;
}

impl HasRecoverySuggestion for PipelineError {
    fn recovery_suggestion(&self) -> Option<&str> {
        self.context().recovery_suggestion.as_deref()
    }
}

/// Error classification utilities
pub mod classify {
    use super::*;

    /// Check if an error must terminate the run
    pub fn is_fatal(error: &PipelineError) -> bool {
        matches!(
            error,
            PipelineError::Configuration { .. } | PipelineError::CheckpointIo { .. }
        ) || error.severity() == ErrorSeverity::Fatal
    }

    /// Stable category name used in CLI output and log lines
    pub fn category(error: &PipelineError) -> &'static str {
        error.category()
    }

    /// Process exit code reported by the CLI for an error
    pub fn exit_code(error: &PipelineError) -> i32 {
        match error {
            PipelineError::Configuration { .. } => 2,
            PipelineError::Dataset { .. } => 3,
            PipelineError::CheckpointIo { .. } => 4,
            PipelineError::CodecFailure { .. } => 5,
            PipelineError::ShapeMismatch { .. } | PipelineError::Io { .. } | PipelineError::InvalidState { .. } => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = PipelineError::config("objective.lambda", -1.0, "must be >= 0");
        assert_eq!(error.category(), "configuration");
        assert!(!error.is_recoverable());
        assert_eq!(error.severity(), ErrorSeverity::Fatal);
    }

    #[test]
    fn test_error_with_context() {
        let error = PipelineError::codec("entropy-proxy", "height 30 is not a multiple of 8")
            .with_operation("encode img_3")
            .with_recovery_suggestion("letterbox inputs to a multiple of 8");

        assert_eq!(error.category(), "codec_failure");
        assert!(error.is_recoverable());
        assert_eq!(
            error.recovery_suggestion(),
            Some("letterbox inputs to a multiple of 8")
        );
        assert_eq!(error.context().operation.as_deref(), Some("encode img_3"));
    }

    #[test]
    fn test_error_classification() {
        let shape = PipelineError::shape_mismatch("a", vec![3, 8, 8], vec![1, 8, 8]);
        assert!(!classify::is_fatal(&shape));

        let ckpt = PipelineError::checkpoint("save", Path::new("/nope/x.json"), "permission denied");
        assert!(classify::is_fatal(&ckpt));
        assert_eq!(classify::exit_code(&ckpt), 4);
        assert_eq!(classify::category(&ckpt), "checkpoint_io");

        let root = PipelineError::dataset_fatal("/data", "no images found");
        assert!(classify::is_fatal(&root));
        assert!(matches!(root.recovery_strategies()[0], RecoveryStrategy::Abort { .. }));
    }

    #[test]
    fn test_recovery_strategies() {
        let codec = PipelineError::codec("jpeg", "encoder rejected buffer");
        let strategies = codec.recovery_strategies();
        assert!(matches!(strategies[0], RecoveryStrategy::SkipSample { .. }));
        assert!(matches!(strategies[1], RecoveryStrategy::SkipBatch { .. }));

        let cfg = PipelineError::config("codec.quality", 0, "must be in 1..=100");
        assert!(matches!(cfg.recovery_strategies()[0], RecoveryStrategy::Abort { .. }));
    }

    #[test]
    fn test_invalid_state_is_fatal() {
        #[derive(Debug)]
        enum Phase {
            Terminal,
            Forward,
        }
        let error = PipelineError::invalid_state("training phase", Phase::Terminal, Phase::Forward);
        assert_eq!(error.category(), "invalid_state");
        assert!(classify::is_fatal(&error));
        assert_eq!(classify::exit_code(&error), 1);
        assert!(error.to_string().contains("Terminal -> Forward"));
    }

    #[test]
    fn test_display_includes_shapes() {
        let error = PipelineError::shape_mismatch("gray.png", vec![3, 64, 64], vec![1, 64, 64]);
        let text = error.to_string();
        assert!(text.contains("gray.png"));
        assert!(text.contains("[1, 64, 64]"));
    }
}
