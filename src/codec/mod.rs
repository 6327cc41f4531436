//! # Codec Surrogate
//!
//! Estimates the bit cost of an image under a JPEG quality factor and the
//! reconstruction a decoder would hand to the detector, in a form the
//! training loop can backpropagate through.
//!
//! ## Strategies
//!
//! - [`proxy::DctEntropyProxy`]: differentiable entropy estimate over
//!   quantized DCT coefficients.
//! - [`jpeg::JpegStraightThrough`]: the real encoder/decoder for the forward
//!   value, with the proxy's gradient substituted for the rate and the identity
//!   for the reconstruction.
//!
//! The rest of the pipeline only sees [`CodecSurrogate`] and [`CodecPass`].

pub mod dct;
pub mod jpeg;
pub mod proxy;

use clap::ValueEnum;
use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::config::CodecConfig;
use crate::error::{PipelineError, PipelineResult};

pub use jpeg::JpegStraightThrough;
pub use proxy::DctEntropyProxy;

/// Which surrogate the run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodecStrategy {
    EntropyProxy,
    Jpeg,
}

/// Reconstruction produced by the entropy proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reconstruction {
    /// Quantize and dequantize the DCT coefficients.
    Quantized,
    /// Pass the input through.
    Identity,
}

/// Result of one surrogate forward call.
#[derive(Debug, Clone)]
pub struct CodecPass {
    /// Bitrate Estimate in bits
    pub bits: f32,
    /// Same shape as the input
    pub reconstruction: Array3<f32>,
    /// `d(bits)/d(input)`, present when requested
    pub rate_gradient: Option<Array3<f32>>,
}

impl CodecPass {
    /// `dL/d(input)` from upstream gradients on the reconstruction and the bits.
    ///
    /// The reconstruction stage passes its gradient straight through.
    pub fn backward(&self, grad_reconstruction: ArrayView3<f32>, grad_bits: f32) -> Array3<f32> {
        let mut grad = grad_reconstruction.to_owned();
        if let Some(rate) = &self.rate_gradient {
            if grad_bits != 0.0 {
                grad.scaled_add(grad_bits, rate);
            }
        }
        grad
    }
}

/// Gradient-compatible codec stage.
pub trait CodecSurrogate: Send + Sync {
    fn name(&self) -> &'static str;

    /// Estimate bits and reconstruction for one `(C, H, W)` image.
    ///
    /// `track_grad` asks for [`CodecPass::rate_gradient`].
    fn forward(&self, image: ArrayView3<f32>, quality: u8, track_grad: bool) -> PipelineResult<CodecPass>;
}

/// Build the surrogate selected by `config.strategy`.
pub fn build_surrogate(config: &CodecConfig) -> Box<dyn CodecSurrogate> {
    match config.strategy {
        CodecStrategy::EntropyProxy => Box::new(DctEntropyProxy::new(config)),
        CodecStrategy::Jpeg => Box::new(JpegStraightThrough::new(config)),
    }
}

/// Reject images no codec path can handle.
pub(crate) fn check_codec_input(codec: &str, image: ArrayView3<f32>) -> PipelineResult<()> {
    let (c, h, w) = image.dim();
    if c != 1 && c != 3 {
        return Err(PipelineError::codec(codec, format!("{c} channels; expected 1 or 3")));
    }
    if h == 0 || w == 0 || h % dct::BLOCK != 0 || w % dct::BLOCK != 0 {
        return Err(PipelineError::codec(
            codec,
            format!("{w}x{h} is not a non-empty multiple of {}", dct::BLOCK),
        )
        .with_recovery_suggestion("letterbox inputs to a multiple of 8"));
    }
    if image.iter().any(|v| !v.is_finite()) {
        return Err(PipelineError::codec(codec, "image contains non-finite values"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backward_is_straight_through_plus_rate() {
        let pass = CodecPass {
            bits: 100.0,
            reconstruction: Array3::zeros((1, 8, 8)),
            rate_gradient: Some(Array3::from_elem((1, 8, 8), 2.0)),
        };
        let upstream = Array3::from_elem((1, 8, 8), 0.5f32);
        let g = pass.backward(upstream.view(), 0.25);
        assert!(g.iter().all(|&v| (v - 1.0).abs() < 1e-6));
        let g0 = pass.backward(upstream.view(), 0.0);
        assert_eq!(g0, upstream);
    }

    #[test]
    fn test_non_finite_input_rejected() {
        let mut img = Array3::<f32>::zeros((3, 8, 8));
        img[[1, 2, 3]] = f32::NAN;
        assert!(check_codec_input("test", img.view()).is_err());
        let four = Array3::<f32>::zeros((4, 8, 8));
        assert!(check_codec_input("test", four.view()).is_err());
    }

    #[test]
    fn test_build_surrogate_follows_strategy() {
        let mut config = CodecConfig::default();
        assert_eq!(build_surrogate(&config).name(), "entropy-proxy");
        config.strategy = CodecStrategy::Jpeg;
        assert_eq!(build_surrogate(&config).name(), "jpeg");
    }
}
