//! Real baseline JPEG via the `image` crate, with a straight-through gradient.
//!
//! Forward values (bits, reconstruction) come from actually encoding and
//! decoding. For backward, the reconstruction passes its gradient through
//! unchanged and the rate uses the entropy proxy's gradient, rescaled so the
//! proxy's total matches the real bit count.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat};
use ndarray::{Array3, ArrayView3};
use tone_blur::layout::{interleaved_to_planar, planar_to_interleaved};

use super::{check_codec_input, CodecPass, CodecSurrogate, DctEntropyProxy};
use crate::config::CodecConfig;
use crate::error::{PipelineError, PipelineResult};

/// Encode a planar `[0, 1]` image (1 or 3 channels) as baseline JPEG.
pub fn encode_jpeg(image: ArrayView3<f32>, quality: u8) -> PipelineResult<Vec<u8>> {
    check_codec_input("jpeg", image)?;
    let (c, h, w) = image.dim();
    let color = if c == 3 { ExtendedColorType::Rgb8 } else { ExtendedColorType::L8 };
    let bytes = planar_to_interleaved(image);
    let mut buf = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
        encoder
            .encode(&bytes, w as u32, h as u32, color)
            .map_err(|e| PipelineError::codec("jpeg", format!("encode failed: {e}")))?;
    }
    Ok(buf)
}

/// Decode a JPEG bitstream into a planar image with `channels` planes.
pub fn decode_jpeg(bitstream: &[u8], channels: usize) -> PipelineResult<Array3<f32>> {
    let decoded = image::load_from_memory_with_format(bitstream, ImageFormat::Jpeg)
        .map_err(|e| PipelineError::codec("jpeg", format!("decode failed: {e}")))?;
    let (w, h) = (decoded.width() as usize, decoded.height() as usize);
    let raw = match channels {
        1 => decoded.to_luma8().into_raw(),
        3 => decoded.to_rgb8().into_raw(),
        other => {
            return Err(PipelineError::codec("jpeg", format!("cannot decode into {other} channels")));
        }
    };
    interleaved_to_planar(&raw, w, h, channels).map_err(|e| PipelineError::codec("jpeg", e.to_string()))
}

#[derive(Clone, Debug)]
pub struct JpegStraightThrough {
    proxy: DctEntropyProxy,
}

impl JpegStraightThrough {
    pub fn new(config: &CodecConfig) -> Self {
        Self { proxy: DctEntropyProxy::new(config) }
    }
}

impl CodecSurrogate for JpegStraightThrough {
    fn name(&self) -> &'static str {
        "jpeg"
    }

    fn forward(&self, image: ArrayView3<f32>, quality: u8, track_grad: bool) -> PipelineResult<CodecPass> {
        let bitstream = encode_jpeg(image, quality)?;
        let reconstruction = decode_jpeg(&bitstream, image.dim().0)?;
        if reconstruction.dim() != image.dim() {
            return Err(PipelineError::codec(
                "jpeg",
                format!("decoded shape {:?} differs from input {:?}", reconstruction.dim(), image.dim()),
            ));
        }
        let bits = bitstream.len() as f32 * 8.0;
        let rate_gradient = if track_grad {
            let estimate = self.proxy.estimate(image, quality, true);
            let scale = if estimate.bits > 0.0 { bits / estimate.bits } else { 1.0 };
            estimate.gradient.map(|g| g * scale)
        } else {
            None
        };
        Ok(CodecPass { bits, reconstruction, rate_gradient })
    }
}
