//! # Inference Pipeline
//!
//! The deployed split: an [`EdgeEncoder`] on the capture device predicts the
//! Parameter Vector, applies the Tone-Blur Transform and encodes real JPEG;
//! a [`ServerDecoder`] decodes the bitstream and runs the detector.
//!
//! Frames travel as [`EncodedFrame`] packets, JSON with a base64 bitstream.
//! No gradients are computed here.

use std::path::{Path, PathBuf};

use log::{debug, warn};
use ndarray::ArrayView3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::codec::jpeg::{decode_jpeg, encode_jpeg};
use crate::config::PipelineConfig;
use crate::core::metrics::RunningMean;
use crate::core::tensor::Image;
use crate::detector::{BoxAnnotation, Detection, DetectionBackbone, DetectionMetrics};
use crate::error::{PipelineError, PipelineResult};
use crate::processing::{ParameterPredictor, ToneBlurTransform};
use crate::training::Dataset;

mod bitstream_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// One encoded image as sent from the edge to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedFrame {
    pub id: String,
    /// `[C, H, W]` of the encoded image
    pub shape: [usize; 3],
    /// Parameter Vector the edge applied
    pub params: Vec<f32>,
    pub quality: u8,
    #[serde(with = "bitstream_base64")]
    pub bitstream: Vec<u8>,
}

impl EncodedFrame {
    pub fn bits(&self) -> f32 {
        self.bitstream.len() as f32 * 8.0
    }

    pub fn to_json(&self) -> PipelineResult<String> {
        serde_json::to_string(self).map_err(|e| PipelineError::io("serialize packet", None, e.into()))
    }

    pub fn from_json(text: &str) -> PipelineResult<Self> {
        serde_json::from_str(text).map_err(|e| PipelineError::codec("packet", format!("invalid packet: {e}")))
    }

    /// Write `<dir>/<id>.json`.
    pub fn write_packet(&self, dir: &Path) -> PipelineResult<PathBuf> {
        std::fs::create_dir_all(dir).map_err(|e| PipelineError::io("create packet dir", Some(dir), e))?;
        let path = dir.join(format!("{}.json", self.id));
        std::fs::write(&path, self.to_json()?).map_err(|e| PipelineError::io("write packet", Some(&path), e))?;
        Ok(path)
    }

    pub fn read_packet(path: &Path) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::io("read packet", Some(path), e))?;
        Self::from_json(&text)
    }
}

/// Capture-side half: predictor, transform, real JPEG.
#[derive(Debug, Clone)]
pub struct EdgeEncoder {
    predictor: ParameterPredictor,
    transform: ToneBlurTransform,
    quality: u8,
}

impl EdgeEncoder {
    pub fn new(predictor: ParameterPredictor, config: &PipelineConfig) -> Self {
        Self {
            predictor,
            transform: ToneBlurTransform::new(config),
            quality: config.codec.quality,
        }
    }

    pub fn predictor(&self) -> &ParameterPredictor {
        &self.predictor
    }

    pub fn encode(&self, id: &str, image: ArrayView3<f32>) -> PipelineResult<EncodedFrame> {
        self.predictor.check_shape(id, image)?;
        let params = self.predictor.predict(image)?;
        let transformed = self.transform.apply(image, &params);
        let bitstream = encode_jpeg(transformed.view(), self.quality)?;
        let (c, h, w) = image.dim();
        debug!("{id}: params {params:?}, {} bytes", bitstream.len());
        Ok(EncodedFrame {
            id: id.to_string(),
            shape: [c, h, w],
            params,
            quality: self.quality,
            bitstream,
        })
    }
}

/// Server-side half: JPEG decode and detection.
pub struct ServerDecoder {
    detector: Box<dyn DetectionBackbone>,
}

impl ServerDecoder {
    pub fn new(detector: Box<dyn DetectionBackbone>) -> Self {
        Self { detector }
    }

    pub fn detector(&self) -> &dyn DetectionBackbone {
        self.detector.as_ref()
    }

    pub fn decode(&self, frame: &EncodedFrame) -> PipelineResult<(Image, Vec<Detection>)> {
        let image = decode_jpeg(&frame.bitstream, frame.shape[0])?;
        let (c, h, w) = image.dim();
        if [c, h, w] != frame.shape {
            return Err(PipelineError::codec(
                "jpeg",
                format!("frame '{}' decoded to {:?}, header says {:?}", frame.id, [c, h, w], frame.shape),
            ));
        }
        let detections = self
            .detector
            .predict(image.view().insert_axis(ndarray::Axis(0)))
            .into_iter()
            .next()
            .unwrap_or_default();
        Ok((image, detections))
    }
}

/// Aggregate results of a validation pass.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub images: usize,
    pub skipped: usize,
    pub mean_bits: f32,
    /// Bits per pixel
    pub bpp: f32,
    pub detection_loss: f32,
    pub metrics: DetectionMetrics,
}

struct FrameResult {
    bits: f32,
    pixels: usize,
    loss: f32,
    detections: Vec<Detection>,
    targets: Vec<BoxAnnotation>,
}

/// Run the deployed chain over every sample of `dataset`.
///
/// Samples that fail to load, have the wrong shape, or fail to encode are
/// counted as skipped.
pub fn validate<D: Dataset>(
    encoder: &EdgeEncoder,
    decoder: &ServerDecoder,
    dataset: &D,
    iou_threshold: f32,
) -> PipelineResult<ValidationReport> {
    let results: Vec<PipelineResult<FrameResult>> = (0..dataset.len())
        .into_par_iter()
        .map(|index| {
            let sample = dataset.get(index)?;
            let frame = encoder.encode(&sample.id, sample.image.view())?;
            let (decoded, detections) = decoder.decode(&frame)?;
            let targets = vec![sample.targets.clone()];
            let loss = decoder
                .detector()
                .forward(decoded.view().insert_axis(ndarray::Axis(0)), &targets)?
                .loss;
            Ok(FrameResult {
                bits: frame.bits(),
                pixels: frame.shape[1] * frame.shape[2],
                loss,
                detections,
                targets: sample.targets,
            })
        })
        .collect();

    let mut metrics = DetectionMetrics::new(iou_threshold);
    let (mut bits, mut bpp, mut loss) = (RunningMean::new(), RunningMean::new(), RunningMean::new());
    let mut skipped = 0;
    for result in results {
        match result {
            Ok(frame) => {
                bits.update(frame.bits);
                bpp.update(frame.bits / frame.pixels.max(1) as f32);
                loss.update(frame.loss);
                metrics.update(&frame.detections, &frame.targets);
            }
            Err(e) if e.context().recoverable => {
                warn!("⚠️  skipping sample: {e}");
                skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(ValidationReport {
        images: metrics.images(),
        skipped,
        mean_bits: bits.mean(),
        bpp: bpp.mean(),
        detection_loss: loss.mean(),
        metrics,
    })
}
