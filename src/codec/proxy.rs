//! # DCT Entropy Proxy
//!
//! Differentiable stand-in for a baseline JPEG encoder.
//!
//! ## Bit estimate
//!
//! Per plane (Y, Cb, Cr, 4:4:4), per 8×8 block in raster order:
//!
//! ```text
//! bits += block_overhead_bits
//!       + bits_per_magnitude * Σ_k log2(1 + |c̃_k / q_k|_s)
//! ```
//!
//! where `c̃` are the DCT coefficients with the DC term delta-coded against the
//! previous block of the same plane, `q` the quality-scaled table (luma for
//! plane 0, chroma otherwise) and `|u|_s = sqrt(u² + ε²) - ε` a smooth absolute
//! value. A fixed `header_bytes` is added once per image. The estimate grows
//! with every coefficient magnitude, so detail costs bits and flat content
//! costs only the header and per-block overhead.
//!
//! ## Reconstruction
//!
//! `Quantized`: `IDCT(round(c / q) * q)`, converted back to the input colour
//! space and clipped to `[0, 1]`. `Identity`: the input, unchanged. Both use
//! the identity gradient.

use ndarray::{Array2, Array3, ArrayView3, Axis};

use super::dct::{self, Dct8, BLOCK, BLOCK_LEN, CHROMA_QUANT, LUMA_QUANT};
use super::{check_codec_input, CodecPass, CodecSurrogate, Reconstruction};
use crate::config::CodecConfig;
use crate::error::PipelineResult;

const SMOOTH_EPS: f64 = 1e-2;

#[derive(Clone, Debug)]
pub struct DctEntropyProxy {
    dct: Dct8,
    reconstruction: Reconstruction,
    header_bits: f32,
    block_overhead_bits: f32,
    bits_per_magnitude: f32,
}

/// Bit estimate and optional `d(bits)/d(image)` without a reconstruction.
pub struct RateEstimate {
    pub bits: f32,
    pub gradient: Option<Array3<f32>>,
}

impl DctEntropyProxy {
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            dct: Dct8::new(),
            reconstruction: config.reconstruction,
            header_bits: config.header_bytes * 8.0,
            block_overhead_bits: config.block_overhead_bits,
            bits_per_magnitude: config.bits_per_magnitude,
        }
    }

    /// Bits for an image made only of header and per-block overhead.
    pub fn floor_bits(&self, channels: usize, height: usize, width: usize) -> f32 {
        let blocks = (height / BLOCK) * (width / BLOCK) * channels;
        self.header_bits + self.block_overhead_bits * blocks as f32
    }

    /// Estimate bits, and the gradient in the input colour space when asked.
    pub fn estimate(&self, image: ArrayView3<f32>, quality: u8, track_grad: bool) -> RateEstimate {
        let planes = dct::to_codec_planes(image);
        let (_, h, w) = planes.dim();
        let (bh, bw) = (h / BLOCK, w / BLOCK);
        let luma_q = dct::scaled_table(&LUMA_QUANT, quality);
        let chroma_q = dct::scaled_table(&CHROMA_QUANT, quality);
        let alpha = self.bits_per_magnitude as f64;

        let mut bits = self.header_bits as f64;
        let mut plane_grads = track_grad.then(|| Array3::<f32>::zeros(planes.raw_dim()));

        for (k, plane) in planes.axis_iter(Axis(0)).enumerate() {
            let table = if k == 0 { &luma_q } else { &chroma_q };
            let mut prev_dc = 0.0f32;
            // d(bits)/d(c̃) per block, needed before the DC chain can be unrolled
            let mut coef_grads: Vec<[f32; BLOCK_LEN]> = Vec::with_capacity(if track_grad { bh * bw } else { 0 });

            for by in 0..bh {
                for bx in 0..bw {
                    let coefs = self.dct.forward(&dct::read_block(plane, by, bx));
                    let mut g = [0.0f32; BLOCK_LEN];
                    bits += self.block_overhead_bits as f64;
                    for i in 0..BLOCK_LEN {
                        let coded = if i == 0 { coefs[0] - prev_dc } else { coefs[i] };
                        let q = table[i] as f64;
                        let u = coded as f64 / q;
                        let root = (u * u + SMOOTH_EPS * SMOOTH_EPS).sqrt();
                        let mag = root - SMOOTH_EPS;
                        bits += alpha * (1.0 + mag).log2();
                        if track_grad {
                            g[i] = (alpha * (u / root) / (q * (1.0 + mag) * std::f64::consts::LN_2)) as f32;
                        }
                    }
                    prev_dc = coefs[0];
                    if track_grad {
                        coef_grads.push(g);
                    }
                }
            }

            if let Some(grads) = plane_grads.as_mut() {
                let mut grad_plane = grads.index_axis_mut(Axis(0), k).to_owned();
                for b in 0..coef_grads.len() {
                    let mut g = coef_grads[b];
                    // c̃0[b] = c0[b] - c0[b-1], so c0[b] also feeds block b+1 negatively
                    if let Some(next) = coef_grads.get(b + 1) {
                        g[0] -= next[0];
                    }
                    let pixel = self.dct.inverse(&g);
                    dct::accumulate_block(&mut grad_plane, b / bw, b % bw, &pixel, 255.0);
                }
                grads.index_axis_mut(Axis(0), k).assign(&grad_plane);
            }
        }

        RateEstimate {
            bits: bits as f32,
            gradient: plane_grads.map(|g| dct::codec_planes_grad_to_input(g.view())),
        }
    }

    /// Quantize and dequantize every block.
    pub fn quantized_reconstruction(&self, image: ArrayView3<f32>, quality: u8) -> Array3<f32> {
        let planes = dct::to_codec_planes(image);
        let (_, h, w) = planes.dim();
        let luma_q = dct::scaled_table(&LUMA_QUANT, quality);
        let chroma_q = dct::scaled_table(&CHROMA_QUANT, quality);
        let mut out = Array3::<f32>::zeros(planes.raw_dim());
        for (k, plane) in planes.axis_iter(Axis(0)).enumerate() {
            let table = if k == 0 { &luma_q } else { &chroma_q };
            let mut rec = Array2::<f32>::zeros((h, w));
            for by in 0..h / BLOCK {
                for bx in 0..w / BLOCK {
                    let mut coefs = self.dct.forward(&dct::read_block(plane, by, bx));
                    for (c, q) in coefs.iter_mut().zip(table.iter()) {
                        *c = (*c / q).round() * q;
                    }
                    dct::write_block(&mut rec, by, bx, &self.dct.inverse(&coefs));
                }
            }
            out.index_axis_mut(Axis(0), k).assign(&rec);
        }
        dct::from_codec_planes(out.view()).mapv(|v| v.clamp(0.0, 1.0))
    }
}

impl CodecSurrogate for DctEntropyProxy {
    fn name(&self) -> &'static str {
        "entropy-proxy"
    }

    fn forward(&self, image: ArrayView3<f32>, quality: u8, track_grad: bool) -> PipelineResult<CodecPass> {
        check_codec_input(self.name(), image)?;
        let estimate = self.estimate(image, quality, track_grad);
        let reconstruction = match self.reconstruction {
            Reconstruction::Quantized => self.quantized_reconstruction(image, quality),
            Reconstruction::Identity => image.to_owned(),
        };
        Ok(CodecPass {
            bits: estimate.bits,
            reconstruction,
            rate_gradient: estimate.gradient,
        })
    }
}
