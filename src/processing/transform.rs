//! # Tone-Blur Transform
//!
//! Applies the predicted tone curve and then a Gaussian blur to each image,
//! `y = Blur_σ(Tone_p(x))`, and carries forward-mode tangents so backward can
//! return `dL/d(params)` per image.
//!
//! For tone parameter `j` the tangent is `Blur_σ(∂Tone/∂p_j)`; for sigma it is
//! the blur's own sigma derivative applied to the toned image. Backward is the
//! inner product of the upstream gradient with each tangent.

use ndarray::parallel::prelude::*;
use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Axis};
use tone_blur::blur::{blur_with_kernel, gaussian_blur_with_derivative, GaussianKernel};
use tone_blur::tone::ToneCurve;

use crate::config::PipelineConfig;

#[derive(Debug, Clone, Copy)]
pub struct ToneBlurTransform {
    curve: ToneCurve,
    tone_arity: usize,
}

/// Transformed batch plus the tangents backward needs.
#[derive(Debug, Clone)]
pub struct TransformPass {
    /// `(N, C, H, W)` transformed images
    pub output: Array4<f32>,
    /// `tangents[i][j]` is `d(output_i)/d(params[i, j])`, empty when not tracked
    tangents: Vec<Vec<Array3<f32>>>,
}

impl ToneBlurTransform {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            curve: config.transform.tone_curve,
            tone_arity: config.tone_arity(),
        }
    }

    pub fn curve(&self) -> ToneCurve {
        self.curve
    }

    /// Transform one image. `params` holds the tone parameters then sigma.
    ///
    /// Identity tone parameters with `sigma == 0` return the input unchanged.
    pub fn apply(&self, image: ArrayView3<f32>, params: &[f32]) -> Array3<f32> {
        let (tone, sigma) = params.split_at(self.tone_arity);
        let toned = self.curve.apply(image, tone);
        let kernel = GaussianKernel::new(sigma.first().copied().unwrap_or(0.0));
        blur_with_kernel(toned.view(), &kernel)
    }

    /// Transform one image and return the tangent for every parameter.
    pub fn apply_with_tangents(&self, image: ArrayView3<f32>, params: &[f32]) -> (Array3<f32>, Vec<Array3<f32>>) {
        let (tone, sigma) = params.split_at(self.tone_arity);
        let kernel = GaussianKernel::new(sigma.first().copied().unwrap_or(0.0));
        let toned = self.curve.apply(image, tone);
        let (output, d_sigma) = gaussian_blur_with_derivative(toned.view(), &kernel);

        let mut tangents = Vec::with_capacity(self.tone_arity + 1);
        for j in 0..self.tone_arity {
            let d_tone = self.curve.param_derivative(image, tone, j);
            tangents.push(blur_with_kernel(d_tone.view(), &kernel));
        }
        tangents.push(d_sigma);
        (output, tangents)
    }

    /// Transform a batch, one Parameter Vector per row of `params`.
    pub fn forward(&self, batch: ArrayView4<f32>, params: ArrayView2<f32>, track_grad: bool) -> TransformPass {
        let results: Vec<(Array3<f32>, Vec<Array3<f32>>)> = batch
            .axis_iter(Axis(0))
            .into_par_iter()
            .zip(params.axis_iter(Axis(0)).into_par_iter())
            .map(|(image, row)| {
                let row = row.to_vec();
                if track_grad {
                    self.apply_with_tangents(image, &row)
                } else {
                    (self.apply(image, &row), Vec::new())
                }
            })
            .collect();

        let mut output = Array4::<f32>::zeros(batch.raw_dim());
        let mut tangents = Vec::with_capacity(if track_grad { results.len() } else { 0 });
        for (i, (image, t)) in results.into_iter().enumerate() {
            output.index_axis_mut(Axis(0), i).assign(&image);
            if track_grad {
                tangents.push(t);
            }
        }
        TransformPass { output, tangents }
    }

    /// `dL/d(params)` from the upstream gradient on the transformed batch.
    ///
    /// Returns zeros when the pass did not track gradients.
    pub fn backward(&self, pass: &TransformPass, grad_output: ArrayView4<f32>) -> Array2<f32> {
        let n = pass.output.len_of(Axis(0));
        let p = self.tone_arity + 1;
        let mut grads = Array2::<f32>::zeros((n, p));
        for (i, tangents) in pass.tangents.iter().enumerate() {
            let g = grad_output.index_axis(Axis(0), i);
            for (j, t) in tangents.iter().enumerate() {
                grads[[i, j]] = inner(g, t.view());
            }
        }
        grads
    }
}

fn inner(a: ArrayView3<f32>, b: ArrayView3<f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (*x as f64) * (*y as f64)).sum::<f64>() as f32
}
