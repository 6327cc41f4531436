//! # Parameter Predictor
//!
//! A small MLP that maps an image to its Parameter Vector: the tone curve
//! parameters followed by the blur sigma.
//!
//! ## Features
//!
//! The network does not see raw pixels. Each image is summarized by
//!
//! - a `grid × grid` average pool of every channel (centred at 0.5),
//! - the mean and standard deviation of every channel,
//! - the luminance gradient energy,
//!
//! which keeps the parameter count independent of the image size.
//!
//! ## Network
//!
//! `features → hidden → hidden → P` with ReLU between layers. All weights live
//! in one flat `Vec<f32>` so the optimizer and the checkpoint see a single
//! buffer. Each dense layer stores its `outputs × inputs` matrix row-major,
//! followed by its bias.
//!
//! ## Output squashing
//!
//! Raw outputs go through a sigmoid and are scaled into the configured ranges:
//! tone parameters into `[tone_min, tone_max]`, sigma into `[0, max_sigma]`.
//! Any weights therefore produce a valid, monotonic transform.

use ndarray::parallel::prelude::*;
use ndarray::linalg::general_mat_mul;
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayView3, ArrayView4, ArrayViewMut1, ArrayViewMut2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tone_blur::tone::{luminance, ToneCurve};

use crate::config::PipelineConfig;
use crate::core::tensor::shape_of;
use crate::error::{PipelineError, PipelineResult};

/// Scale applied to the mean squared luminance gradient feature.
const GRADIENT_FEATURE_SCALE: f32 = 4.0;

/// Initial sigma as a fraction of `max_sigma`.
const INITIAL_SIGMA_FRACTION: f32 = 0.1;

/// Number of features extracted from a `channels`-plane image.
pub fn feature_count(channels: usize, grid: usize) -> usize {
    channels * grid * grid + 2 * channels + 1
}

#[inline]
fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

#[inline]
fn logit(p: f32) -> f32 {
    (p / (1.0 - p)).ln()
}

/// One fully connected layer inside the flat weight buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Dense {
    inputs: usize,
    outputs: usize,
    offset: usize,
}

impl Dense {
    fn matrix_len(&self) -> usize {
        self.inputs * self.outputs
    }

    fn len(&self) -> usize {
        self.matrix_len() + self.outputs
    }

    /// The layer's `(outputs, inputs)` matrix and bias inside `weights`.
    fn views<'w>(&self, weights: &'w [f32]) -> PipelineResult<(ArrayView2<'w, f32>, ArrayView1<'w, f32>)> {
        let (w, b) = weights[self.offset..self.offset + self.len()].split_at(self.matrix_len());
        let len = w.len();
        let w = ArrayView2::from_shape((self.outputs, self.inputs), w).map_err(|e| {
            PipelineError::shape_mismatch("predictor weights", vec![self.outputs, self.inputs], vec![len])
                .with_operation(format!("view dense layer at offset {}: {e}", self.offset))
        })?;
        Ok((w, ArrayView1::from(b)))
    }

    fn forward(&self, weights: &[f32], x: &Array2<f32>) -> PipelineResult<Array2<f32>> {
        let (w, b) = self.views(weights)?;
        Ok(x.dot(&w.t()) + &b)
    }

    /// Accumulate parameter gradients into `grads` and return `dL/dx`.
    fn backward(
        &self,
        weights: &[f32],
        x: &Array2<f32>,
        grad_out: &Array2<f32>,
        grads: &mut [f32],
    ) -> PipelineResult<Array2<f32>> {
        let (w, _) = self.views(weights)?;
        let (gw, gb) = grads[self.offset..self.offset + self.len()].split_at_mut(self.matrix_len());
        let len = gw.len();
        let mut gw = ArrayViewMut2::from_shape((self.outputs, self.inputs), gw).map_err(|e| {
            PipelineError::shape_mismatch("predictor gradients", vec![self.outputs, self.inputs], vec![len])
                .with_operation(format!("view dense layer at offset {}: {e}", self.offset))
        })?;
        general_mat_mul(1.0, &grad_out.t(), x, 1.0, &mut gw);
        let mut gb = ArrayViewMut1::from(gb);
        gb += &grad_out.sum_axis(Axis(0));
        Ok(grad_out.dot(&w))
    }
}

/// Everything `backward` needs from one forward call.
#[derive(Debug, Clone)]
pub struct PredictorPass {
    /// Input of every layer: features, then both hidden activations
    activations: Vec<Array2<f32>>,
    logits: Array2<f32>,
    /// `(N, P)` Parameter Vectors
    pub params: Array2<f32>,
}

impl PredictorPass {
    /// Feature rows fed to the first layer.
    pub fn features(&self) -> ArrayView2<'_, f32> {
        self.activations[0].view()
    }
}

#[derive(Debug, Clone)]
pub struct ParameterPredictor {
    input_shape: [usize; 3],
    grid: usize,
    layers: [Dense; 3],
    weights: Vec<f32>,
    tone_arity: usize,
    tone_min: f32,
    tone_max: f32,
    max_sigma: f32,
}

impl ParameterPredictor {
    /// Build a freshly initialized predictor for `config`.
    ///
    /// Hidden layers use He-uniform initialization from the configured seed.
    /// The output layer starts close to the identity transform with a small
    /// blur, so early training sees images that still resemble the input.
    pub fn new(config: &PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;
        let channels = config.channels;
        let grid = config.predictor.grid;
        let hidden = config.predictor.hidden;
        let outputs = config.param_arity();

        let l0 = Dense { inputs: feature_count(channels, grid), outputs: hidden, offset: 0 };
        let l1 = Dense { inputs: hidden, outputs: hidden, offset: l0.len() };
        let l2 = Dense { inputs: hidden, outputs, offset: l1.offset + l1.len() };
        let total = l2.offset + l2.len();

        let t = &config.transform;
        let mut predictor = Self {
            input_shape: config.input_shape(),
            grid,
            layers: [l0, l1, l2],
            weights: vec![0.0; total],
            tone_arity: config.tone_arity(),
            tone_min: t.tone_min,
            tone_max: t.tone_max,
            max_sigma: t.max_sigma,
        };
        predictor.initialize(config.predictor.seed, t.tone_curve);
        Ok(predictor)
    }

    fn initialize(&mut self, seed: u64, curve: ToneCurve) {
        let mut rng = StdRng::seed_from_u64(seed);
        for (index, layer) in self.layers.iter().enumerate() {
            let mut bound = (6.0 / layer.inputs as f32).sqrt();
            if index == self.layers.len() - 1 {
                bound *= 0.1;
            }
            let start = layer.offset;
            for w in &mut self.weights[start..start + layer.matrix_len()] {
                *w = rng.gen_range(-bound..bound);
            }
        }

        let head = self.layers[2];
        let bias_start = head.offset + head.matrix_len();
        let span = self.tone_max - self.tone_min;
        let identity = ((curve.identity_value() - self.tone_min) / span).clamp(0.05, 0.95);
        for j in 0..self.tone_arity {
            self.weights[bias_start + j] = logit(identity);
        }
        self.weights[bias_start + self.tone_arity] = logit(INITIAL_SIGMA_FRACTION);
    }

    pub fn num_params(&self) -> usize {
        self.weights.len()
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }

    /// Replace the weights, e.g. from a checkpoint.
    pub fn load_weights(&mut self, weights: Vec<f32>) -> PipelineResult<()> {
        if weights.len() != self.weights.len() {
            return Err(PipelineError::config(
                "predictor.weights",
                weights.len(),
                format!("expected {} values for this predictor shape", self.weights.len()),
            ));
        }
        self.weights = weights;
        Ok(())
    }

    pub fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }

    /// Length of the Parameter Vector.
    pub fn param_arity(&self) -> usize {
        self.tone_arity + 1
    }

    pub fn tone_arity(&self) -> usize {
        self.tone_arity
    }

    /// Reject an image whose shape differs from the configured input shape.
    pub fn check_shape(&self, sample: &str, image: ArrayView3<f32>) -> PipelineResult<()> {
        let actual = shape_of(image);
        if actual != self.input_shape {
            return Err(PipelineError::shape_mismatch(sample, self.input_shape.to_vec(), actual)
                .with_operation("predict parameters")
                .with_recovery_suggestion("letterbox inputs to the configured image_size and channel count"));
        }
        Ok(())
    }

    /// Summary features of one image, see the module docs.
    pub fn features(&self, image: ArrayView3<f32>) -> Vec<f32> {
        let (c, h, w) = image.dim();
        let g = self.grid;
        let mut out = Vec::with_capacity(feature_count(c, g));

        for plane in image.axis_iter(Axis(0)) {
            for gy in 0..g {
                let (y0, y1) = (gy * h / g, ((gy + 1) * h / g).max(gy * h / g + 1));
                for gx in 0..g {
                    let (x0, x1) = (gx * w / g, ((gx + 1) * w / g).max(gx * w / g + 1));
                    let cell = plane.slice(ndarray::s![y0..y1.min(h), x0..x1.min(w)]);
                    out.push(cell.mean().unwrap_or(0.0) - 0.5);
                }
            }
        }
        for plane in image.axis_iter(Axis(0)) {
            let mean = plane.mean().unwrap_or(0.0);
            let var = plane.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / plane.len().max(1) as f32;
            out.push(mean - 0.5);
            out.push(var.sqrt());
        }

        let lum = luminance(image);
        let mut energy = 0.0f64;
        for y in 0..h {
            for x in 0..w {
                let v = lum[[y, x]];
                if x + 1 < w {
                    energy += ((lum[[y, x + 1]] - v) as f64).powi(2);
                }
                if y + 1 < h {
                    energy += ((lum[[y + 1, x]] - v) as f64).powi(2);
                }
            }
        }
        out.push(GRADIENT_FEATURE_SCALE * (energy / (h * w).max(1) as f64) as f32);
        out
    }

    /// Predict Parameter Vectors for a batch.
    ///
    /// Every image must match [`ParameterPredictor::input_shape`].
    pub fn forward(&self, batch: ArrayView4<f32>) -> PipelineResult<PredictorPass> {
        for (i, image) in batch.axis_iter(Axis(0)).enumerate() {
            self.check_shape(&format!("batch[{i}]"), image)?;
        }
        let rows: Vec<Vec<f32>> = batch
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|image| self.features(image))
            .collect();
        let n = rows.len();
        let f = self.layers[0].inputs;
        let features = Array2::from_shape_fn((n, f), |(i, j)| rows[i][j]);

        let mut activations = Vec::with_capacity(self.layers.len());
        let mut x = features;
        for layer in &self.layers[..self.layers.len() - 1] {
            let z = layer.forward(&self.weights, &x)?;
            activations.push(x);
            x = z.mapv(|v| v.max(0.0));
        }
        let logits = self.layers[2].forward(&self.weights, &x)?;
        activations.push(x);

        let params = self.squash(&logits);
        Ok(PredictorPass { activations, logits, params })
    }

    /// Parameter Vector for a single image.
    pub fn predict(&self, image: ArrayView3<f32>) -> PipelineResult<Vec<f32>> {
        let batch = image.insert_axis(Axis(0));
        let pass = self.forward(batch)?;
        Ok(pass.params.row(0).to_vec())
    }

    fn squash(&self, logits: &Array2<f32>) -> Array2<f32> {
        let span = self.tone_max - self.tone_min;
        let mut params = logits.mapv(sigmoid);
        for mut row in params.rows_mut() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = if j < self.tone_arity { self.tone_min + span * *v } else { self.max_sigma * *v };
            }
        }
        params
    }

    /// Gradient of the loss with respect to every weight.
    ///
    /// `grad_params` is `dL/d(params)` with the same `(N, P)` shape as
    /// [`PredictorPass::params`]. Rows of zeros contribute nothing, which is
    /// how skipped samples are excluded.
    pub fn backward(&self, pass: &PredictorPass, grad_params: ArrayView2<f32>) -> PipelineResult<Vec<f32>> {
        let span = self.tone_max - self.tone_min;
        let mut grad = Array2::<f32>::zeros(pass.logits.raw_dim());
        for ((i, j), g) in grad.indexed_iter_mut() {
            let s = sigmoid(pass.logits[[i, j]]);
            let scale = if j < self.tone_arity { span } else { self.max_sigma };
            *g = grad_params[[i, j]] * scale * s * (1.0 - s);
        }

        let mut grads = vec![0.0f32; self.weights.len()];
        for (index, layer) in self.layers.iter().enumerate().rev() {
            let input = &pass.activations[index];
            let grad_input = layer.backward(&self.weights, input, &grad, &mut grads)?;
            if index == 0 {
                break;
            }
            // ReLU: the stored input is the activation of the previous layer
            grad = grad_input;
            grad.zip_mut_with(input, |g, &a| {
                if a <= 0.0 {
                    *g = 0.0;
                }
            });
        }
        Ok(grads)
    }
}
