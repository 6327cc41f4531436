// SPDX-License-Identifier: MIT
//! # Separable Gaussian Blur with a Sigma Derivative
//!
//! The blur is applied as a horizontal pass followed by a vertical pass over
//! each plane of a planar `(C, H, W)` image.
//!
//! ## Kernel
//!
//! - Radius `ceil(3 * sigma)` on each side, weights normalized to sum to one.
//! - Sigma below [`MIN_SIGMA`] is treated as no blur and returns an exact copy.
//!
//! ## Edges
//!
//! Reflect-101: samples past the border mirror around the edge pixel without
//! repeating it (`-1 -> 1`, `n -> n - 2`). Single-pixel axes always read
//! index 0.
//!
//! ## Derivative
//!
//! [`gaussian_blur_with_derivative`] also returns `d(out)/d(sigma)` by
//! differentiating both 1-D kernels:
//!
//! ```text
//! d/ds (Kv * (Kh * x)) = Kv' * (Kh * x) + Kv * (Kh' * x)
//! ```

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};

/// Sigma values below this are treated as no blur.
pub const MIN_SIGMA: f32 = 1e-3;

/// Kernel half-width for a given sigma.
pub fn kernel_radius(sigma: f32) -> usize {
    if sigma < MIN_SIGMA {
        0
    } else {
        (3.0 * sigma).ceil() as usize
    }
}

/// Normalized 1-D Gaussian taps and their derivative with respect to sigma.
#[derive(Clone, Debug)]
pub struct GaussianKernel {
    pub sigma: f32,
    pub radius: usize,
    /// `2 * radius + 1` taps, centre at index `radius`.
    pub weights: Vec<f32>,
    /// `d(weights)/d(sigma)`, same length as `weights`.
    pub derivative: Vec<f32>,
}

impl GaussianKernel {
    pub fn new(sigma: f32) -> Self {
        let radius = kernel_radius(sigma);
        if radius == 0 {
            return Self { sigma, radius, weights: vec![1.0], derivative: vec![0.0] };
        }
        let s = sigma as f64;
        let offsets: Vec<f64> = (0..=2 * radius).map(|i| i as f64 - radius as f64).collect();
        let raw: Vec<f64> = offsets.iter().map(|d| (-d * d / (2.0 * s * s)).exp()).collect();
        let z: f64 = raw.iter().sum();
        let g: Vec<f64> = raw.iter().map(|e| e / z).collect();
        // E_g[d^2] / s^3 is the normalizer's contribution to each tap's derivative.
        let mean_sq: f64 = g.iter().zip(&offsets).map(|(gi, d)| gi * d * d).sum();
        let s3 = s * s * s;
        let derivative = g
            .iter()
            .zip(&offsets)
            .map(|(gi, d)| (gi * (d * d - mean_sq) / s3) as f32)
            .collect();
        Self { sigma, radius, weights: g.into_iter().map(|v| v as f32).collect(), derivative }
    }

    pub fn is_identity(&self) -> bool {
        self.radius == 0
    }
}

/// Reflect-101 index mapping for an axis of length `n`.
#[inline]
pub fn reflect_index(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let mut m = i.rem_euclid(period);
    if m >= n as isize {
        m = period - m;
    }
    m as usize
}

/// Convolve every row of `plane` with `taps` (horizontal pass).
pub fn convolve_rows(plane: ArrayView2<f32>, taps: &[f32]) -> Array2<f32> {
    let (h, w) = plane.dim();
    let r = (taps.len() / 2) as isize;
    let mut out = Array2::<f32>::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (k, &t) in taps.iter().enumerate() {
                let xi = reflect_index(x as isize + k as isize - r, w);
                acc += t * plane[[y, xi]];
            }
            out[[y, x]] = acc;
        }
    }
    out
}

/// Convolve every column of `plane` with `taps` (vertical pass).
pub fn convolve_cols(plane: ArrayView2<f32>, taps: &[f32]) -> Array2<f32> {
    let (h, w) = plane.dim();
    let r = (taps.len() / 2) as isize;
    let mut out = Array2::<f32>::zeros((h, w));
    for y in 0..h {
        for (k, &t) in taps.iter().enumerate() {
            let yi = reflect_index(y as isize + k as isize - r, h);
            let src = plane.row(yi);
            out.row_mut(y).scaled_add(t, &src);
        }
    }
    out
}

/// Blur a single plane with a prepared kernel.
pub fn blur_plane(plane: ArrayView2<f32>, kernel: &GaussianKernel) -> Array2<f32> {
    if kernel.is_identity() {
        return plane.to_owned();
    }
    let tmp = convolve_rows(plane, &kernel.weights);
    convolve_cols(tmp.view(), &kernel.weights)
}

/// Blur every plane of a `(C, H, W)` image.
///
/// `sigma == 0` returns an exact copy of the input.
pub fn gaussian_blur(image: ArrayView3<f32>, sigma: f32) -> Array3<f32> {
    let kernel = GaussianKernel::new(sigma);
    blur_with_kernel(image, &kernel)
}

/// Blur every plane with a prepared kernel.
pub fn blur_with_kernel(image: ArrayView3<f32>, kernel: &GaussianKernel) -> Array3<f32> {
    if kernel.is_identity() {
        return image.to_owned();
    }
    let mut out = Array3::<f32>::zeros(image.raw_dim());
    for (src, mut dst) in image.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
        dst.assign(&blur_plane(src, kernel));
    }
    out
}

/// Blur and return `(blurred, d(blurred)/d(sigma))`.
///
/// The derivative is all zeros when sigma is below [`MIN_SIGMA`].
pub fn gaussian_blur_with_derivative(image: ArrayView3<f32>, kernel: &GaussianKernel) -> (Array3<f32>, Array3<f32>) {
    if kernel.is_identity() {
        return (image.to_owned(), Array3::zeros(image.raw_dim()));
    }
    let mut out = Array3::<f32>::zeros(image.raw_dim());
    let mut dout = Array3::<f32>::zeros(image.raw_dim());
    for ((src, mut dst), mut ddst) in image
        .axis_iter(Axis(0))
        .zip(out.axis_iter_mut(Axis(0)))
        .zip(dout.axis_iter_mut(Axis(0)))
    {
        let tmp = convolve_rows(src, &kernel.weights);
        let dtmp = convolve_rows(src, &kernel.derivative);
        dst.assign(&convolve_cols(tmp.view(), &kernel.weights));
        let mut d = convolve_cols(tmp.view(), &kernel.derivative);
        d += &convolve_cols(dtmp.view(), &kernel.weights);
        ddst.assign(&d);
    }
    (out, dout)
}
