// SPDX-License-Identifier: MIT
//! # Monotonic Tone Curves
//!
//! Pixel-wise intensity remapping applied before blur. Every curve family here
//! is monotonic non-decreasing in the input intensity for parameters inside the
//! bounds reported by [`ToneCurve::valid_bounds`], so no intensity inversion can
//! be produced by a predicted parameter.
//!
//! ## Families
//!
//! - **Reinhard** (`k = 1 / white_point`): `out_c = x_c / (1 + k * L(x))` with
//!   `L` the Rec.709 luminance. `k = 0` is the identity.
//! - **Gamma**: `out = x^gamma`, one exponent for all channels. `gamma = 1` is
//!   the identity.
//! - **ChannelGamma**: one exponent per channel.
//!
//! Images are planar `(channels, height, width)` with values in `[0, 1]`.
//! Outputs are clipped back into that range.

use clap::ValueEnum;
use ndarray::{Array2, Array3, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Rec.709 luminance weights for RGB input.
pub const LUMA_WEIGHTS: [f32; 3] = [0.2126, 0.7152, 0.0722];

/// Tone curve family selected for a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToneCurve {
    /// Luminance-driven Reinhard compression, one parameter.
    Reinhard,
    /// Shared power curve, one parameter.
    Gamma,
    /// Power curve with one exponent per channel.
    ChannelGamma,
}

impl ToneCurve {
    /// Number of tone parameters for an image with `channels` planes.
    pub fn arity(self, channels: usize) -> usize {
        match self {
            ToneCurve::Reinhard | ToneCurve::Gamma => 1,
            ToneCurve::ChannelGamma => channels,
        }
    }

    /// Parameter value that leaves every pixel unchanged.
    pub fn identity_value(self) -> f32 {
        match self {
            ToneCurve::Reinhard => 0.0,
            ToneCurve::Gamma | ToneCurve::ChannelGamma => 1.0,
        }
    }

    /// Identity parameter vector for an image with `channels` planes.
    pub fn identity_params(self, channels: usize) -> Vec<f32> {
        vec![self.identity_value(); self.arity(channels)]
    }

    /// Whether `[lo, hi]` keeps the curve monotonic and well defined.
    ///
    /// Reinhard needs `k >= 0`; the gamma families need strictly positive
    /// exponents.
    pub fn valid_bounds(self, lo: f32, hi: f32) -> bool {
        if !(lo.is_finite() && hi.is_finite()) || lo >= hi {
            return false;
        }
        match self {
            ToneCurve::Reinhard => lo >= 0.0,
            ToneCurve::Gamma | ToneCurve::ChannelGamma => lo > 0.0,
        }
    }

    /// Apply the curve to a planar image.
    ///
    /// # Arguments
    /// * `image` - `(C, H, W)` image in `[0, 1]`
    /// * `params` - exactly [`ToneCurve::arity`] values
    ///
    /// # Panics
    /// Panics if `params` is shorter than the arity, and in debug builds if
    /// its length differs from the arity at all.
    pub fn apply(self, image: ArrayView3<f32>, params: &[f32]) -> Array3<f32> {
        debug_assert_eq!(params.len(), self.arity(image.dim().0), "tone parameters for {self:?}");
        match self {
            ToneCurve::Reinhard => {
                let k = params[0];
                if k == 0.0 {
                    return image.mapv(|v| v.clamp(0.0, 1.0));
                }
                let lum = luminance(image);
                let mut out = image.to_owned();
                for mut plane in out.axis_iter_mut(Axis(0)) {
                    Zip::from(&mut plane).and(&lum).for_each(|v, &l| {
                        *v = (*v / (1.0 + k * l)).clamp(0.0, 1.0);
                    });
                }
                out
            }
            ToneCurve::Gamma => {
                let g = params[0];
                image.mapv(|v| power(v, g))
            }
            ToneCurve::ChannelGamma => {
                let mut out = image.to_owned();
                for (c, mut plane) in out.axis_iter_mut(Axis(0)).enumerate() {
                    let g = params[c];
                    plane.mapv_inplace(|v| power(v, g));
                }
                out
            }
        }
    }

    /// Derivative of the curve output with respect to parameter `index`.
    ///
    /// Returns a `(C, H, W)` image. The clip at the range ends is ignored: for
    /// in-range input and in-bounds parameters the unclipped output never
    /// leaves `[0, 1]`.
    ///
    /// `params` has the same precondition as [`ToneCurve::apply`], and
    /// `index` must be below the arity.
    pub fn param_derivative(self, image: ArrayView3<f32>, params: &[f32], index: usize) -> Array3<f32> {
        debug_assert_eq!(params.len(), self.arity(image.dim().0), "tone parameters for {self:?}");
        match self {
            ToneCurve::Reinhard => {
                let k = params[0];
                let lum = luminance(image);
                let mut out = image.to_owned();
                for mut plane in out.axis_iter_mut(Axis(0)) {
                    Zip::from(&mut plane).and(&lum).for_each(|v, &l| {
                        let d = 1.0 + k * l;
                        *v = -(v.clamp(0.0, 1.0)) * l / (d * d);
                    });
                }
                out
            }
            ToneCurve::Gamma => {
                let g = params[0];
                image.mapv(|v| power_derivative(v, g))
            }
            ToneCurve::ChannelGamma => {
                let g = params[index];
                let mut out = Array3::<f32>::zeros(image.raw_dim());
                out.index_axis_mut(Axis(0), index)
                    .assign(&image.index_axis(Axis(0), index).mapv(|v| power_derivative(v, g)));
                out
            }
        }
    }
}

/// Luminance plane of a planar image.
///
/// RGB uses [`LUMA_WEIGHTS`]; any other channel count uses the channel mean.
pub fn luminance(image: ArrayView3<f32>) -> Array2<f32> {
    let (c, h, w) = image.dim();
    let mut lum = Array2::<f32>::zeros((h, w));
    if c == 3 {
        for (plane, weight) in image.axis_iter(Axis(0)).zip(LUMA_WEIGHTS) {
            lum.scaled_add(weight, &plane.mapv(|v| v.clamp(0.0, 1.0)));
        }
    } else if c > 0 {
        for plane in image.axis_iter(Axis(0)) {
            lum.scaled_add(1.0 / c as f32, &plane.mapv(|v| v.clamp(0.0, 1.0)));
        }
    }
    lum
}

#[inline]
fn power(v: f32, g: f32) -> f32 {
    let v = v.clamp(0.0, 1.0);
    if g == 1.0 {
        v
    } else {
        v.powf(g).clamp(0.0, 1.0)
    }
}

#[inline]
fn power_derivative(v: f32, g: f32) -> f32 {
    let v = v.clamp(0.0, 1.0);
    if v <= 0.0 {
        0.0
    } else {
        v.powf(g) * v.ln()
    }
}
