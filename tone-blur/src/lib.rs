// SPDX-License-Identifier: MIT
//! # tone-blur: Pixel Operators for Codec-Aware Preprocessing
//!
//! Image operators applied on the edge device before JPEG encoding, each
//! exposing the derivatives a training loop needs to learn their parameters.
//!
//! ## Key Components
//!
//! - [`tone`]: monotonic tone curves (Reinhard, gamma, per-channel gamma)
//! - [`blur`]: separable Gaussian blur with `d/d(sigma)`
//! - [`presets`]: letterbox plan computation for square detector inputs
//! - [`cpu`]: SIMD letterbox resize via fast_image_resize
//! - [`layout`]: interleaved bytes ⇄ planar `[0, 1]` images
//!
//! ## Usage Example
//!
//! ```rust
//! use ndarray::Array3;
//! use tone_blur::{blur::gaussian_blur, tone::ToneCurve};
//!
//! let image = Array3::<f32>::from_elem((3, 16, 16), 0.5);
//! let toned = ToneCurve::Reinhard.apply(image.view(), &[0.5]);
//! let blurred = gaussian_blur(toned.view(), 1.2);
//! assert_eq!(blurred.dim(), image.dim());
//! ```

pub mod blur;
pub mod cpu;
pub mod layout;
pub mod presets;
pub mod tone;
