// SPDX-License-Identifier: MIT
//! Conversions between interleaved 8-bit buffers and planar `[0, 1]` images.

use anyhow::{ensure, Result};
use ndarray::{Array3, ArrayView3};

/// Interleaved `H × W × C` bytes to a planar `(C, H, W)` image in `[0, 1]`.
pub fn interleaved_to_planar(bytes: &[u8], width: usize, height: usize, channels: usize) -> Result<Array3<f32>> {
    ensure!(
        bytes.len() == width * height * channels,
        "buffer holds {} bytes, expected {}x{}x{}",
        bytes.len(),
        width,
        height,
        channels
    );
    Ok(Array3::from_shape_fn((channels, height, width), |(c, y, x)| {
        bytes[(y * width + x) * channels + c] as f32 / 255.0
    }))
}

/// Planar `(C, H, W)` image to interleaved bytes, rounding and saturating.
pub fn planar_to_interleaved(image: ArrayView3<f32>) -> Vec<u8> {
    let (c, h, w) = image.dim();
    let mut out = vec![0u8; c * h * w];
    for ((ch, y, x), &v) in image.indexed_iter() {
        out[(y * w + x) * c + ch] = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleaved_planar_layout() {
        let bytes = [255u8, 0, 0, 0, 255, 0];
        let img = interleaved_to_planar(&bytes, 2, 1, 3).unwrap();
        assert_eq!(img.dim(), (3, 1, 2));
        assert_eq!(img[[0, 0, 0]], 1.0);
        assert_eq!(img[[1, 0, 1]], 1.0);
        assert_eq!(planar_to_interleaved(img.view()), bytes.to_vec());
    }

    #[test]
    fn test_wrong_length_is_rejected() {
        assert!(interleaved_to_planar(&[0u8; 5], 2, 1, 3).is_err());
    }
}
