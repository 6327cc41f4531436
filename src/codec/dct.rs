//! 8×8 DCT, JPEG quantization tables and JFIF colour conversion.
//!
//! Pixel planes are level-shifted into the JPEG sample domain
//! (`255 * v - 128`) before the transform, so the quantization tables apply
//! unchanged.

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};

pub const BLOCK: usize = 8;
pub const BLOCK_LEN: usize = BLOCK * BLOCK;

/// Annex K luminance table, row-major.
pub const LUMA_QUANT: [u16; BLOCK_LEN] = [
    16, 11, 10, 16, 24, 40, 51, 61, //
    12, 12, 14, 19, 26, 58, 60, 55, //
    14, 13, 16, 24, 40, 57, 69, 56, //
    14, 17, 22, 29, 51, 87, 80, 62, //
    18, 22, 37, 56, 68, 109, 103, 77, //
    24, 35, 55, 64, 81, 104, 113, 92, //
    49, 64, 78, 87, 103, 121, 120, 101, //
    72, 92, 95, 98, 112, 100, 103, 99,
];

/// Annex K chrominance table, row-major.
pub const CHROMA_QUANT: [u16; BLOCK_LEN] = [
    17, 18, 24, 47, 99, 99, 99, 99, //
    18, 21, 26, 66, 99, 99, 99, 99, //
    24, 26, 56, 99, 99, 99, 99, 99, //
    47, 66, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99,
];

/// Scale a base table by IJG quality (1-100). Entries are clamped to 1..=255.
pub fn scaled_table(base: &[u16; BLOCK_LEN], quality: u8) -> [f32; BLOCK_LEN] {
    let q = quality.clamp(1, 100) as u32;
    let scale = if q < 50 { 5000 / q } else { 200 - 2 * q };
    let mut out = [1.0f32; BLOCK_LEN];
    for (dst, &b) in out.iter_mut().zip(base.iter()) {
        *dst = ((b as u32 * scale + 50) / 100).clamp(1, 255) as f32;
    }
    out
}

/// Orthonormal 8-point DCT-II basis, `basis[u][x]`.
#[derive(Clone, Debug)]
pub struct Dct8 {
    basis: [[f32; BLOCK]; BLOCK],
}

impl Default for Dct8 {
    fn default() -> Self {
        Self::new()
    }
}

impl Dct8 {
    pub fn new() -> Self {
        let mut basis = [[0.0f32; BLOCK]; BLOCK];
        for (u, row) in basis.iter_mut().enumerate() {
            let alpha = if u == 0 { (1.0f64 / 8.0).sqrt() } else { (2.0f64 / 8.0).sqrt() };
            for (x, v) in row.iter_mut().enumerate() {
                *v = (alpha * (((2 * x + 1) * u) as f64 * std::f64::consts::PI / 16.0).cos()) as f32;
            }
        }
        Self { basis }
    }

    /// `C · B · Cᵀ` on a row-major block.
    pub fn forward(&self, block: &[f32; BLOCK_LEN]) -> [f32; BLOCK_LEN] {
        let c = &self.basis;
        let mut tmp = [0.0f32; BLOCK_LEN];
        for u in 0..BLOCK {
            for x in 0..BLOCK {
                let mut acc = 0.0;
                for y in 0..BLOCK {
                    acc += c[u][y] * block[y * BLOCK + x];
                }
                tmp[u * BLOCK + x] = acc;
            }
        }
        let mut out = [0.0f32; BLOCK_LEN];
        for u in 0..BLOCK {
            for v in 0..BLOCK {
                let mut acc = 0.0;
                for x in 0..BLOCK {
                    acc += tmp[u * BLOCK + x] * c[v][x];
                }
                out[u * BLOCK + v] = acc;
            }
        }
        out
    }

    /// `Cᵀ · X · C`. Also maps coefficient gradients back to pixel gradients.
    pub fn inverse(&self, coefs: &[f32; BLOCK_LEN]) -> [f32; BLOCK_LEN] {
        let c = &self.basis;
        let mut tmp = [0.0f32; BLOCK_LEN];
        for y in 0..BLOCK {
            for v in 0..BLOCK {
                let mut acc = 0.0;
                for u in 0..BLOCK {
                    acc += c[u][y] * coefs[u * BLOCK + v];
                }
                tmp[y * BLOCK + v] = acc;
            }
        }
        let mut out = [0.0f32; BLOCK_LEN];
        for y in 0..BLOCK {
            for x in 0..BLOCK {
                let mut acc = 0.0;
                for v in 0..BLOCK {
                    acc += tmp[y * BLOCK + v] * c[v][x];
                }
                out[y * BLOCK + x] = acc;
            }
        }
        out
    }
}

/// Read the level-shifted block at block coordinates `(by, bx)`.
pub fn read_block(plane: ArrayView2<f32>, by: usize, bx: usize) -> [f32; BLOCK_LEN] {
    let mut block = [0.0f32; BLOCK_LEN];
    for y in 0..BLOCK {
        for x in 0..BLOCK {
            block[y * BLOCK + x] = plane[[by * BLOCK + y, bx * BLOCK + x]] * 255.0 - 128.0;
        }
    }
    block
}

/// Write a sample-domain block back as `[0, 1]` values, undoing the level shift.
pub fn write_block(plane: &mut Array2<f32>, by: usize, bx: usize, block: &[f32; BLOCK_LEN]) {
    for y in 0..BLOCK {
        for x in 0..BLOCK {
            plane[[by * BLOCK + y, bx * BLOCK + x]] = (block[y * BLOCK + x] + 128.0) / 255.0;
        }
    }
}

/// Add `scale * block` into a gradient plane.
pub fn accumulate_block(plane: &mut Array2<f32>, by: usize, bx: usize, block: &[f32; BLOCK_LEN], scale: f32) {
    for y in 0..BLOCK {
        for x in 0..BLOCK {
            plane[[by * BLOCK + y, bx * BLOCK + x]] += scale * block[y * BLOCK + x];
        }
    }
}

/// JFIF RGB → YCbCr matrix, rows Y, Cb, Cr. Chroma carries a +0.5 offset.
pub const RGB_TO_YCC: [[f32; 3]; 3] = [
    [0.299, 0.587, 0.114],
    [-0.168_736, -0.331_264, 0.5],
    [0.5, -0.418_688, -0.081_312],
];

/// Convert a planar image to codec planes. Single-channel input is its own
/// luma plane.
pub fn to_codec_planes(image: ArrayView3<f32>) -> Array3<f32> {
    if image.len_of(Axis(0)) != 3 {
        return image.to_owned();
    }
    let (_, h, w) = image.dim();
    let mut out = Array3::<f32>::zeros((3, h, w));
    for (k, m) in RGB_TO_YCC.iter().enumerate() {
        let offset = if k == 0 { 0.0 } else { 0.5 };
        let mut plane = out.index_axis_mut(Axis(0), k);
        plane.fill(offset);
        for (c, &weight) in m.iter().enumerate() {
            plane.scaled_add(weight, &image.index_axis(Axis(0), c));
        }
    }
    out
}

/// Inverse of [`to_codec_planes`].
pub fn from_codec_planes(planes: ArrayView3<f32>) -> Array3<f32> {
    if planes.len_of(Axis(0)) != 3 {
        return planes.to_owned();
    }
    let mut out = Array3::<f32>::zeros(planes.raw_dim());
    let y = planes.index_axis(Axis(0), 0);
    let cb = planes.index_axis(Axis(0), 1);
    let cr = planes.index_axis(Axis(0), 2);
    Zip::from(out.index_axis_mut(Axis(0), 0))
        .and(&y)
        .and(&cr)
        .for_each(|r, &y, &cr| *r = y + 1.402 * (cr - 0.5));
    Zip::from(out.index_axis_mut(Axis(0), 1))
        .and(&y)
        .and(&cb)
        .and(&cr)
        .for_each(|g, &y, &cb, &cr| *g = y - 0.344_136 * (cb - 0.5) - 0.714_136 * (cr - 0.5));
    Zip::from(out.index_axis_mut(Axis(0), 2))
        .and(&y)
        .and(&cb)
        .for_each(|b, &y, &cb| *b = y + 1.772 * (cb - 0.5));
    out
}

/// Pull a gradient on codec planes back to the planar input (`Mᵀ g`).
pub fn codec_planes_grad_to_input(grad: ArrayView3<f32>) -> Array3<f32> {
    if grad.len_of(Axis(0)) != 3 {
        return grad.to_owned();
    }
    let mut out = Array3::<f32>::zeros(grad.raw_dim());
    for (k, m) in RGB_TO_YCC.iter().enumerate() {
        let g = grad.index_axis(Axis(0), k);
        for (c, &weight) in m.iter().enumerate() {
            out.index_axis_mut(Axis(0), c).scaled_add(weight, &g);
        }
    }
    out
}
