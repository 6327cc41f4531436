// SPDX-License-Identifier: MIT
//! # Letterbox Plan Computation
//!
//! Detector inputs are square canvases of a fixed side. Source images are
//! scaled to fit inside that canvas while keeping their aspect ratio, then
//! centred on a flat background (YOLO uses gray 114).
//!
//! The plan is pure arithmetic; [`crate::cpu`] executes it.

/// 2D size in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Size {
    pub w: u32,
    pub h: u32,
}

/// YOLO letterbox background.
pub const LETTERBOX_GRAY: [u8; 3] = [114, 114, 114];

/// Computed output canvas and the sub-rectangle holding scaled content.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScalePlan {
    pub input: Size,
    pub out: Size,
    /// `(x, y, w, h)` of the scaled content inside `out`
    pub dst_roi: (u32, u32, u32, u32),
    /// Fill for the canvas outside `dst_roi`
    pub bg_rgb: [u8; 3],
}

impl ScalePlan {
    /// Map a normalized `(cx, cy, w, h)` box in source coordinates into the
    /// normalized coordinates of the planned canvas.
    pub fn map_box(&self, cx: f32, cy: f32, w: f32, h: f32) -> (f32, f32, f32, f32) {
        let (x, y, rw, rh) = self.dst_roi;
        let ow = self.out.w as f32;
        let oh = self.out.h as f32;
        (
            (x as f32 + cx * rw as f32) / ow,
            (y as f32 + cy * rh as f32) / oh,
            w * rw as f32 / ow,
            h * rh as f32 / oh,
        )
    }
}

/// Plan a square `side × side` letterbox canvas for `input`.
///
/// # Arguments
/// * `input` - source dimensions
/// * `side` - canvas side length in pixels
/// * `bg_rgb` - padding colour
pub fn build_plan(input: Size, side: u32, bg_rgb: [u8; 3]) -> ScalePlan {
    let out = Size { w: side.max(1), h: side.max(1) };
    let (rw, rh) = fit_within(input, out);
    let x = (out.w - rw) / 2;
    let y = (out.h - rh) / 2;
    ScalePlan { input, out, dst_roi: (x, y, rw, rh), bg_rgb }
}

/// Largest size with the input's aspect ratio that fits in `bounds`.
/// Upscales when the input is smaller; never returns a zero side.
pub fn fit_within(input: Size, bounds: Size) -> (u32, u32) {
    let iw = input.w.max(1) as f32;
    let ih = input.h.max(1) as f32;
    let scale = (bounds.w as f32 / iw).min(bounds.h as f32 / ih);
    let w = ((iw * scale).round() as u32).clamp(1, bounds.w.max(1));
    let h = ((ih * scale).round() as u32).clamp(1, bounds.h.max(1));
    (w, h)
}
