//! Frame compositor: placement and pixel operations for the camera overlay.
//!
//! The overlay is a square cut from the center of the camera image, clipped
//! to a rounded square (anti-aliased), optionally mirrored, and outlined with
//! a translucent white stroke.

use image::{Rgba, RgbaImage};
use recast_project_model::{CameraExportConfig, PipPosition};

/// Gap between the overlay and the canvas edges, per axis.
pub const PIP_MARGIN_RATIO: f64 = 0.02;

/// Border stroke width in pixels.
pub const BORDER_WIDTH_PX: f32 = 3.0;

/// Opacity of the white border stroke.
pub const BORDER_ALPHA: f32 = 0.3;

/// Where the camera overlay lands on the canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipPlacement {
    /// Left edge in canvas pixels.
    pub x: u32,
    /// Top edge in canvas pixels.
    pub y: u32,
    /// Side length of the square footprint.
    pub size: u32,
    /// Corner radius in pixels; `size / 2` is a circle.
    pub radius: f32,
}

impl PipPlacement {
    /// Placement for `config` on a `canvas_width` x `canvas_height` canvas.
    ///
    /// Returns `None` when the canvas has no room for an overlay.
    pub fn compute(config: &CameraExportConfig, canvas_width: u32, canvas_height: u32) -> Option<Self> {
        let margin_x = (canvas_width as f64 * PIP_MARGIN_RATIO).round() as u32;
        let margin_y = (canvas_height as f64 * PIP_MARGIN_RATIO).round() as u32;
        let room = canvas_width
            .saturating_sub(2 * margin_x)
            .min(canvas_height.saturating_sub(2 * margin_y));
        let size = ((canvas_width as f64 * config.size.width_ratio()).round() as u32).min(room);
        if size == 0 {
            return None;
        }

        let right = canvas_width - size - margin_x;
        let bottom = canvas_height - size - margin_y;
        let (x, y) = match config.position {
            PipPosition::TopLeft => (margin_x, margin_y),
            PipPosition::TopRight => (right, margin_y),
            PipPosition::BottomLeft => (margin_x, bottom),
            PipPosition::BottomRight => (right, bottom),
        };
        let radius = f32::from(config.border_radius.min(100)) / 100.0 * size as f32 / 2.0;
        Some(Self { x, y, size, radius })
    }
}

/// Signed distance from pixel (`px`, `py`)'s center to the edge of a rounded
/// square of side `size`; negative inside.
pub fn rounded_square_distance(px: u32, py: u32, size: u32, radius: f32) -> f32 {
    let half = size as f32 / 2.0;
    let radius = radius.clamp(0.0, half);
    let qx = (px as f32 + 0.5 - half).abs() - (half - radius);
    let qy = (py as f32 + 0.5 - half).abs() - (half - radius);
    let outside = (qx.max(0.0).powi(2) + qy.max(0.0).powi(2)).sqrt();
    outside + qx.max(qy).min(0.0) - radius
}

/// Fill `scratch` with the center square of `camera`, scaled bilinearly.
pub fn fill_center_crop(scratch: &mut RgbaImage, camera: &RgbaImage, mirrored: bool) {
    let (cw, ch) = camera.dimensions();
    let side = scratch.width();
    if cw == 0 || ch == 0 || side == 0 {
        return;
    }
    let crop = cw.min(ch) as f32;
    let offset_x = (cw as f32 - crop) / 2.0;
    let offset_y = (ch as f32 - crop) / 2.0;
    let scale = crop / side as f32;

    for (dx, dy, pixel) in scratch.enumerate_pixels_mut() {
        let column = if mirrored { side - 1 - dx } else { dx };
        let u = offset_x + (column as f32 + 0.5) * scale - 0.5;
        let v = offset_y + (dy as f32 + 0.5) * scale - 0.5;
        *pixel = sample_bilinear(camera, u, v);
    }
}

fn sample_bilinear(image: &RgbaImage, u: f32, v: f32) -> Rgba<u8> {
    let max_x = image.width() - 1;
    let max_y = image.height() - 1;
    let u = u.clamp(0.0, max_x as f32);
    let v = v.clamp(0.0, max_y as f32);
    let x0 = u.floor() as u32;
    let y0 = v.floor() as u32;
    let x1 = (x0 + 1).min(max_x);
    let y1 = (y0 + 1).min(max_y);
    let fx = u - x0 as f32;
    let fy = v - y0 as f32;

    let p00 = image.get_pixel(x0, y0).0;
    let p10 = image.get_pixel(x1, y0).0;
    let p01 = image.get_pixel(x0, y1).0;
    let p11 = image.get_pixel(x1, y1).0;
    let mut out = [0u8; 4];
    for c in 0..4 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgba(out)
}

fn blend(dst: &mut Rgba<u8>, src: [u8; 3], alpha: f32) {
    if alpha <= 0.0 {
        return;
    }
    let alpha = alpha.min(1.0);
    for c in 0..3 {
        let mixed = dst.0[c] as f32 * (1.0 - alpha) + src[c] as f32 * alpha;
        dst.0[c] = mixed.round().clamp(0.0, 255.0) as u8;
    }
}

/// Draw `scratch` onto `target` at `placement` with the rounded clip and
/// border stroke. Returns the number of canvas pixels touched.
pub fn composite_overlay(target: &mut RgbaImage, scratch: &RgbaImage, placement: &PipPlacement) -> u64 {
    let mut touched = 0;
    let size = placement.size.min(scratch.width()).min(scratch.height());
    for sy in 0..size {
        let ty = placement.y + sy;
        if ty >= target.height() {
            break;
        }
        for sx in 0..size {
            let tx = placement.x + sx;
            if tx >= target.width() {
                break;
            }
            let distance = rounded_square_distance(sx, sy, placement.size, placement.radius);
            let coverage = (0.5 - distance).clamp(0.0, 1.0);
            if coverage <= 0.0 {
                continue;
            }
            let stroke = (distance + BORDER_WIDTH_PX + 0.5).clamp(0.0, 1.0) * coverage;

            let camera = scratch.get_pixel(sx, sy).0;
            let pixel = target.get_pixel_mut(tx, ty);
            blend(pixel, [camera[0], camera[1], camera[2]], coverage);
            blend(pixel, [255, 255, 255], BORDER_ALPHA * stroke);
            touched += 1;
        }
    }
    touched
}
