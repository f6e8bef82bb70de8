//! Geometric and photometric normalization.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

use crate::frame::FrameGeometry;

/// Gamma values this close to 1.0 are treated as identity.
const GAMMA_EPSILON: f64 = 0.01;

const SHARPEN_KERNEL: [i32; 9] = [0, -1, 0, -1, 5, -1, 0, -1, 0];

/// Scale to fit inside `target_w` x `target_h`, preserving aspect ratio, and
/// center on a black canvas.
pub fn letterbox(image: &RgbImage, target_w: u32, target_h: u32) -> (RgbImage, FrameGeometry) {
    let (w, h) = image.dimensions();
    let scale = (f64::from(target_w) / f64::from(w)).min(f64::from(target_h) / f64::from(h));
    let new_w = ((f64::from(w) * scale).round() as u32).clamp(1, target_w);
    let new_h = ((f64::from(h) * scale).round() as u32).clamp(1, target_h);
    let offset_x = (target_w - new_w) / 2;
    let offset_y = (target_h - new_h) / 2;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(target_w, target_h, Rgb([0, 0, 0]));
    imageops::replace(&mut canvas, &resized, i64::from(offset_x), i64::from(offset_y));

    let geometry = FrameGeometry {
        scale_x: f64::from(new_w) / f64::from(w),
        scale_y: f64::from(new_h) / f64::from(h),
        offset_x: f64::from(offset_x),
        offset_y: f64::from(offset_y),
        source_width: w,
        source_height: h,
    };
    (canvas, geometry)
}

/// Stretch to exactly `target_w` x `target_h`.
pub fn resize(image: &RgbImage, target_w: u32, target_h: u32) -> (RgbImage, FrameGeometry) {
    let (w, h) = image.dimensions();
    let resized = imageops::resize(image, target_w, target_h, FilterType::Triangle);
    let geometry = FrameGeometry {
        scale_x: f64::from(target_w) / f64::from(w),
        scale_y: f64::from(target_h) / f64::from(h),
        offset_x: 0.0,
        offset_y: 0.0,
        source_width: w,
        source_height: h,
    };
    (resized, geometry)
}

/// Apply `out = 255 * (in / 255)^gamma` through a 256-entry table.
/// Returns false (image untouched) when gamma is effectively 1.
pub fn apply_gamma(image: &mut RgbImage, gamma: f64) -> bool {
    if (gamma - 1.0).abs() <= GAMMA_EPSILON {
        return false;
    }
    let mut lut = [0u8; 256];
    for (i, entry) in lut.iter_mut().enumerate() {
        *entry = ((i as f64 / 255.0).powf(gamma) * 255.0).round().clamp(0.0, 255.0) as u8;
    }
    for value in image.iter_mut() {
        *value = lut[*value as usize];
    }
    true
}

/// 3x3 median per channel, edges clamped.
pub fn median3x3(image: &RgbImage) -> RgbImage {
    let (w, h) = image.dimensions();
    RgbImage::from_fn(w, h, |x, y| {
        let mut out = [0u8; 3];
        for (channel, slot) in out.iter_mut().enumerate() {
            let mut window = [0u8; 9];
            for (i, (dx, dy)) in NEIGHBOURS.iter().enumerate() {
                let (sx, sy) = clamp_coords(x, y, *dx, *dy, w, h);
                window[i] = image.get_pixel(sx, sy)[channel];
            }
            window.sort_unstable();
            *slot = window[4];
        }
        Rgb(out)
    })
}

/// Fixed 3x3 sharpen, edges clamped.
pub fn sharpen(image: &RgbImage) -> RgbImage {
    let (w, h) = image.dimensions();
    RgbImage::from_fn(w, h, |x, y| {
        let mut acc = [0i32; 3];
        for (i, (dx, dy)) in NEIGHBOURS.iter().enumerate() {
            let weight = SHARPEN_KERNEL[i];
            if weight == 0 {
                continue;
            }
            let (sx, sy) = clamp_coords(x, y, *dx, *dy, w, h);
            let px = image.get_pixel(sx, sy);
            for c in 0..3 {
                acc[c] += weight * i32::from(px[c]);
            }
        }
        Rgb(acc.map(|v| v.clamp(0, 255) as u8))
    })
}

/// Row-major 3x3 neighbourhood offsets, matching kernel layout.
const NEIGHBOURS: [(i32, i32); 9] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (0, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

fn clamp_coords(x: u32, y: u32, dx: i32, dy: i32, w: u32, h: u32) -> (u32, u32) {
    let sx = (x as i64 + i64::from(dx)).clamp(0, i64::from(w) - 1) as u32;
    let sy = (y as i64 + i64::from(dy)).clamp(0, i64::from(h) - 1) as u32;
    (sx, sy)
}
