//! Frame quality scoring on the luma plane.
//!
//! score = w_sharp * min(laplacian_variance / 1000, 1)
//!       + w_bright * (1 - 2 * |mean / 255 - 0.5|)
//!       + w_contrast * min(stddev / 100, 1)

use image::{imageops, GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

const SHARPNESS_NORM: f64 = 1000.0;
const CONTRAST_NORM: f64 = 100.0;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub sharpness: f64,
    pub brightness: f64,
    pub contrast: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            sharpness: 0.5,
            brightness: 0.3,
            contrast: 0.2,
        }
    }
}

/// Per-component scores, each in `[0, 1]`, plus the weighted total.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QualityReport {
    pub sharpness: f64,
    pub brightness: f64,
    pub contrast: f64,
    pub score: f64,
}

pub fn assess(image: &RgbImage, weights: &QualityWeights) -> QualityReport {
    let luma = imageops::grayscale(image);
    let (mean, stddev) = mean_stddev(&luma);

    let sharpness = (laplacian_variance(&luma) / SHARPNESS_NORM).min(1.0);
    let brightness = (1.0 - 2.0 * (mean / 255.0 - 0.5).abs()).clamp(0.0, 1.0);
    let contrast = (stddev / CONTRAST_NORM).min(1.0);

    let score = weights.sharpness * sharpness
        + weights.brightness * brightness
        + weights.contrast * contrast;
    QualityReport {
        sharpness,
        brightness,
        contrast,
        score: score.clamp(0.0, 1.0),
    }
}

fn mean_stddev(luma: &GrayImage) -> (f64, f64) {
    let raw = luma.as_raw();
    if raw.is_empty() {
        return (0.0, 0.0);
    }
    let n = raw.len() as f64;
    let mean = raw.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let variance = raw
        .iter()
        .map(|&v| {
            let d = f64::from(v) - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean, variance.sqrt())
}

/// Variance of the 4-neighbour Laplacian over interior pixels.
fn laplacian_variance(luma: &GrayImage) -> f64 {
    let (w, h) = luma.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let px = |x: u32, y: u32| f64::from(luma.get_pixel(x, y)[0]);

    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut count = 0.0;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            sum += lap;
            sum_sq += lap * lap;
            count += 1.0;
        }
    }
    let mean = sum / count;
    (sum_sq / count - mean * mean).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn checkerboard(width: u32, height: u32, cell: u32, low: u8, high: u8) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let v = if (x / cell + y / cell) % 2 == 0 { low } else { high };
            Rgb([v, v, v])
        })
    }

    #[test]
    fn flat_grey_has_no_sharpness_or_contrast() {
        let image = RgbImage::from_pixel(32, 32, Rgb([128, 128, 128]));
        let report = assess(&image, &QualityWeights::default());
        assert_eq!(report.sharpness, 0.0);
        assert_eq!(report.contrast, 0.0);
        assert!(report.brightness > 0.99);
        assert!((report.score - 0.3 * report.brightness).abs() < 1e-9);
    }

    #[test]
    fn black_frame_scores_zero() {
        let image = RgbImage::new(16, 16);
        assert_eq!(assess(&image, &QualityWeights::default()).score, 0.0);
    }

    #[test]
    fn high_contrast_texture_scores_near_one() {
        let image = checkerboard(64, 64, 4, 0, 255);
        let report = assess(&image, &QualityWeights::default());
        assert_eq!(report.sharpness, 1.0);
        assert_eq!(report.contrast, 1.0);
        assert!(report.score > 0.9);
    }

    #[test]
    fn score_does_not_increase_with_blur() {
        let sharp = checkerboard(96, 96, 8, 113, 143);
        let weights = QualityWeights::default();
        let mut previous = assess(&sharp, &weights).score;
        for sigma in [0.8f32, 1.5, 3.0, 6.0] {
            let blurred = imageops::blur(&sharp, sigma);
            let score = assess(&blurred, &weights).score;
            assert!(
                score <= previous + 1e-3,
                "sigma {sigma}: {score} > {previous}"
            );
            previous = score;
        }
    }

    #[test]
    fn custom_weights_are_respected() {
        let image = RgbImage::from_pixel(8, 8, Rgb([128, 128, 128]));
        let weights = QualityWeights {
            sharpness: 0.0,
            brightness: 1.0,
            contrast: 0.0,
        };
        assert!(assess(&image, &weights).score > 0.99);
    }
}
