//! Perceptual per-pixel comparison of two equally sized RGBA images.
//!
//! Colour distance is measured in YIQ space, with semi-transparent pixels
//! blended onto white first. Two pixels differ when their squared distance
//! exceeds `MAX_YIQ_DELTA * sensitivity²`. Anti-aliasing is not detected.

use image::{Rgba, RgbaImage};

// Squared YIQ distance between black and white.
const MAX_YIQ_DELTA: f64 = 35215.0;
const DIFF_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
const FADE_ALPHA: f64 = 0.1;

pub struct PixelDiff {
    pub diff_pixels: u64,
    /// The baseline faded to grey with differing pixels painted red.
    pub image: RgbaImage,
}

/// Compares `current` against `baseline`. Returns `None` when the
/// dimensions differ.
pub fn diff(
    current: &RgbaImage,
    baseline: &RgbaImage,
    sensitivity: f64,
) -> Option<PixelDiff> {
    if current.dimensions() != baseline.dimensions() {
        return None;
    }
    let (width, height) = current.dimensions();
    let max_delta = MAX_YIQ_DELTA * sensitivity * sensitivity;
    let mut image = RgbaImage::new(width, height);
    let mut diff_pixels = 0;

    for ((a, b), out) in current
        .pixels()
        .zip(baseline.pixels())
        .zip(image.pixels_mut())
    {
        if a == b {
            *out = gray(a);
            continue;
        }
        if color_delta(a, b) > max_delta {
            diff_pixels += 1;
            *out = DIFF_COLOR;
        } else {
            *out = gray(a);
        }
    }

    Some(PixelDiff { diff_pixels, image })
}

fn blend(channel: u8, alpha: f64) -> f64 {
    255.0 + (channel as f64 - 255.0) * alpha
}

fn yiq(pixel: &Rgba<u8>) -> (f64, f64, f64) {
    let [r, g, b, a] = pixel.0;
    let alpha = a as f64 / 255.0;
    let (r, g, b) = (blend(r, alpha), blend(g, alpha), blend(b, alpha));
    (
        r * 0.29889531 + g * 0.58662247 + b * 0.11448223,
        r * 0.59597799 - g * 0.27417610 - b * 0.32180189,
        r * 0.21147017 - g * 0.52261711 + b * 0.31114694,
    )
}

fn color_delta(a: &Rgba<u8>, b: &Rgba<u8>) -> f64 {
    let (y1, i1, q1) = yiq(a);
    let (y2, i2, q2) = yiq(b);
    let (y, i, q) = (y1 - y2, i1 - i2, q1 - q2);
    0.5053 * y * y + 0.299 * i * i + 0.1957 * q * q
}

fn gray(pixel: &Rgba<u8>) -> Rgba<u8> {
    let (y, _, _) = yiq(pixel);
    let value = (255.0 + (y - 255.0) * FADE_ALPHA).clamp(0.0, 255.0) as u8;
    Rgba([value, value, value, 255])
}
