use std::sync::Arc;

use image::{DynamicImage, GenericImageView, GrayImage};

/// Longest side images are reduced to before computing signals.
const SIGNAL_MAX_SIDE: u32 = 1600;
/// Sobel magnitude (|gx| + |gy|) above which a pixel counts as an edge.
const EDGE_MAGNITUDE: i32 = 200;
/// Short side of an A4 page in inches, used when no resolution is declared.
const A4_SHORT_SIDE_INCHES: f64 = 8.27;

/// Heuristic measurements that drive detection, preprocessing and routing.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ImageSignals {
    /// Share of pixels on a strong intensity edge, in `[0, 1]`.
    pub edge_density: f64,
    /// Variance of grey levels (0..=255 scale).
    pub pixel_variance: f64,
    pub estimated_dpi: Option<u32>,
    /// Yellowing of the paper: how far red/green sit above blue, in `[0, 1]`.
    pub tint: f64,
}

/// A decoded page together with its signals.
#[derive(Debug, Clone)]
pub struct ImageSample {
    pub page: usize,
    pub image: Arc<DynamicImage>,
    pub signals: ImageSignals,
}

impl ImageSample {
    pub fn analyze(page: usize, image: Arc<DynamicImage>, declared_dpi: Option<u32>) -> Self {
        let signals = ImageSignals::compute(&image, declared_dpi);
        Self {
            page,
            image,
            signals,
        }
    }
}

impl ImageSignals {
    pub fn compute(image: &DynamicImage, declared_dpi: Option<u32>) -> Self {
        let (width, height) = image.dimensions();
        let reduced = if width.max(height) > SIGNAL_MAX_SIDE {
            image.thumbnail(SIGNAL_MAX_SIDE, SIGNAL_MAX_SIDE)
        } else {
            image.clone()
        };
        let gray = reduced.to_luma8();

        Self {
            edge_density: edge_density(&gray),
            pixel_variance: pixel_variance(&gray),
            estimated_dpi: declared_dpi
                .filter(|dpi| *dpi > 0)
                .or_else(|| estimate_dpi(width, height)),
            tint: tint(&reduced),
        }
    }
}

pub fn pixel_variance(gray: &GrayImage) -> f64 {
    let count = f64::from(gray.width()) * f64::from(gray.height());
    if count == 0.0 {
        return 0.0;
    }
    let (sum, sum_sq) = gray.pixels().fold((0.0_f64, 0.0_f64), |(sum, sum_sq), px| {
        let v = f64::from(px.0[0]);
        (sum + v, sum_sq + v * v)
    });
    let mean = sum / count;
    (sum_sq / count - mean * mean).max(0.0)
}

pub fn edge_density(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }
    let at = |x: u32, y: u32| i32::from(gray.get_pixel(x, y).0[0]);
    let mut edges: u64 = 0;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let gx = at(x + 1, y - 1) + 2 * at(x + 1, y) + at(x + 1, y + 1)
                - at(x - 1, y - 1)
                - 2 * at(x - 1, y)
                - at(x - 1, y + 1);
            let gy = at(x - 1, y + 1) + 2 * at(x, y + 1) + at(x + 1, y + 1)
                - at(x - 1, y - 1)
                - 2 * at(x, y - 1)
                - at(x + 1, y - 1);
            if gx.abs() + gy.abs() > EDGE_MAGNITUDE {
                edges += 1;
            }
        }
    }
    let interior = f64::from(width - 2) * f64::from(height - 2);
    edges as f64 / interior
}

fn tint(image: &DynamicImage) -> f64 {
    if !image.color().has_color() {
        return 0.0;
    }
    let rgb = image.to_rgb8();
    let count = f64::from(rgb.width()) * f64::from(rgb.height());
    if count == 0.0 {
        return 0.0;
    }
    let total: f64 = rgb
        .pixels()
        .map(|px| {
            let [r, g, b] = px.0;
            ((f64::from(r) + f64::from(g)) / 2.0 - f64::from(b)).max(0.0)
        })
        .sum();
    (total / count / 255.0).clamp(0.0, 1.0)
}

/// Assumes the raster is a full A4 page when the aspect ratio looks like one.
fn estimate_dpi(width: u32, height: u32) -> Option<u32> {
    let short = f64::from(width.min(height));
    let long = f64::from(width.max(height));
    if short == 0.0 {
        return None;
    }
    let ratio = long / short;
    if !(1.3..=1.5).contains(&ratio) {
        return None;
    }
    // Bounded by u32::MAX / 8.27, so the cast cannot truncate.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let dpi = (short / A4_SHORT_SIDE_INCHES).round() as u32;
    Some(dpi)
}
