//! Preprocessing-mode selection and the image enhancement each mode implies.

use image::{
    imageops::{self, FilterType},
    DynamicImage, GenericImageView, GrayImage, Luma,
};

use super::{signals::ImageSignals, PreprocessingMode};

/// Resolution low-quality scans are upscaled towards.
const TARGET_DPI: u32 = 300;
const MAX_UPSCALE: f64 = 3.0;
const SHARPEN_KERNEL: [f32; 9] = [0.0, -1.0, 0.0, -1.0, 5.0, -1.0, 0.0, -1.0, 0.0];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectorThresholds {
    /// Variance below this reads as faded, low-contrast paper.
    pub historical_variance_max: f64,
    pub aged_tint_min: f64,
    pub low_quality_dpi_max: u32,
}

impl Default for SelectorThresholds {
    fn default() -> Self {
        Self {
            historical_variance_max: 1_000.0,
            aged_tint_min: 0.12,
            low_quality_dpi_max: 150,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PreprocessSelector {
    thresholds: SelectorThresholds,
}

impl PreprocessSelector {
    pub fn new(thresholds: SelectorThresholds) -> Self {
        Self { thresholds }
    }

    /// Forced mode, then handwriting, then aged paper, then low resolution, else standard.
    pub fn select(
        &self,
        signals: &ImageSignals,
        handwriting: bool,
        forced: Option<PreprocessingMode>,
    ) -> PreprocessingMode {
        if let Some(mode) = forced {
            return mode;
        }
        if handwriting {
            return PreprocessingMode::Handwriting;
        }
        if signals.pixel_variance < self.thresholds.historical_variance_max
            || signals.tint >= self.thresholds.aged_tint_min
        {
            return PreprocessingMode::Historical;
        }
        if signals
            .estimated_dpi
            .is_some_and(|dpi| dpi < self.thresholds.low_quality_dpi_max)
        {
            return PreprocessingMode::LowQuality;
        }
        PreprocessingMode::Standard
    }
}

/// Produces the binarized grey image an engine should see for `mode`.
pub fn enhance(image: &DynamicImage, mode: PreprocessingMode, dpi: Option<u32>) -> GrayImage {
    match mode {
        PreprocessingMode::Standard => {
            let gray = imageops::blur(&image.to_luma8(), 0.6);
            adaptive_threshold(&gray, 11, 2)
        }
        PreprocessingMode::Historical => {
            let gray = stretch_contrast(&image.to_luma8());
            let gray = imageops::blur(&gray, 1.0);
            adaptive_threshold(&gray, 15, 5)
        }
        PreprocessingMode::Handwriting => {
            let gray = imageops::blur(&image.to_luma8(), 1.4);
            let gray = stretch_contrast(&gray);
            otsu_threshold(&gray)
        }
        PreprocessingMode::LowQuality => {
            let gray = upscale(image, dpi).to_luma8();
            let gray = imageops::filter3x3(&gray, &SHARPEN_KERNEL);
            let gray = stretch_contrast(&gray);
            adaptive_threshold(&gray, 11, 2)
        }
    }
}

fn upscale(image: &DynamicImage, dpi: Option<u32>) -> DynamicImage {
    let Some(dpi) = dpi.filter(|dpi| *dpi > 0 && *dpi < TARGET_DPI) else {
        return image.clone();
    };
    let factor = (f64::from(TARGET_DPI) / f64::from(dpi)).min(MAX_UPSCALE);
    let (width, height) = image.dimensions();
    // factor <= MAX_UPSCALE keeps the result far inside u32.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let scaled = |side: u32| (f64::from(side) * factor).round() as u32;
    image.resize_exact(scaled(width), scaled(height), FilterType::CatmullRom)
}

/// Linear stretch between the 1st and 99th percentile of grey levels.
fn stretch_contrast(gray: &GrayImage) -> GrayImage {
    let histogram = histogram(gray);
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return gray.clone();
    }
    let cutoff = total / 100;
    let low = percentile_level(&histogram, cutoff);
    let high = percentile_level(&histogram, total.saturating_sub(cutoff));
    if high <= low {
        return gray.clone();
    }
    let span = f64::from(high - low);
    let mut out = gray.clone();
    for px in out.pixels_mut() {
        let v = f64::from(px.0[0].clamp(low, high) - low);
        // v / span is within [0, 1].
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let stretched = (v / span * 255.0).round() as u8;
        *px = Luma([stretched]);
    }
    out
}

fn histogram(gray: &GrayImage) -> [u64; 256] {
    let mut counts = [0_u64; 256];
    for px in gray.pixels() {
        if let Some(slot) = counts.get_mut(usize::from(px.0[0])) {
            *slot += 1;
        }
    }
    counts
}

fn percentile_level(histogram: &[u64; 256], rank: u64) -> u8 {
    let mut seen = 0_u64;
    for (level, count) in (0_u8..=255).zip(histogram.iter()) {
        seen += count;
        if seen > rank {
            return level;
        }
    }
    255
}

/// Local mean thresholding: a pixel is ink when darker than its neighbourhood mean minus `c`.
fn adaptive_threshold(gray: &GrayImage, block: u32, c: i64) -> GrayImage {
    let (width, height) = gray.dimensions();
    let stride = width as usize + 1;
    let mut integral = vec![0_i64; stride * (height as usize + 1)];
    for y in 0..height {
        let mut row_sum = 0_i64;
        for x in 0..width {
            row_sum += i64::from(gray.get_pixel(x, y).0[0]);
            let above = integral
                .get(y as usize * stride + x as usize + 1)
                .copied()
                .unwrap_or(0);
            if let Some(cell) = integral.get_mut((y as usize + 1) * stride + x as usize + 1) {
                *cell = above + row_sum;
            }
        }
    }
    let sum_at = |x: u32, y: u32| {
        integral
            .get(y as usize * stride + x as usize)
            .copied()
            .unwrap_or(0)
    };

    let radius = block / 2;
    GrayImage::from_fn(width, height, |x, y| {
        let x0 = x.saturating_sub(radius);
        let y0 = y.saturating_sub(radius);
        let x1 = (x + radius + 1).min(width);
        let y1 = (y + radius + 1).min(height);
        let area = i64::from((x1 - x0) * (y1 - y0));
        let sum = sum_at(x1, y1) - sum_at(x0, y1) - sum_at(x1, y0) + sum_at(x0, y0);
        let value = i64::from(gray.get_pixel(x, y).0[0]);
        if value * area > sum - c * area {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Global threshold maximizing between-class variance.
fn otsu_threshold(gray: &GrayImage) -> GrayImage {
    let histogram = histogram(gray);
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return gray.clone();
    }
    let weighted_total: f64 = (0_u32..)
        .zip(histogram.iter())
        .map(|(level, count)| f64::from(level) * *count as f64)
        .sum();

    let mut background_weight = 0.0_f64;
    let mut background_sum = 0.0_f64;
    let mut best = (0.0_f64, 0_u8);
    for (level, count) in (0_u8..=255).zip(histogram.iter()) {
        background_weight += *count as f64;
        if background_weight == 0.0 {
            continue;
        }
        let foreground_weight = total as f64 - background_weight;
        if foreground_weight == 0.0 {
            break;
        }
        background_sum += f64::from(level) * *count as f64;
        let mean_background = background_sum / background_weight;
        let mean_foreground = (weighted_total - background_sum) / foreground_weight;
        let between = background_weight
            * foreground_weight
            * (mean_background - mean_foreground).powi(2);
        if between > best.0 {
            best = (between, level);
        }
    }

    let threshold = best.1;
    let mut out = gray.clone();
    for px in out.pixels_mut() {
        *px = if px.0[0] > threshold {
            Luma([255])
        } else {
            Luma([0])
        };
    }
    out
}
