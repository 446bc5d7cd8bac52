use super::signals::ImageSignals;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorThresholds {
    pub edge_density_min: f64,
    pub variance_min: f64,
}

impl Default for DetectorThresholds {
    fn default() -> Self {
        Self {
            edge_density_min: 0.15,
            variance_min: 2_000.0,
        }
    }
}

/// Flags handwritten or historic script from edge density and grey-level variance.
///
/// Both signals must exceed their threshold; a single strong signal is not enough.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandwritingDetector {
    thresholds: DetectorThresholds,
}

impl HandwritingDetector {
    pub fn new(thresholds: DetectorThresholds) -> Self {
        Self { thresholds }
    }

    pub fn is_handwriting(&self, signals: &ImageSignals) -> bool {
        signals.edge_density > self.thresholds.edge_density_min
            && signals.pixel_variance > self.thresholds.variance_min
    }
}
