use std::time::Duration;

use common::{
    storage::types::document::OcrEngineKind,
    utils::config::{IngestionSettings, OcrSettings},
};

use crate::ocr::{
    batch::BatchConfig, detector::DetectorThresholds, preprocess::SelectorThresholds, Confidence,
    PreprocessingMode,
};

#[derive(Debug, Clone)]
pub struct IngestionTuning {
    pub worker_count: usize,
    /// Trimmed native characters below which a file is sent to OCR.
    pub min_native_text_chars: usize,
    pub detector: DetectorThresholds,
    pub selector: SelectorThresholds,
    pub min_acceptable_confidence: Confidence,
    pub batch: BatchConfig,
    pub match_inner_concepts: bool,
    pub rasterize_dpi: u32,
    pub language_hints: Vec<String>,
}

impl IngestionTuning {
    pub fn from_settings(ingestion: &IngestionSettings, ocr: &OcrSettings) -> Self {
        let batch_defaults = BatchConfig::default();
        Self {
            worker_count: ingestion.worker_count.max(1),
            min_native_text_chars: ingestion.min_native_text_chars,
            detector: DetectorThresholds {
                edge_density_min: ingestion.handwriting_edge_density_min,
                variance_min: ingestion.handwriting_variance_min,
            },
            selector: SelectorThresholds {
                historical_variance_max: ingestion.historical_variance_max,
                aged_tint_min: ingestion.aged_tint_min,
                low_quality_dpi_max: ingestion.low_quality_dpi_max,
            },
            min_acceptable_confidence: Confidence::new(ingestion.min_acceptable_confidence),
            batch: BatchConfig {
                neural_capacity: ingestion.neural_batch_capacity,
                classic_capacity: ingestion.classic_batch_capacity,
                classic_parallelism: ingestion
                    .classic_parallelism
                    .unwrap_or(batch_defaults.classic_parallelism),
                max_wait: Duration::from_millis(ingestion.batch_max_wait_ms),
                job_timeout: Duration::from_secs(ingestion.ocr_job_timeout_secs),
            },
            match_inner_concepts: ingestion.match_inner_concepts,
            rasterize_dpi: ocr.rasterize_dpi,
            language_hints: ocr.language_hints.clone(),
        }
    }
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self::from_settings(&IngestionSettings::default(), &OcrSettings::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestionConfig {
    pub tuning: IngestionTuning,
    /// Routes every OCR page to this engine, without fallback.
    pub forced_engine: Option<OcrEngineKind>,
    /// Overrides the preprocessing mode picked from image signals.
    pub forced_mode: Option<PreprocessingMode>,
}

impl IngestionConfig {
    pub fn from_tuning(tuning: IngestionTuning) -> Self {
        Self {
            tuning,
            ..Self::default()
        }
    }
}
