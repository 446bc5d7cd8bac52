use std::{
    collections::{BTreeMap, BTreeSet},
    sync::atomic::{AtomicU64, Ordering},
};

use common::storage::types::document::OcrEngineKind;
use serde::Serialize;
use tokio::sync::Mutex;

use super::PreprocessingMode;

/// Process-wide OCR and ingestion counters.
///
/// Reset at the start of every directory run; read through [`OcrStatistics::snapshot`].
#[derive(Debug, Default)]
pub struct OcrStatistics {
    processed: AtomicU64,
    ocr_applied: AtomicU64,
    handwriting_detected: AtomicU64,
    failures: AtomicU64,
    histograms: Mutex<Histograms>,
}

#[derive(Debug, Default)]
struct Histograms {
    engine_used: BTreeMap<OcrEngineKind, u64>,
    preprocessing: BTreeMap<PreprocessingMode, u64>,
    unavailable: BTreeSet<OcrEngineKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub processed: u64,
    pub ocr_applied: u64,
    pub engine_used: BTreeMap<OcrEngineKind, u64>,
    pub handwriting_detected: u64,
    pub failures: u64,
    pub preprocessing: BTreeMap<PreprocessingMode, u64>,
    pub unavailable_engines: Vec<OcrEngineKind>,
}

impl StatisticsSnapshot {
    /// Folds a later run's snapshot into this one, e.g. to total several directory runs.
    pub fn merge(&mut self, other: &StatisticsSnapshot) {
        self.processed = self.processed.saturating_add(other.processed);
        self.ocr_applied = self.ocr_applied.saturating_add(other.ocr_applied);
        self.handwriting_detected = self
            .handwriting_detected
            .saturating_add(other.handwriting_detected);
        self.failures = self.failures.saturating_add(other.failures);
        for (engine, count) in &other.engine_used {
            let total = self.engine_used.entry(*engine).or_default();
            *total = total.saturating_add(*count);
        }
        for (mode, count) in &other.preprocessing {
            let total = self.preprocessing.entry(*mode).or_default();
            *total = total.saturating_add(*count);
        }
        for engine in &other.unavailable_engines {
            if !self.unavailable_engines.contains(engine) {
                self.unavailable_engines.push(*engine);
            }
        }
        self.unavailable_engines.sort();
    }
}

impl OcrStatistics {
    pub async fn reset(&self) {
        let mut histograms = self.histograms.lock().await;
        self.processed.store(0, Ordering::SeqCst);
        self.ocr_applied.store(0, Ordering::SeqCst);
        self.handwriting_detected.store(0, Ordering::SeqCst);
        self.failures.store(0, Ordering::SeqCst);
        *histograms = Histograms::default();
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one OCR'd document and the engines and modes its pages went through.
    pub async fn record_ocr(
        &self,
        engines: &[OcrEngineKind],
        modes: &[PreprocessingMode],
        handwriting: bool,
    ) {
        self.ocr_applied.fetch_add(1, Ordering::Relaxed);
        if handwriting {
            self.handwriting_detected.fetch_add(1, Ordering::Relaxed);
        }
        let mut histograms = self.histograms.lock().await;
        for engine in engines {
            let count = histograms.engine_used.entry(*engine).or_default();
            *count = count.saturating_add(1);
        }
        for mode in modes {
            let count = histograms.preprocessing.entry(*mode).or_default();
            *count = count.saturating_add(1);
        }
    }

    /// Marks `engine` unavailable. Returns `true` only the first time in a run.
    pub async fn note_unavailable(&self, engine: OcrEngineKind) -> bool {
        self.histograms.lock().await.unavailable.insert(engine)
    }

    pub async fn snapshot(&self) -> StatisticsSnapshot {
        let histograms = self.histograms.lock().await;
        StatisticsSnapshot {
            processed: self.processed.load(Ordering::SeqCst),
            ocr_applied: self.ocr_applied.load(Ordering::SeqCst),
            engine_used: histograms.engine_used.clone(),
            handwriting_detected: self.handwriting_detected.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
            preprocessing: histograms.preprocessing.clone(),
            unavailable_engines: histograms.unavailable.iter().copied().collect(),
        }
    }
}
