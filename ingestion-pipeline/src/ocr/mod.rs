//! Adaptive OCR: image signals, handwriting detection, preprocessing, engine routing, batching.

pub mod batch;
pub mod classic;
pub mod detector;
pub mod neural;
pub mod preprocess;
pub mod router;
pub mod signals;
pub mod stats;

use std::{fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use common::{error::AppError, storage::types::document::OcrEngineKind};
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use self::stats::OcrStatistics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessingMode {
    Standard,
    Historical,
    Handwriting,
    LowQuality,
}

impl PreprocessingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PreprocessingMode::Standard => "standard",
            PreprocessingMode::Historical => "historical",
            PreprocessingMode::Handwriting => "handwriting",
            PreprocessingMode::LowQuality => "low_quality",
        }
    }
}

impl fmt::Display for PreprocessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recognition certainty, always within `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Confidence(f64);

impl Confidence {
    pub const ZERO: Confidence = Confidence(0.0);

    pub fn new(value: f64) -> Self {
        if value.is_nan() {
            return Self::ZERO;
        }
        Self(value.clamp(0.0, 1.0))
    }

    /// Engines that always report `0..=100`.
    pub fn from_percent(value: f64) -> Self {
        Self::new(value / 100.0)
    }

    /// Accepts either a `[0, 1]` ratio or a `0..=100` percentage.
    pub fn from_engine_scale(value: f64) -> Self {
        if value > 1.0 {
            Self::new(value / 100.0)
        } else {
            Self::new(value)
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

/// Engine-specific recognition settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineProfile {
    /// Automatic page segmentation, modern print.
    Default,
    /// Fraktur/Kurrent model with raw-line segmentation.
    HistoricScript,
    SingleColumn,
    Sparse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineChoice {
    pub kind: OcrEngineKind,
    pub profile: EngineProfile,
}

impl EngineChoice {
    pub fn classic(profile: EngineProfile) -> Self {
        Self {
            kind: OcrEngineKind::Classic,
            profile,
        }
    }

    pub fn neural() -> Self {
        Self {
            kind: OcrEngineKind::Neural,
            profile: EngineProfile::Default,
        }
    }
}

/// One page image queued for recognition.
#[derive(Debug, Clone)]
pub struct OcrJob {
    pub page: usize,
    pub image: Arc<DynamicImage>,
    pub mode: PreprocessingMode,
    pub engine: EngineChoice,
    pub language_hints: Vec<String>,
    pub estimated_dpi: Option<u32>,
    pub handwriting: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OcrResult {
    pub text: String,
    pub confidence: Confidence,
    pub engine_used: OcrEngineKind,
    pub handwriting_detected: bool,
    pub error: Option<String>,
}

impl OcrResult {
    /// Zero-confidence, empty-text outcome for an attempt that produced nothing usable.
    pub fn failed(engine: OcrEngineKind, handwriting_detected: bool, error: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            confidence: Confidence::ZERO,
            engine_used: engine,
            handwriting_detected,
            error: Some(error.into()),
        }
    }
}

/// Raw output of an engine with confidence already normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub text: String,
    pub confidence: Confidence,
}

#[async_trait]
pub trait OcrExecutor: Send + Sync {
    fn kind(&self) -> OcrEngineKind;

    async fn is_available(&self) -> bool;

    /// Forgets a cached health check so the next `is_available` asks the engine again.
    async fn reset_availability(&self) {}

    async fn execute(
        &self,
        image: &GrayImage,
        profile: EngineProfile,
        language_hints: &[String],
    ) -> Result<Recognition, AppError>;
}

/// Health check result, kept until the next run starts.
#[derive(Debug, Default)]
pub struct AvailabilityCache {
    checked: Mutex<Option<bool>>,
}

impl AvailabilityCache {
    pub async fn get_or_check<F, Fut>(&self, check: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut checked = self.checked.lock().await;
        if let Some(available) = *checked {
            return available;
        }
        let available = check().await;
        *checked = Some(available);
        available
    }

    pub async fn reset(&self) {
        *self.checked.lock().await = None;
    }
}

/// Preprocesses `job` for its mode and runs it on `executor` within `timeout`.
///
/// Never fails: crashes, timeouts and unavailable engines become zero-confidence results.
/// Unavailability is logged once per run through `stats`.
pub async fn recognize(
    executor: &dyn OcrExecutor,
    job: &OcrJob,
    timeout: Duration,
    stats: &OcrStatistics,
) -> OcrResult {
    let kind = executor.kind();
    let image = Arc::clone(&job.image);
    let mode = job.mode;
    let dpi = job.estimated_dpi;
    let prepared =
        match tokio::task::spawn_blocking(move || preprocess::enhance(&image, mode, dpi)).await {
            Ok(prepared) => prepared,
            Err(err) => return OcrResult::failed(kind, job.handwriting, err.to_string()),
        };

    let attempt = tokio::time::timeout(
        timeout,
        executor.execute(&prepared, job.engine.profile, &job.language_hints),
    )
    .await
    .unwrap_or_else(|_| {
        Err(AppError::OcrTimeout(
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        ))
    });

    match attempt {
        Ok(recognition) => OcrResult {
            text: recognition.text,
            confidence: recognition.confidence,
            engine_used: kind,
            handwriting_detected: job.handwriting,
            error: None,
        },
        Err(err) => {
            if matches!(err, AppError::OcrEngineUnavailable(_)) {
                if stats.note_unavailable(kind).await {
                    warn!(engine = %kind, error = %err, "OCR engine unavailable for this run");
                }
            } else {
                debug!(engine = %kind, page = job.page, error = %err, "OCR attempt failed");
            }
            OcrResult::failed(kind, job.handwriting, err.to_string())
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    pub enum Behaviour {
        Text(&'static str, f64),
        Unavailable,
        Hang,
        Panic,
    }

    /// Scripted engine recording how many times it ran.
    pub struct ScriptedExecutor {
        pub kind: OcrEngineKind,
        pub behaviour: Behaviour,
        pub calls: AtomicUsize,
        pub pages: Mutex<Vec<usize>>,
    }

    impl ScriptedExecutor {
        pub fn new(kind: OcrEngineKind, behaviour: Behaviour) -> Self {
            Self {
                kind,
                behaviour,
                calls: AtomicUsize::new(0),
                pages: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OcrExecutor for ScriptedExecutor {
        fn kind(&self) -> OcrEngineKind {
            self.kind
        }

        async fn is_available(&self) -> bool {
            !matches!(self.behaviour, Behaviour::Unavailable)
        }

        async fn execute(
            &self,
            image: &GrayImage,
            _profile: EngineProfile,
            _language_hints: &[String],
        ) -> Result<Recognition, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Test images encode their page index as the width.
            self.pages.lock().await.push(image.width() as usize);
            match self.behaviour {
                Behaviour::Text(text, confidence) => Ok(Recognition {
                    text: text.to_string(),
                    confidence: Confidence::new(confidence),
                }),
                Behaviour::Unavailable => Err(AppError::OcrEngineUnavailable("offline".into())),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(AppError::InternalError("unreachable".into()))
                }
                Behaviour::Panic => panic!("engine crashed"),
            }
        }
    }

    pub fn job(page: usize, engine: EngineChoice) -> OcrJob {
        OcrJob {
            page,
            image: Arc::new(DynamicImage::new_luma8(
                u32::try_from(page).unwrap_or(1).max(1),
                4,
            )),
            mode: PreprocessingMode::Standard,
            engine,
            language_hints: vec!["deu".into(), "eng".into()],
            estimated_dpi: Some(300),
            handwriting: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{job, Behaviour, ScriptedExecutor};
    use super::*;

    #[test]
    fn confidence_is_clamped_and_nan_safe() {
        assert!((Confidence::new(1.7).value() - 1.0).abs() < f64::EPSILON);
        assert!(Confidence::new(-0.2).value().abs() < f64::EPSILON);
        assert!(Confidence::new(f64::NAN).value().abs() < f64::EPSILON);
        assert!((Confidence::from_engine_scale(87.0).value() - 0.87).abs() < 1e-9);
        assert!((Confidence::from_engine_scale(0.42).value() - 0.42).abs() < 1e-9);
    }

    #[tokio::test]
    async fn timeout_becomes_zero_confidence_result() {
        let executor = ScriptedExecutor::new(OcrEngineKind::Classic, Behaviour::Hang);
        let stats = OcrStatistics::default();
        let result = recognize(
            &executor,
            &job(1, EngineChoice::classic(EngineProfile::Default)),
            Duration::from_millis(20),
            &stats,
        )
        .await;

        assert_eq!(result.confidence, Confidence::ZERO);
        assert!(result.text.is_empty());
        assert!(result
            .error
            .as_deref()
            .is_some_and(|e| e.contains("timed out")));
    }

    #[tokio::test]
    async fn unavailability_is_reported_once_per_run() {
        let executor = ScriptedExecutor::new(OcrEngineKind::Neural, Behaviour::Unavailable);
        let stats = OcrStatistics::default();
        for page in 1..=3 {
            let result = recognize(
                &executor,
                &job(page, EngineChoice::neural()),
                Duration::from_secs(1),
                &stats,
            )
            .await;
            assert_eq!(result.confidence, Confidence::ZERO);
        }
        assert_eq!(
            stats.snapshot().await.unavailable_engines,
            vec![OcrEngineKind::Neural]
        );
        assert!(!stats.note_unavailable(OcrEngineKind::Neural).await);
    }
}
