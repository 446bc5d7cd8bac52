use std::future::Future;

use common::storage::types::document::OcrEngineKind;
use tracing::{debug, info};

use super::{Confidence, EngineChoice, EngineProfile, OcrResult};

/// Primary engine for a job plus the engine tried when it scores too low.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePlan {
    pub primary: EngineChoice,
    pub fallback: Option<EngineChoice>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutedResult {
    pub result: OcrResult,
    /// Engines in the order they ran; never lists an engine twice.
    pub attempts: Vec<OcrEngineKind>,
}

#[derive(Debug, Clone, Copy)]
pub struct OcrEngineRouter {
    min_acceptable: Confidence,
}

impl OcrEngineRouter {
    pub fn new(min_acceptable: Confidence) -> Self {
        Self { min_acceptable }
    }

    pub fn plan(
        &self,
        handwriting: bool,
        neural_available: bool,
        forced: Option<OcrEngineKind>,
    ) -> RoutePlan {
        if let Some(kind) = forced {
            let primary = match kind {
                OcrEngineKind::Neural => EngineChoice::neural(),
                OcrEngineKind::Classic if handwriting => {
                    EngineChoice::classic(EngineProfile::HistoricScript)
                }
                OcrEngineKind::Classic => EngineChoice::classic(EngineProfile::Default),
            };
            return RoutePlan {
                primary,
                fallback: None,
            };
        }

        match (handwriting, neural_available) {
            (true, true) => RoutePlan {
                primary: EngineChoice::neural(),
                fallback: Some(EngineChoice::classic(EngineProfile::HistoricScript)),
            },
            (true, false) => RoutePlan {
                primary: EngineChoice::classic(EngineProfile::HistoricScript),
                fallback: None,
            },
            (false, neural) => RoutePlan {
                primary: EngineChoice::classic(EngineProfile::Default),
                fallback: neural.then(EngineChoice::neural),
            },
        }
    }

    /// Runs the primary and, when it falls short, the fallback exactly once.
    ///
    /// The higher-confidence attempt wins; on a tie the fallback wins.
    pub async fn run<F, Fut>(&self, plan: RoutePlan, mut execute: F) -> RoutedResult
    where
        F: FnMut(EngineChoice) -> Fut,
        Fut: Future<Output = OcrResult>,
    {
        let primary = execute(plan.primary).await;
        let mut attempts = vec![plan.primary.kind];

        let Some(fallback) = plan
            .fallback
            .filter(|_| primary.confidence < self.min_acceptable)
        else {
            return RoutedResult {
                result: primary,
                attempts,
            };
        };
        if fallback.kind == plan.primary.kind {
            return RoutedResult {
                result: primary,
                attempts,
            };
        }

        debug!(
            primary = %plan.primary.kind,
            fallback = %fallback.kind,
            confidence = primary.confidence.value(),
            "primary OCR below acceptable confidence, trying fallback"
        );
        let secondary = execute(fallback).await;
        attempts.push(fallback.kind);

        let (kept, discarded) = if secondary.confidence >= primary.confidence {
            (secondary, primary)
        } else {
            (primary, secondary)
        };
        info!(
            kept_engine = %kept.engine_used,
            kept_confidence = kept.confidence.value(),
            discarded_engine = %discarded.engine_used,
            discarded_confidence = discarded.confidence.value(),
            discarded_chars = discarded.text.chars().count(),
            "discarded lower-confidence OCR attempt"
        );

        RoutedResult {
            result: kept,
            attempts,
        }
    }
}
