use std::io::Cursor;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{error::AppError, storage::types::document::OcrEngineKind};
use image::{GrayImage, ImageFormat};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AvailabilityCache, Confidence, EngineProfile, OcrExecutor, Recognition};

#[derive(Debug, Serialize)]
struct RecognizeRequest<'a> {
    image: String,
    languages: &'a [String],
    profile: EngineProfile,
}

#[derive(Debug, Deserialize)]
struct RecognizedLine {
    text: String,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    lines: Vec<RecognizedLine>,
}

impl RecognizeResponse {
    fn into_recognition(self) -> Recognition {
        let line_confidence = {
            let scores: Vec<f64> = self.lines.iter().filter_map(|l| l.confidence).collect();
            (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64)
        };
        let text = match self.text {
            Some(text) => text,
            None => self
                .lines
                .into_iter()
                .map(|line| line.text)
                .collect::<Vec<_>>()
                .join("\n"),
        };
        let confidence = self
            .confidence
            .or(line_confidence)
            .map_or(Confidence::ZERO, Confidence::from_engine_scale);
        Recognition { text, confidence }
    }
}

/// Client for an HTTP handwriting recognition service.
///
/// `POST {endpoint}/recognize` with a base64 PNG; `GET {endpoint}/health` for availability.
pub struct NeuralExecutor {
    client: Client,
    endpoint: String,
    available: AvailabilityCache,
}

impl NeuralExecutor {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            available: AvailabilityCache::default(),
        }
    }

    fn map_transport(&self, err: reqwest::Error) -> AppError {
        if err.is_connect() {
            AppError::OcrEngineUnavailable(format!("{}: {err}", self.endpoint))
        } else {
            AppError::Reqwest(err)
        }
    }
}

#[async_trait]
impl OcrExecutor for NeuralExecutor {
    fn kind(&self) -> OcrEngineKind {
        OcrEngineKind::Neural
    }

    async fn is_available(&self) -> bool {
        self.available
            .get_or_check(|| async {
                self.client
                    .get(format!("{}/health", self.endpoint))
                    .send()
                    .await
                    .is_ok_and(|response| response.status().is_success())
            })
            .await
    }

    async fn reset_availability(&self) {
        self.available.reset().await;
    }

    async fn execute(
        &self,
        image: &GrayImage,
        profile: EngineProfile,
        language_hints: &[String],
    ) -> Result<Recognition, AppError> {
        let owned = image.clone();
        let png = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, AppError> {
            let mut buffer = Vec::new();
            owned
                .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
                .map_err(|err| AppError::Processing(format!("failed to encode OCR image: {err}")))?;
            Ok(buffer)
        })
        .await??;

        let request = RecognizeRequest {
            image: STANDARD.encode(png),
            languages: language_hints,
            profile,
        };
        let response = self
            .client
            .post(format!("{}/recognize", self.endpoint))
            .json(&request)
            .send()
            .await
            .map_err(|err| self.map_transport(err))?;

        let status = response.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(AppError::OcrEngineUnavailable(format!(
                "{} answered {status}",
                self.endpoint
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Processing(format!(
                "recognition service returned {status}: {body}"
            )));
        }

        let recognition = response.json::<RecognizeResponse>().await?.into_recognition();
        debug!(
            endpoint = %self.endpoint,
            chars = recognition.text.chars().count(),
            confidence = recognition.confidence.value(),
            "neural recognition finished"
        );
        Ok(recognition)
    }
}
