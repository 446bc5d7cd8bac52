use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    error::AppError,
    storage::types::{
        document::{FileKind, Metadata},
        file_reference::FileReference,
    },
    utils::config::OcrSettings,
};
use tracing::{info, warn};

use super::config::IngestionTuning;
use crate::{
    metadata::{MetadataExtractor, MetadataInput},
    ocr::{
        batch::BatchScheduler, classic::TesseractExecutor, neural::NeuralExecutor,
        stats::OcrStatistics, OcrExecutor, OcrJob, OcrResult,
    },
    utils::{
        file_text_extraction::{extract_native, NativeText},
        image_parsing,
        pdf_ingestion::{self, RasterPage},
    },
};

/// Side effects the pipeline stages depend on; swapped for mocks in tests.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    async fn read_bytes(&self, reference: &FileReference) -> Result<Bytes, AppError>;

    async fn extract_native(&self, kind: FileKind, bytes: Bytes) -> Result<NativeText, AppError>;

    /// Page images in page order, numbered from 1.
    async fn rasterize(&self, kind: FileKind, bytes: Bytes) -> Result<Vec<RasterPage>, AppError>;

    async fn extract_metadata(&self, input: &MetadataInput<'_>) -> Metadata;

    async fn neural_available(&self) -> bool;

    async fn recognize(&self, job: OcrJob) -> OcrResult;

    /// Called when a directory run starts; engine health is checked afresh afterwards.
    async fn begin_run(&self) {}

    /// Drains queued OCR work; called once a run is over.
    async fn shutdown(&self) {}
}

pub struct DefaultPipelineServices {
    ocr: OcrSettings,
    rasterize_dpi: u32,
    neural: Option<Arc<NeuralExecutor>>,
    executors: Vec<Arc<dyn OcrExecutor>>,
    scheduler: BatchScheduler,
    metadata: MetadataExtractor,
}

impl DefaultPipelineServices {
    /// Starts the OCR lanes; must be called inside a tokio runtime.
    pub fn new(ocr: &OcrSettings, tuning: &IngestionTuning, stats: Arc<OcrStatistics>) -> Self {
        let classic: Arc<dyn OcrExecutor> =
            Arc::new(TesseractExecutor::new(PathBuf::from(&ocr.tesseract_path)));
        let mut executors = vec![classic];

        let neural = match (ocr.neural_enabled, ocr.neural_endpoint.as_deref()) {
            (true, Some(endpoint)) => {
                let executor = Arc::new(NeuralExecutor::new(reqwest::Client::new(), endpoint));
                executors.push(Arc::clone(&executor) as Arc<dyn OcrExecutor>);
                Some(executor)
            }
            (true, None) => {
                warn!("neural OCR enabled without an endpoint; only the classic engine will run");
                None
            }
            (false, _) => None,
        };
        info!(
            tesseract = %ocr.tesseract_path,
            neural = neural.is_some(),
            "OCR engines configured"
        );

        Self {
            ocr: ocr.clone(),
            rasterize_dpi: tuning.rasterize_dpi,
            neural,
            scheduler: BatchScheduler::start(executors.clone(), &tuning.batch, stats),
            executors,
            metadata: MetadataExtractor,
        }
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    async fn read_bytes(&self, reference: &FileReference) -> Result<Bytes, AppError> {
        Ok(Bytes::from(tokio::fs::read(&reference.path).await?))
    }

    async fn extract_native(&self, kind: FileKind, bytes: Bytes) -> Result<NativeText, AppError> {
        extract_native(kind, bytes).await
    }

    async fn rasterize(&self, kind: FileKind, bytes: Bytes) -> Result<Vec<RasterPage>, AppError> {
        match kind {
            FileKind::Pdf => {
                pdf_ingestion::rasterize(
                    PathBuf::from(&self.ocr.pdftoppm_path).as_path(),
                    &bytes,
                    self.rasterize_dpi,
                )
                .await
            }
            FileKind::Image => {
                let decoded =
                    tokio::task::spawn_blocking(move || image_parsing::decode(&bytes)).await??;
                Ok(vec![RasterPage {
                    page: 1,
                    image: decoded.image,
                    dpi: decoded.dpi,
                }])
            }
            other => Err(AppError::Extraction(format!(
                "{} files cannot be rasterized",
                other.as_str()
            ))),
        }
    }

    async fn extract_metadata(&self, input: &MetadataInput<'_>) -> Metadata {
        self.metadata.extract(input).await
    }

    async fn neural_available(&self) -> bool {
        match &self.neural {
            Some(executor) => executor.is_available().await,
            None => false,
        }
    }

    async fn recognize(&self, job: OcrJob) -> OcrResult {
        self.scheduler.submit(job).await
    }

    async fn begin_run(&self) {
        for executor in &self.executors {
            executor.reset_availability().await;
        }
    }

    async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}
