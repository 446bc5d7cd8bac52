use bytes::Bytes;
use common::{
    error::AppError,
    storage::{
        sink::IndexSink,
        types::{
            content_hash::ContentHash,
            document::{ConceptMatch, Document, FileKind, Metadata},
            file_reference::FileReference,
            ontology::OntologySnapshot,
        },
    },
};
use tracing::error;

use super::{config::IngestionConfig, services::PipelineServices};
use crate::{
    ocr::{stats::OcrStatistics, OcrResult},
    utils::file_text_extraction::NativeText,
};

pub struct PipelineContext<'a> {
    pub reference: &'a FileReference,
    pub path_key: String,
    pub pipeline_config: &'a IngestionConfig,
    pub services: &'a dyn PipelineServices,
    pub sink: &'a dyn IndexSink,
    pub ontologies: &'a OntologySnapshot,
    pub stats: &'a OcrStatistics,
    pub hash: Option<ContentHash>,
    pub mime_type: String,
    pub kind: FileKind,
    pub bytes: Bytes,
    pub native: NativeText,
    pub text: String,
    pub ocr_pages: Vec<OcrResult>,
    pub metadata: Metadata,
    pub concepts: Vec<ConceptMatch>,
    pub document: Option<Document>,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        reference: &'a FileReference,
        pipeline_config: &'a IngestionConfig,
        services: &'a dyn PipelineServices,
        sink: &'a dyn IndexSink,
        ontologies: &'a OntologySnapshot,
        stats: &'a OcrStatistics,
    ) -> Self {
        Self {
            reference,
            path_key: reference.path_key(),
            pipeline_config,
            services,
            sink,
            ontologies,
            stats,
            hash: None,
            mime_type: String::new(),
            kind: FileKind::Generic,
            bytes: Bytes::new(),
            native: NativeText::default(),
            text: String::new(),
            ocr_pages: Vec::new(),
            metadata: Metadata::new(),
            concepts: Vec::new(),
            document: None,
        }
    }

    pub fn hash(&self) -> Result<&ContentHash, AppError> {
        self.hash
            .as_ref()
            .ok_or_else(|| AppError::InternalError("content hash expected to be available".into()))
    }

    pub fn take_document(&mut self) -> Result<Document, AppError> {
        self.document.take().ok_or_else(|| {
            AppError::InternalError("document expected to be available for indexing".into())
        })
    }

    pub fn abort(&mut self, err: AppError) -> AppError {
        error!(
            path = %self.path_key,
            directory_id = %self.reference.directory_id,
            hash = self.hash.as_ref().map(ContentHash::short),
            error = %err,
            "ingestion pipeline aborted"
        );
        err
    }
}
