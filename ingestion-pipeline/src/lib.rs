#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod assembler;
pub mod concepts;
pub mod metadata;
pub mod ocr;
pub mod pipeline;
pub mod utils;

pub use pipeline::{
    DefaultPipelineServices, EventOutcome, IngestOutcome, IngestionConfig, IngestionPipeline,
    IngestionTuning, PipelineServices, RunSummary,
};
