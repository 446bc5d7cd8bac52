use thiserror::Error;
use tokio::task::JoinError;

use crate::storage::types::ontology::OntologyError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Extraction error: {0}")]
    Extraction(String),
    #[error("OCR timed out after {0} ms")]
    OcrTimeout(u64),
    #[error("OCR engine unavailable: {0}")]
    OcrEngineUnavailable(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Ontology error: {0}")]
    Ontology(#[from] OntologyError),
    #[error("Index sink error: {0}")]
    Sink(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Ingestion Processing error: {0}")]
    Processing(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Errors that must stop a whole run instead of failing a single file.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Sink(_) | AppError::Database(_))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_sink_side_errors_are_fatal() {
        assert!(AppError::Sink("connection refused".into()).is_fatal());
        assert!(!AppError::Io(std::io::Error::other("denied")).is_fatal());
        assert!(!AppError::Extraction("corrupt xref".into()).is_fatal());
        assert!(!AppError::OcrTimeout(500).is_fatal());
        assert!(!AppError::Config("bad ontology".into()).is_fatal());
    }
}
