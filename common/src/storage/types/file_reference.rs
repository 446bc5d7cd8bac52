use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// A file as seen by a scanner or watcher at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    pub path: PathBuf,
    pub directory_id: String,
    pub modified_at: Option<DateTime<Utc>>,
    pub size: u64,
}

impl FileReference {
    pub fn new(path: impl Into<PathBuf>, directory_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            directory_id: directory_id.into(),
            modified_at: None,
            size: 0,
        }
    }

    /// Builds a reference from the file's current filesystem metadata.
    pub async fn from_path(
        path: impl AsRef<Path>,
        directory_id: impl Into<String>,
    ) -> Result<Self, AppError> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        let modified_at = metadata.modified().ok().map(DateTime::<Utc>::from);

        Ok(Self {
            path: path.to_path_buf(),
            directory_id: directory_id.into(),
            modified_at,
            size: metadata.len(),
        })
    }

    /// Stable string key used by the index to look up a path.
    pub fn path_key(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "file", rename_all = "lowercase")]
pub enum FileEvent {
    Created(FileReference),
    Modified(FileReference),
    Deleted(FileReference),
}

impl FileEvent {
    pub fn reference(&self) -> &FileReference {
        match self {
            FileEvent::Created(reference)
            | FileEvent::Modified(reference)
            | FileEvent::Deleted(reference) => reference,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FileEvent::Created(_) => "created",
            FileEvent::Modified(_) => "modified",
            FileEvent::Deleted(_) => "deleted",
        }
    }
}
