use bytes::Bytes;
use common::{error::AppError, storage::types::document::FileKind};

use super::{office, pdf_ingestion::extract_pages};

/// Text pulled from the file's own structure, split by page where the format has pages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeText {
    pub pages: Vec<String>,
}

impl NativeText {
    pub fn single(text: String) -> Self {
        Self { pages: vec![text] }
    }

    pub fn text(&self) -> String {
        self.pages
            .iter()
            .map(|page| page.trim())
            .filter(|page| !page.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Characters of meaningful text, ignoring surrounding whitespace.
    pub fn char_count(&self) -> usize {
        self.pages.iter().map(|page| page.trim().chars().count()).sum()
    }
}

/// Extracts native text for `kind`. Images and unknown formats carry none.
pub async fn extract_native(kind: FileKind, bytes: Bytes) -> Result<NativeText, AppError> {
    match kind {
        FileKind::Pdf => Ok(NativeText {
            pages: extract_pages(bytes).await?,
        }),
        FileKind::Office => {
            let text = tokio::task::spawn_blocking(move || office::extract_text(&bytes)).await??;
            Ok(NativeText::single(text))
        }
        FileKind::Text => {
            let text = String::from_utf8_lossy(&bytes);
            Ok(NativeText::single(
                text.trim_start_matches('\u{feff}').to_string(),
            ))
        }
        FileKind::Image | FileKind::Generic => Ok(NativeText::default()),
    }
}
