use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::content_hash::ContentHash;

/// Namespaced metadata fields (`pdf_*`, `image_*`, `office_*`, `filename_*`, `file_*`, `text_*`).
pub type Metadata = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Pdf,
    Image,
    Office,
    Text,
    Generic,
}

impl FileKind {
    /// Kinds whose content can be rasterized and recognized.
    pub fn permits_ocr(self) -> bool {
        matches!(self, FileKind::Pdf | FileKind::Image)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Pdf => "pdf",
            FileKind::Image => "image",
            FileKind::Office => "office",
            FileKind::Text => "text",
            FileKind::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrEngineKind {
    Classic,
    Neural,
}

impl OcrEngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OcrEngineKind::Classic => "classic",
            OcrEngineKind::Neural => "neural",
        }
    }
}

impl fmt::Display for OcrEngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    LowConfidence,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConceptMatch {
    pub concept_id: String,
    pub label: String,
    pub ontology_id: String,
    pub matched_term: String,
}

/// The canonical, enriched record handed to the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: ContentHash,
    pub path: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub directory_id: String,
    pub mime_type: String,
    pub file_kind: FileKind,
    pub text: String,
    pub metadata: Metadata,
    pub concepts: Vec<ConceptMatch>,
    pub ocr_applied: bool,
    pub ocr_confidence: Option<f64>,
    pub handwriting_detected: bool,
    #[serde(default)]
    pub engines_used: Vec<OcrEngineKind>,
    #[serde(default)]
    pub quality_flags: Vec<QualityFlag>,
    pub file_size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub indexed_at: DateTime<Utc>,
}

impl Document {
    /// Every path currently holding this content, primary path first.
    pub fn all_paths(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.path.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.all_paths().any(|candidate| candidate == path)
    }

    /// Records `path` as an alias unless it is already known.
    pub fn add_alias(&mut self, path: &str) -> bool {
        if self.has_path(path) {
            return false;
        }
        self.aliases.push(path.to_string());
        true
    }

    /// Drops `path` from the document, promoting the first alias when the primary path goes.
    /// Returns `true` when no path remains.
    pub fn release_path(&mut self, path: &str) -> bool {
        if self.path == path {
            if self.aliases.is_empty() {
                return true;
            }
            self.path = self.aliases.remove(0);
        } else {
            self.aliases.retain(|alias| alias != path);
        }
        false
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn document(hash_seed: char, path: &str) -> Document {
        Document {
            id: ContentHash::from_hex(hash_seed.to_string().repeat(64)).expect("valid hash"),
            path: path.to_string(),
            aliases: Vec::new(),
            directory_id: "docs".to_string(),
            mime_type: "application/pdf".to_string(),
            file_kind: FileKind::Pdf,
            text: "Mietvertrag zwischen den Parteien".to_string(),
            metadata: Metadata::from([(
                "filename_version".to_string(),
                serde_json::json!(["2"]),
            )]),
            concepts: vec![ConceptMatch {
                concept_id: "rental_contract".to_string(),
                label: "Mietvertrag".to_string(),
                ontology_id: "document_types".to_string(),
                matched_term: "mietvertrag".to_string(),
            }],
            ocr_applied: false,
            ocr_confidence: None,
            handwriting_detected: false,
            engines_used: Vec::new(),
            quality_flags: Vec::new(),
            file_size: 2048,
            modified_at: None,
            indexed_at: Utc::now(),
        }
    }
}
