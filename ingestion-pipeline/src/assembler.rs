use chrono::Utc;
use common::storage::types::{
    content_hash::ContentHash,
    document::{ConceptMatch, Document, FileKind, Metadata, OcrEngineKind, QualityFlag},
    file_reference::FileReference,
};
use tracing::debug;

use crate::{
    metadata::text_stats,
    ocr::{Confidence, OcrResult},
};

/// Everything gathered for one file before it becomes a [`Document`].
pub struct AssemblyInput<'a> {
    pub hash: ContentHash,
    pub reference: &'a FileReference,
    pub mime_type: String,
    pub kind: FileKind,
    pub text: String,
    pub metadata: Metadata,
    pub concepts: Vec<ConceptMatch>,
    /// Per-page OCR results in page order; empty when native text was used.
    pub ocr_pages: &'a [OcrResult],
}

pub struct DocumentAssembler {
    min_acceptable: Confidence,
}

impl DocumentAssembler {
    pub fn new(min_acceptable: Confidence) -> Self {
        Self { min_acceptable }
    }

    pub fn assemble(&self, input: AssemblyInput<'_>) -> Document {
        let AssemblyInput {
            hash,
            reference,
            mime_type,
            kind,
            text,
            mut metadata,
            concepts,
            ocr_pages,
        } = input;

        let ocr_applied = !ocr_pages.is_empty();
        let ocr_confidence = mean_confidence(ocr_pages);
        let mut quality_flags = Vec::new();
        if ocr_confidence.is_some_and(|confidence| confidence < self.min_acceptable.value()) {
            quality_flags.push(QualityFlag::LowConfidence);
        }

        let mut engines_used: Vec<OcrEngineKind> =
            ocr_pages.iter().map(|page| page.engine_used).collect();
        engines_used.sort_unstable();
        engines_used.dedup();

        metadata.extend(text_stats::analyze(&text));

        debug!(
            hash = %hash,
            ocr_applied,
            ocr_confidence,
            concepts = concepts.len(),
            "document assembled"
        );

        Document {
            id: hash,
            path: reference.path_key(),
            aliases: Vec::new(),
            directory_id: reference.directory_id.clone(),
            mime_type,
            file_kind: kind,
            text,
            metadata,
            concepts,
            ocr_applied,
            ocr_confidence,
            handwriting_detected: ocr_pages.iter().any(|page| page.handwriting_detected),
            engines_used,
            quality_flags,
            file_size: reference.size,
            modified_at: reference.modified_at,
            indexed_at: Utc::now(),
        }
    }
}

/// Mean page confidence; `None` when no page went through OCR.
#[allow(clippy::cast_precision_loss)]
fn mean_confidence(pages: &[OcrResult]) -> Option<f64> {
    if pages.is_empty() {
        return None;
    }
    let total: f64 = pages.iter().map(|page| page.confidence.value()).sum();
    Some(Confidence::new(total / pages.len() as f64).value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::hashing::hash_bytes;

    fn page(engine: OcrEngineKind, confidence: f64, handwriting: bool) -> OcrResult {
        OcrResult {
            text: "Seite".into(),
            confidence: Confidence::new(confidence),
            engine_used: engine,
            handwriting_detected: handwriting,
            error: None,
        }
    }

    fn input<'a>(reference: &'a FileReference, pages: &'a [OcrResult]) -> AssemblyInput<'a> {
        AssemblyInput {
            hash: hash_bytes(b"bytes"),
            reference,
            mime_type: "application/pdf".into(),
            kind: FileKind::Pdf,
            text: "Der Vertrag ist mit der Stadt und den Erben geschlossen.".into(),
            metadata: Metadata::new(),
            concepts: Vec::new(),
            ocr_pages: pages,
        }
    }

    #[test]
    fn native_documents_carry_no_confidence() {
        let mut reference = FileReference::new("/docs/a.pdf", "docs");
        reference.size = 512;
        let document = DocumentAssembler::new(Confidence::new(0.5)).assemble(input(&reference, &[]));

        assert!(!document.ocr_applied);
        assert_eq!(document.ocr_confidence, None);
        assert!(document.quality_flags.is_empty());
        assert!(document.engines_used.is_empty());
        assert_eq!(document.path, "/docs/a.pdf");
        assert_eq!(document.file_size, 512);
        assert_eq!(
            document.metadata.get("text_language"),
            Some(&serde_json::json!("de"))
        );
    }

    #[test]
    fn low_confidence_is_flagged_not_rejected() {
        let reference = FileReference::new("/docs/scan.pdf", "docs");
        let pages = [
            page(OcrEngineKind::Neural, 0.3, true),
            page(OcrEngineKind::Classic, 0.4, false),
            page(OcrEngineKind::Neural, 0.35, false),
        ];
        let document = DocumentAssembler::new(Confidence::new(0.5)).assemble(input(&reference, &pages));

        assert!(document.ocr_applied);
        assert!(document
            .ocr_confidence
            .is_some_and(|c| (c - 0.35).abs() < 1e-9));
        assert_eq!(document.quality_flags, vec![QualityFlag::LowConfidence]);
        assert_eq!(
            document.engines_used,
            vec![OcrEngineKind::Classic, OcrEngineKind::Neural]
        );
        assert!(document.handwriting_detected);
    }

    #[test]
    fn confident_ocr_has_no_flags() {
        let reference = FileReference::new("/docs/scan.png", "docs");
        let pages = [page(OcrEngineKind::Classic, 0.92, false)];
        let document = DocumentAssembler::new(Confidence::new(0.5)).assemble(input(&reference, &pages));
        assert!(document.quality_flags.is_empty());
        assert!(!document.handwriting_detected);
    }
}
