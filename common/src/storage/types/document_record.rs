use crate::{
    error::AppError,
    storage::types::{
        content_hash::ContentHash,
        document::{ConceptMatch, Document, FileKind, Metadata, OcrEngineKind, QualityFlag},
    },
    stored_object,
};

stored_object!(DocumentRecord, "document", {
    path: String,
    aliases: Vec<String>,
    directory_id: String,
    mime_type: String,
    file_kind: FileKind,
    text: String,
    metadata_json: String,
    concepts: Vec<ConceptMatch>,
    ocr_applied: bool,
    ocr_confidence: Option<f64>,
    handwriting_detected: bool,
    engines_used: Vec<OcrEngineKind>,
    quality_flags: Vec<QualityFlag>,
    file_size: u64,
    modified_at: Option<String>
});

impl DocumentRecord {
    pub fn from_document(document: &Document) -> Result<Self, AppError> {
        Ok(Self {
            id: document.id.as_str().to_string(),
            created_at: document.indexed_at,
            updated_at: Utc::now(),
            path: document.path.clone(),
            aliases: document.aliases.clone(),
            directory_id: document.directory_id.clone(),
            mime_type: document.mime_type.clone(),
            file_kind: document.file_kind,
            text: document.text.clone(),
            metadata_json: serde_json::to_string(&document.metadata)?,
            concepts: document.concepts.clone(),
            ocr_applied: document.ocr_applied,
            ocr_confidence: document.ocr_confidence,
            handwriting_detected: document.handwriting_detected,
            engines_used: document.engines_used.clone(),
            quality_flags: document.quality_flags.clone(),
            file_size: document.file_size,
            modified_at: document.modified_at.map(|ts| ts.to_rfc3339()),
        })
    }

    pub fn into_document(self) -> Result<Document, AppError> {
        let metadata: Metadata = serde_json::from_str(&self.metadata_json)?;
        let modified_at = self
            .modified_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc));

        Ok(Document {
            id: ContentHash::from_hex(self.id)?,
            path: self.path,
            aliases: self.aliases,
            directory_id: self.directory_id,
            mime_type: self.mime_type,
            file_kind: self.file_kind,
            text: self.text,
            metadata,
            concepts: self.concepts,
            ocr_applied: self.ocr_applied,
            ocr_confidence: self.ocr_confidence,
            handwriting_detected: self.handwriting_detected,
            engines_used: self.engines_used,
            quality_flags: self.quality_flags,
            file_size: self.file_size,
            modified_at,
            indexed_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::document::fixtures::document;

    #[test]
    fn record_preserves_document_fields() {
        let mut original = document('c', "/c/vertrag.pdf");
        original.add_alias("/c/kopie.pdf");
        original.ocr_applied = true;
        original.ocr_confidence = Some(0.82);
        original.engines_used = vec![OcrEngineKind::Classic];
        original.modified_at = Some(Utc::now());

        let record = DocumentRecord::from_document(&original).expect("record");
        assert_eq!(record.id, "c".repeat(64));

        let restored = record.into_document().expect("document");
        assert_eq!(restored.id, original.id);
        assert_eq!(restored.aliases, original.aliases);
        assert_eq!(restored.metadata, original.metadata);
        assert_eq!(restored.ocr_confidence, Some(0.82));
        assert_eq!(
            restored.modified_at.map(|ts| ts.timestamp()),
            original.modified_at.map(|ts| ts.timestamp())
        );
    }
}
