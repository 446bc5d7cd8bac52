//! Namespaced metadata per file kind, plus file-name and text analysis.

pub mod filename;
pub mod text_stats;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    error::AppError,
    storage::types::{
        document::{FileKind, Metadata},
        file_reference::FileReference,
    },
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::utils::{image_parsing, office, pdf_ingestion};

/// Characters on page one below which a PDF is probably a scan.
const SCANNED_FIRST_PAGE_CHARS: usize = 100;

/// Everything a metadata source may look at.
pub struct MetadataInput<'a> {
    pub reference: &'a FileReference,
    pub kind: FileKind,
    pub mime_type: &'a str,
    pub bytes: &'a Bytes,
    /// Native text of page one, when extraction produced any.
    pub first_page_text: Option<&'a str>,
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Field prefix, also used for the `<namespace>_error` field.
    fn namespace(&self) -> &'static str;

    /// Fields written before an error are kept.
    async fn extract(
        &self,
        input: &MetadataInput<'_>,
        metadata: &mut Metadata,
    ) -> Result<(), AppError>;
}

pub struct PdfMetadata;
pub struct ImageMetadata;
pub struct OfficeMetadata;

/// Picks the source for `kind` and always adds `file_*` and `filename_*` fields.
#[derive(Default)]
pub struct MetadataExtractor;

impl MetadataExtractor {
    fn source_for(kind: FileKind) -> Option<&'static dyn MetadataSource> {
        match kind {
            FileKind::Pdf => Some(&PdfMetadata),
            FileKind::Image => Some(&ImageMetadata),
            FileKind::Office => Some(&OfficeMetadata),
            FileKind::Text | FileKind::Generic => None,
        }
    }

    /// Never fails; a broken section yields a partial mapping and a `<namespace>_error` field.
    pub async fn extract(&self, input: &MetadataInput<'_>) -> Metadata {
        let mut metadata = generic_fields(input);
        let file_name = input.reference.file_name();
        metadata.extend(filename::analyze(&file_name));

        if let Some(source) = Self::source_for(input.kind) {
            if let Err(err) = source.extract(input, &mut metadata).await {
                warn!(
                    path = %input.reference.path_key(),
                    namespace = source.namespace(),
                    error = %err,
                    "metadata section unreadable"
                );
                metadata.insert(
                    format!("{}_error", source.namespace()),
                    Value::String(err.to_string()),
                );
            }
        }
        debug!(
            path = %input.reference.path_key(),
            fields = metadata.len(),
            "metadata extracted"
        );
        metadata
    }
}

fn generic_fields(input: &MetadataInput<'_>) -> Metadata {
    let path = &input.reference.path;
    let mut metadata = Metadata::new();
    metadata.insert("file_name".into(), Value::from(input.reference.file_name()));
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        metadata.insert("file_extension".into(), Value::from(extension.to_lowercase()));
    }
    metadata.insert("file_size".into(), Value::from(input.reference.size));
    metadata.insert("file_mime_type".into(), Value::from(input.mime_type));
    if let Some(modified) = input.reference.modified_at {
        metadata.insert("file_modified".into(), Value::from(modified.to_rfc3339()));
    }
    metadata
}

fn prefixed(namespace: &str, fields: BTreeMap<String, String>) -> Metadata {
    fields
        .into_iter()
        .map(|(key, value)| (format!("{namespace}_{key}"), value))
        .map(|(key, value)| {
            let value = value
                .parse::<u64>()
                .map_or_else(|_| Value::String(value), Value::from);
            (key, value)
        })
        .collect()
}

#[async_trait]
impl MetadataSource for PdfMetadata {
    fn namespace(&self) -> &'static str {
        "pdf"
    }

    async fn extract(
        &self,
        input: &MetadataInput<'_>,
        metadata: &mut Metadata,
    ) -> Result<(), AppError> {
        // Page-one facts come from extraction, not from the document catalogue.
        let first_page_chars = input
            .first_page_text
            .map_or(0, |text| text.trim().chars().count());
        metadata.insert(
            "pdf_first_page_text_length".into(),
            Value::from(first_page_chars),
        );
        metadata.insert(
            "pdf_is_likely_scanned".into(),
            Value::from(first_page_chars < SCANNED_FIRST_PAGE_CHARS),
        );

        let info = pdf_ingestion::read_info(input.bytes.clone()).await?;
        metadata.insert("pdf_page_count".into(), Value::from(info.page_count));
        metadata.insert("pdf_encrypted".into(), Value::from(info.encrypted));

        for (key, value) in info.info {
            let field = match key.as_str() {
                "CreationDate" => "pdf_creation_date".to_string(),
                "ModDate" => "pdf_modification_date".to_string(),
                other => format!("pdf_{}", other.to_lowercase()),
            };
            let value = if field.ends_with("_date") {
                normalize_pdf_date(&value).unwrap_or(value)
            } else {
                value
            };
            metadata.insert(field, Value::String(value));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataSource for ImageMetadata {
    fn namespace(&self) -> &'static str {
        "image"
    }

    async fn extract(
        &self,
        input: &MetadataInput<'_>,
        metadata: &mut Metadata,
    ) -> Result<(), AppError> {
        let bytes = input.bytes.clone();
        let (header, exif) = tokio::task::spawn_blocking(move || {
            (
                image_parsing::read_header(&bytes),
                image_parsing::read_exif(&bytes),
            )
        })
        .await?;

        let info = header?;
        metadata.insert("image_width".into(), Value::from(info.width));
        metadata.insert("image_height".into(), Value::from(info.height));
        if let Some(format) = info.format {
            let name = format
                .extensions_str()
                .first()
                .map_or_else(|| format!("{format:?}"), |ext| ext.to_uppercase());
            metadata.insert("image_format".into(), Value::from(name));
        }
        metadata.insert("image_color".into(), Value::from(info.color));
        let megapixels = f64::from(info.width) * f64::from(info.height) / 1_000_000.0;
        metadata.insert(
            "image_megapixels".into(),
            Value::from((megapixels * 100.0).round() / 100.0),
        );
        if let Some(dpi) = info.dpi {
            metadata.insert("image_dpi".into(), Value::from(dpi));
        }

        if let Some(exif) = exif? {
            for (name, value) in exif.text {
                metadata.insert(format!("exif_{name}"), Value::String(value));
            }
            metadata.insert("exif_has_gps".into(), Value::from(exif.has_gps));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataSource for OfficeMetadata {
    fn namespace(&self) -> &'static str {
        "office"
    }

    async fn extract(
        &self,
        input: &MetadataInput<'_>,
        metadata: &mut Metadata,
    ) -> Result<(), AppError> {
        let bytes = input.bytes.clone();
        let properties =
            tokio::task::spawn_blocking(move || office::read_properties(&bytes)).await??;
        metadata.extend(prefixed("office", properties));
        Ok(())
    }
}

/// Turns a PDF date (`D:YYYYMMDDHHmmSS+hh'mm'`) into `YYYY-MM-DD HH:MM:SS`.
pub fn normalize_pdf_date(raw: &str) -> Option<String> {
    let digits: String = raw
        .trim()
        .trim_start_matches("D:")
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    if digits.len() < 4 {
        return None;
    }
    let field = |from: usize, to: usize, default: u32| -> Option<u32> {
        match digits.get(from..to) {
            Some(part) => part.parse().ok(),
            None => Some(default),
        }
    };
    let year = i32::try_from(field(0, 4, 0)?).ok()?;
    let date = chrono::NaiveDate::from_ymd_opt(year, field(4, 6, 1)?, field(6, 8, 1)?)?;
    let time = date.and_hms_opt(field(8, 10, 0)?, field(10, 12, 0)?, field(12, 14, 0)?)?;
    Some(time.format("%Y-%m-%d %H:%M:%S").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{
        image_parsing::fixtures::{ascii, exif_block, png_bytes, with_chunk},
        office::fixtures::docx,
        pdf_ingestion::fixtures::pdf_with_pages,
    };
    use serde_json::json;
    use std::path::PathBuf;

    fn reference(name: &str, size: u64) -> FileReference {
        let mut reference = FileReference::new(PathBuf::from(format!("/archive/{name}")), "archive");
        reference.size = size;
        reference
    }

    async fn extract(name: &str, kind: FileKind, mime: &str, bytes: Vec<u8>) -> Metadata {
        let reference = reference(name, bytes.len() as u64);
        let bytes = Bytes::from(bytes);
        MetadataExtractor
            .extract(&MetadataInput {
                reference: &reference,
                kind,
                mime_type: mime,
                bytes: &bytes,
                first_page_text: Some("kurz"),
            })
            .await
    }

    #[test]
    fn pdf_dates_are_normalized() {
        assert_eq!(
            normalize_pdf_date("D:20240115093000+01'00'").as_deref(),
            Some("2024-01-15 09:30:00")
        );
        assert_eq!(
            normalize_pdf_date("D:1998").as_deref(),
            Some("1998-01-01 00:00:00")
        );
        assert_eq!(normalize_pdf_date("D:20241340"), None);
        assert_eq!(normalize_pdf_date("yesterday"), None);
    }

    #[tokio::test]
    async fn pdf_fields_are_namespaced() {
        let metadata = extract(
            "Bericht_v3.pdf",
            FileKind::Pdf,
            "application/pdf",
            pdf_with_pages(&["eins", "zwei"]),
        )
        .await;
        assert_eq!(metadata.get("pdf_page_count"), Some(&json!(2)));
        assert_eq!(metadata.get("pdf_title"), Some(&json!("Quartalsbericht")));
        assert_eq!(
            metadata.get("pdf_creation_date"),
            Some(&json!("2024-01-15 09:30:00"))
        );
        assert_eq!(metadata.get("pdf_is_likely_scanned"), Some(&json!(true)));
        assert_eq!(metadata.get("filename_version"), Some(&json!(["3"])));
        assert_eq!(metadata.get("file_extension"), Some(&json!("pdf")));
    }

    #[tokio::test]
    async fn office_fields_are_namespaced() {
        let metadata = extract(
            "Mietvertrag.docx",
            FileKind::Office,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            docx(&["Text"]),
        )
        .await;
        assert_eq!(metadata.get("office_title"), Some(&json!("Mietvertrag")));
        assert_eq!(metadata.get("office_page_count"), Some(&json!(2)));
        assert_eq!(metadata.get("office_revision"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn corrupt_sections_yield_partial_metadata_with_error() {
        let metadata = extract(
            "kaputt.pdf",
            FileKind::Pdf,
            "application/pdf",
            b"%PDF-1.4 truncated".to_vec(),
        )
        .await;
        assert!(metadata.contains_key("pdf_error"));
        assert_eq!(metadata.get("file_name"), Some(&json!("kaputt.pdf")));
        assert_eq!(metadata.get("file_size"), Some(&json!(18)));
        assert_eq!(metadata.get("pdf_first_page_text_length"), Some(&json!(4)));
        assert_eq!(metadata.get("pdf_is_likely_scanned"), Some(&json!(true)));
        assert!(!metadata.contains_key("pdf_page_count"));
    }

    #[tokio::test]
    async fn image_fields_include_exif_when_present() {
        let block = exif_block(&[
            ascii(exif::Tag::Make, "Nikon"),
            ascii(exif::Tag::DateTimeOriginal, "1999:12:31 23:59:00"),
        ]);
        let png = with_chunk(&png_bytes(8, 6), b"eXIf", &block);

        let metadata = extract("foto.png", FileKind::Image, "image/png", png).await;
        assert_eq!(metadata.get("image_width"), Some(&json!(8)));
        assert_eq!(metadata.get("image_height"), Some(&json!(6)));
        assert_eq!(metadata.get("exif_camera_make"), Some(&json!("Nikon")));
        assert_eq!(
            metadata.get("exif_photo_taken_date"),
            Some(&json!("1999:12:31 23:59:00"))
        );
        assert_eq!(metadata.get("exif_has_gps"), Some(&json!(false)));
        assert!(!metadata.contains_key("image_error"));
    }

    #[tokio::test]
    async fn images_without_exif_carry_no_exif_fields() {
        let metadata = extract("plain.png", FileKind::Image, "image/png", png_bytes(3, 3)).await;
        assert_eq!(metadata.get("image_format"), Some(&json!("PNG")));
        assert!(!metadata.contains_key("image_error"));
        assert!(metadata.keys().all(|key| !key.starts_with("exif_")));
    }

    #[tokio::test]
    async fn text_files_carry_generic_fields_only() {
        let metadata = extract("notiz.txt", FileKind::Text, "text/plain", b"hallo".to_vec()).await;
        assert_eq!(metadata.get("file_mime_type"), Some(&json!("text/plain")));
        assert!(metadata.keys().all(|key| key.starts_with("file_")));
    }
}
