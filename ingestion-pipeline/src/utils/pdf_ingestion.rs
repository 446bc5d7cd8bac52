use std::{collections::BTreeMap, io::ErrorKind, path::PathBuf};

use bytes::Bytes;
use image::DynamicImage;
use lopdf::{Dictionary, Document, Object};
use tokio::process::Command;
use tracing::debug;

use common::error::AppError;

/// Document-information keys carried over into metadata.
const INFO_KEYS: [&str; 8] = [
    "Title",
    "Author",
    "Subject",
    "Creator",
    "Producer",
    "Keywords",
    "CreationDate",
    "ModDate",
];

/// A rasterized page ready for OCR.
#[derive(Debug, Clone)]
pub struct RasterPage {
    /// 1-based page number.
    pub page: usize,
    pub image: DynamicImage,
    pub dpi: Option<u32>,
}

/// Structural facts from the PDF trailer and page tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PdfInfo {
    pub page_count: usize,
    pub encrypted: bool,
    pub info: BTreeMap<String, String>,
}

/// Runs `pdf-extract` per page on the blocking pool.
pub async fn extract_pages(pdf_bytes: Bytes) -> Result<Vec<String>, AppError> {
    let pages = tokio::task::spawn_blocking(move || {
        pdf_extract::extract_text_from_mem_by_pages(&pdf_bytes)
    })
    .await?
    .map_err(|err| AppError::Extraction(format!("Failed to extract text from PDF: {err}")))?;

    Ok(pages.iter().map(|page| normalize_page_text(page)).collect())
}

/// Reads page count, encryption and the info dictionary with `lopdf`.
pub async fn read_info(pdf_bytes: Bytes) -> Result<PdfInfo, AppError> {
    tokio::task::spawn_blocking(move || -> Result<PdfInfo, AppError> {
        let document = Document::load_mem(&pdf_bytes)
            .map_err(|err| AppError::Extraction(format!("Failed to parse PDF: {err}")))?;
        Ok(PdfInfo {
            page_count: document.get_pages().len(),
            encrypted: document.trailer.get(b"Encrypt").is_ok(),
            info: info_dictionary(&document)
                .map(collect_info)
                .unwrap_or_default(),
        })
    })
    .await?
}

fn info_dictionary(document: &Document) -> Option<&Dictionary> {
    match document.trailer.get(b"Info").ok()? {
        Object::Reference(id) => document.get_object(*id).ok()?.as_dict().ok(),
        Object::Dictionary(dictionary) => Some(dictionary),
        _ => None,
    }
}

fn collect_info(dictionary: &Dictionary) -> BTreeMap<String, String> {
    INFO_KEYS
        .iter()
        .filter_map(|key| {
            let Ok(Object::String(raw, _)) = dictionary.get(key.as_bytes()) else {
                return None;
            };
            let value = decode_pdf_string(raw);
            let value = value.trim();
            (!value.is_empty()).then(|| ((*key).to_string(), value.to_string()))
        })
        .collect()
}

/// UTF-16BE when the string carries a byte-order mark, PDFDocEncoding (≈ Latin-1) otherwise.
pub fn decode_pdf_string(raw: &[u8]) -> String {
    match raw {
        [0xFE, 0xFF, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .filter_map(|pair| match pair {
                    [high, low] => Some(u16::from_be_bytes([*high, *low])),
                    _ => None,
                })
                .collect();
            String::from_utf16_lossy(&units)
        }
        _ => raw.iter().map(|&b| char::from(b)).collect(),
    }
}

/// Renders every page with `pdftoppm` and loads the PNGs in page order.
pub async fn rasterize(
    pdftoppm: &std::path::Path,
    pdf_bytes: &[u8],
    dpi: u32,
) -> Result<Vec<RasterPage>, AppError> {
    let workdir = tempfile::tempdir()?;
    let input = workdir.path().join("input.pdf");
    tokio::fs::write(&input, pdf_bytes).await?;
    let prefix = workdir.path().join("page");

    let output = Command::new(pdftoppm)
        .arg("-r")
        .arg(dpi.to_string())
        .arg("-png")
        .arg(&input)
        .arg(&prefix)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| match err.kind() {
            ErrorKind::NotFound => AppError::Extraction(format!(
                "{} not found; install poppler-utils to rasterize PDFs",
                pdftoppm.display()
            )),
            _ => AppError::Io(err),
        })?;
    if !output.status.success() {
        return Err(AppError::Extraction(format!(
            "pdftoppm failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let mut rendered: Vec<PathBuf> = Vec::new();
    let mut entries = tokio::fs::read_dir(workdir.path()).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "png") {
            rendered.push(path);
        }
    }
    // pdftoppm zero-pads page numbers, so name order is page order.
    rendered.sort();
    debug!(pages = rendered.len(), dpi, "rasterized PDF");

    let pages = tokio::task::spawn_blocking(move || -> Result<Vec<RasterPage>, AppError> {
        rendered
            .iter()
            .enumerate()
            .map(|(index, path)| {
                let image = image::open(path).map_err(|err| {
                    AppError::Extraction(format!("unreadable page raster {}: {err}", path.display()))
                })?;
                Ok(RasterPage {
                    page: index + 1,
                    image,
                    dpi: Some(dpi),
                })
            })
            .collect()
    })
    .await??;

    // Keep the directory alive until every page is decoded.
    drop(workdir);
    Ok(pages)
}

/// Trims trailing whitespace per line and collapses runs of blank lines.
fn normalize_page_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0_usize;
    for line in text.lines().map(str::trim_end) {
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}
