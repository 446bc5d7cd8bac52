//! Text and document properties from OOXML (docx/pptx/xlsx) and ODF containers.

use std::{
    collections::BTreeMap,
    io::{Cursor, Read},
};

use common::error::AppError;
use quick_xml::{events::Event, Reader};
use thiserror::Error;
use zip::{result::ZipError, ZipArchive};

/// Zip-bomb guard for a single decompressed entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("not a readable office container: {0}")]
    Zip(#[from] ZipError),
    #[error("malformed office XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("failed to read office entry: {0}")]
    Io(#[from] std::io::Error),
    #[error("entry {0} exceeds the size limit")]
    EntryTooLarge(String),
    #[error("unrecognized office layout")]
    UnknownLayout,
}

impl From<ExtractError> for AppError {
    fn from(err: ExtractError) -> Self {
        AppError::Extraction(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfficeLayout {
    Docx,
    Pptx,
    Xlsx,
    OpenDocument,
}

type Archive<'a> = ZipArchive<Cursor<&'a [u8]>>;

fn open(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    Ok(ZipArchive::new(Cursor::new(bytes))?)
}

fn layout(archive: &Archive<'_>) -> Result<OfficeLayout, ExtractError> {
    let has = |name: &str| archive.file_names().any(|entry| entry == name);
    if has("word/document.xml") {
        Ok(OfficeLayout::Docx)
    } else if has("ppt/presentation.xml") {
        Ok(OfficeLayout::Pptx)
    } else if has("xl/workbook.xml") {
        Ok(OfficeLayout::Xlsx)
    } else if has("content.xml") {
        Ok(OfficeLayout::OpenDocument)
    } else {
        Err(ExtractError::UnknownLayout)
    }
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Option<Vec<u8>>, ExtractError> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut out = Vec::new();
    entry.take(MAX_XML_ENTRY_BYTES).read_to_end(&mut out)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::EntryTooLarge(name.to_string()));
    }
    Ok(Some(out))
}

/// Entries sharing `prefix`, ordered by their trailing number (`slide2` before `slide10`).
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|name| name.starts_with(prefix) && name.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Plain text of an office document, one paragraph per line.
pub fn extract_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open(bytes)?;
    let mut parts = Vec::new();
    match layout(&archive)? {
        OfficeLayout::Docx => {
            if let Some(xml) = read_entry(&mut archive, "word/document.xml")? {
                parts.push(collect_text(&xml, &[b"t"], &[b"p", b"br", b"tab"])?);
            }
        }
        OfficeLayout::Pptx => {
            for name in numbered_entries(&archive, "ppt/slides/slide") {
                if let Some(xml) = read_entry(&mut archive, &name)? {
                    parts.push(collect_text(&xml, &[b"t"], &[b"p"])?);
                }
            }
        }
        OfficeLayout::Xlsx => {
            if let Some(xml) = read_entry(&mut archive, "xl/sharedStrings.xml")? {
                parts.push(collect_text(&xml, &[b"t"], &[b"si"])?);
            }
        }
        OfficeLayout::OpenDocument => {
            if let Some(xml) = read_entry(&mut archive, "content.xml")? {
                parts.push(collect_text(&xml, &[b"body"], &[b"p", b"h", b"line-break"])?);
            }
        }
    }
    Ok(tidy_lines(&parts.join("\n")))
}

/// Appends text found inside any of `text_tags`; `break_tags` end a line when they close.
fn collect_text(
    xml: &[u8],
    text_tags: &[&[u8]],
    break_tags: &[&[u8]],
) -> Result<String, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut depth = 0_usize;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                if text_tags.contains(&e.local_name().as_ref()) {
                    depth += 1;
                }
            }
            Event::End(e) => {
                let name = e.local_name();
                if text_tags.contains(&name.as_ref()) {
                    depth = depth.saturating_sub(1);
                }
                if break_tags.contains(&name.as_ref()) {
                    out.push('\n');
                }
            }
            Event::Empty(e) => {
                if depth > 0 && break_tags.contains(&e.local_name().as_ref()) {
                    out.push('\n');
                }
            }
            Event::Text(text) if depth > 0 => {
                out.push_str(&text.unescape()?);
            }
            Event::CData(data) if depth > 0 => {
                out.push_str(&String::from_utf8_lossy(&data));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn tidy_lines(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Element (by local name) to metadata field, for OOXML core and app properties.
const OOXML_PROPERTIES: [(&str, &str); 11] = [
    ("title", "title"),
    ("creator", "author"),
    ("subject", "subject"),
    ("keywords", "keywords"),
    ("created", "created"),
    ("modified", "modified"),
    ("lastModifiedBy", "last_author"),
    ("revision", "revision"),
    ("Pages", "page_count"),
    ("Words", "word_count"),
    ("Application", "application"),
];

const ODF_PROPERTIES: [(&str, &str); 9] = [
    ("title", "title"),
    ("initial-creator", "author"),
    ("subject", "subject"),
    ("keyword", "keywords"),
    ("creation-date", "created"),
    ("date", "modified"),
    ("creator", "last_author"),
    ("editing-cycles", "revision"),
    ("generator", "application"),
];

/// Document properties keyed by field name without namespace (`title`, `author`, ...).
pub fn read_properties(bytes: &[u8]) -> Result<BTreeMap<String, String>, ExtractError> {
    let mut archive = open(bytes)?;
    let mut properties = BTreeMap::new();
    if layout(&archive)? == OfficeLayout::OpenDocument {
        if let Some(xml) = read_entry(&mut archive, "meta.xml")? {
            collect_properties(&xml, &ODF_PROPERTIES, &mut properties)?;
        }
    } else {
        for name in ["docProps/core.xml", "docProps/app.xml"] {
            if let Some(xml) = read_entry(&mut archive, name)? {
                collect_properties(&xml, &OOXML_PROPERTIES, &mut properties)?;
            }
        }
    }
    Ok(properties)
}

fn collect_properties(
    xml: &[u8],
    mapping: &[(&str, &str)],
    properties: &mut BTreeMap<String, String>,
) -> Result<(), ExtractError> {
    let field_for = |local: &[u8]| {
        mapping
            .iter()
            .find(|(element, _)| element.as_bytes() == local)
            .map(|(_, field)| *field)
    };

    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current: Option<&str> = None;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => current = field_for(e.local_name().as_ref()),
            Event::Empty(e) if e.local_name().as_ref() == b"document-statistic" => {
                for attribute in e.attributes().flatten() {
                    let field = match attribute.key.local_name().as_ref() {
                        b"page-count" => "page_count",
                        b"word-count" => "word_count",
                        _ => continue,
                    };
                    let value = attribute.unescape_value()?;
                    properties.insert(field.to_string(), value.into_owned());
                }
            }
            Event::Text(text) => {
                if let Some(field) = current {
                    let value = text.unescape()?;
                    if !value.trim().is_empty() {
                        properties
                            .entry(field.to_string())
                            .or_insert_with(|| value.trim().to_string());
                    }
                }
            }
            Event::End(_) => current = None,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}
