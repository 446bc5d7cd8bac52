//! Facts encoded in file names such as `Vertrag_DE_v2_Final_2024-01-15.pdf`.

use std::sync::OnceLock;

use chrono::NaiveDate;
use common::storage::types::document::Metadata;
use regex::Regex;
use serde_json::Value;

const STATUS_KEYWORDS: [&str; 6] = ["final", "draft", "entwurf", "vorlage", "template", "korrektur"];
const LANGUAGE_CODES: [&str; 5] = ["DE", "EN", "FR", "ES", "IT"];

static ISO_DATE: OnceLock<Option<Regex>> = OnceLock::new();
static GERMAN_DATE: OnceLock<Option<Regex>> = OnceLock::new();
static COMPACT_DATE: OnceLock<Option<Regex>> = OnceLock::new();
static VERSION: OnceLock<Option<Regex>> = OnceLock::new();

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// Extracts `filename_date`, `filename_version`, `filename_status` and `filename_language`.
///
/// Every field is an array; repeated matches accumulate instead of overwriting.
pub fn analyze(file_name: &str) -> Metadata {
    let stem = file_name
        .rsplit_once('.')
        .map_or(file_name, |(stem, _extension)| stem);
    let tokens: Vec<&str> = stem
        .split(|c: char| matches!(c, '_' | '-' | ' ' | '.'))
        .filter(|token| !token.is_empty())
        .collect();

    let mut metadata = Metadata::new();
    insert_all(&mut metadata, "filename_date", dates(stem));
    insert_all(&mut metadata, "filename_version", versions(stem));
    insert_all(
        &mut metadata,
        "filename_status",
        tokens
            .iter()
            .map(|token| token.to_lowercase())
            .filter(|token| STATUS_KEYWORDS.contains(&token.as_str()))
            .collect(),
    );
    insert_all(
        &mut metadata,
        "filename_language",
        tokens
            .iter()
            .map(|token| token.to_uppercase())
            .filter(|token| LANGUAGE_CODES.contains(&token.as_str()))
            .collect(),
    );
    metadata
}

fn insert_all(metadata: &mut Metadata, key: &str, values: Vec<String>) {
    let mut unique: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        if !unique.contains(&value) {
            unique.push(value);
        }
    }
    if !unique.is_empty() {
        metadata.insert(
            key.to_string(),
            Value::Array(unique.into_iter().map(Value::String).collect()),
        );
    }
}

fn iso(year: &str, month: &str, day: &str) -> Option<String> {
    let date = NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)?;
    Some(date.format("%Y-%m-%d").to_string())
}

/// Valid calendar dates in `YYYY-MM-DD`, `DD.MM.YYYY` or `YYYYMMDD` form, as ISO strings.
fn dates(stem: &str) -> Vec<String> {
    let mut found = Vec::new();
    let patterns = [
        (cached(&ISO_DATE, r"(\d{4})-(\d{2})-(\d{2})"), [1, 2, 3]),
        (cached(&GERMAN_DATE, r"(\d{2})\.(\d{2})\.(\d{4})"), [3, 2, 1]),
        (
            cached(&COMPACT_DATE, r"(?:^|[^0-9])(\d{4})(\d{2})(\d{2})(?:[^0-9]|$)"),
            [1, 2, 3],
        ),
    ];
    for (regex, [year, month, day]) in patterns {
        let Some(regex) = regex else { continue };
        for captures in regex.captures_iter(stem) {
            let part = |index: usize| captures.get(index).map(|m| m.as_str());
            if let (Some(y), Some(m), Some(d)) = (part(year), part(month), part(day)) {
                if let Some(date) = iso(y, m, d) {
                    found.push(date);
                }
            }
        }
    }
    found
}

fn versions(stem: &str) -> Vec<String> {
    let Some(regex) = cached(&VERSION, r"(?i)(?:^|[^[:alnum:]])v(\d+(?:\.\d+)?)") else {
        return Vec::new();
    };
    regex
        .captures_iter(stem)
        .filter_map(|captures| captures.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn contract_name_yields_all_fields() {
        let metadata = analyze("Vertrag_DE_v2_Final_2024-01-15.pdf");
        assert_eq!(metadata.get("filename_date"), Some(&json!(["2024-01-15"])));
        assert_eq!(metadata.get("filename_version"), Some(&json!(["2"])));
        assert_eq!(metadata.get("filename_status"), Some(&json!(["final"])));
        assert_eq!(metadata.get("filename_language"), Some(&json!(["DE"])));
    }

    #[test]
    fn german_and_compact_dates_are_normalized() {
        let metadata = analyze("Protokoll 03.02.2023 und 20230415.docx");
        assert_eq!(
            metadata.get("filename_date"),
            Some(&json!(["2023-02-03", "2023-04-15"]))
        );
    }

    #[test]
    fn impossible_dates_are_dropped() {
        let metadata = analyze("scan_2023-02-30.tif");
        assert!(!metadata.contains_key("filename_date"));
    }

    #[test]
    fn repeated_matches_accumulate_without_duplicates() {
        let metadata = analyze("Entwurf-EN-DE-draft-v1-v1.2-EN.odt");
        assert_eq!(
            metadata.get("filename_status"),
            Some(&json!(["entwurf", "draft"]))
        );
        assert_eq!(metadata.get("filename_language"), Some(&json!(["EN", "DE"])));
        assert_eq!(metadata.get("filename_version"), Some(&json!(["1", "1.2"])));
    }

    #[test]
    fn language_codes_match_in_any_case() {
        let metadata = analyze("es_it_de_notes.txt");
        assert_eq!(
            metadata.get("filename_language"),
            Some(&json!(["ES", "IT", "DE"]))
        );
        let metadata = analyze("Brief-en-De.pdf");
        assert_eq!(metadata.get("filename_language"), Some(&json!(["EN", "DE"])));
    }

    #[test]
    fn longer_words_are_not_language_codes() {
        let metadata = analyze("deutsch_english_notes.txt");
        assert!(!metadata.contains_key("filename_language"));
        assert!(analyze("README").is_empty());
    }
}
