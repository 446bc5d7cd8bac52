use common::storage::types::document::Metadata;
use serde_json::Value;

const GERMAN_STOP_WORDS: [&str; 16] = [
    "der", "die", "das", "und", "ist", "nicht", "mit", "den", "ein", "eine", "zu", "von", "auf",
    "für", "sich", "des",
];
const ENGLISH_STOP_WORDS: [&str; 16] = [
    "the", "and", "is", "not", "with", "of", "to", "a", "an", "for", "on", "that", "this", "are",
    "was", "be",
];
/// Stop-word hits needed before a language is claimed.
const MIN_LANGUAGE_HITS: usize = 3;

/// `text_word_count`, `text_line_count` and a stop-word based `text_language` (de, en, unknown).
pub fn analyze(text: &str) -> Metadata {
    let words: Vec<String> = text
        .split_whitespace()
        .map(|word| {
            word.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|word| !word.is_empty())
        .collect();
    let line_count = text.lines().filter(|line| !line.trim().is_empty()).count();

    let hits = |stop_words: &[&str]| {
        words
            .iter()
            .filter(|word| stop_words.contains(&word.as_str()))
            .count()
    };
    let german = hits(GERMAN_STOP_WORDS.as_slice());
    let english = hits(ENGLISH_STOP_WORDS.as_slice());
    let language = if german.max(english) < MIN_LANGUAGE_HITS || german == english {
        "unknown"
    } else if german > english {
        "de"
    } else {
        "en"
    };

    let mut metadata = Metadata::new();
    metadata.insert("text_word_count".into(), Value::from(words.len()));
    metadata.insert("text_line_count".into(), Value::from(line_count));
    metadata.insert("text_language".into(), Value::from(language));
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_words_and_non_empty_lines() {
        let metadata = analyze("Erste Zeile.\n\n  zweite, Zeile!  \n");
        assert_eq!(metadata.get("text_word_count"), Some(&json!(4)));
        assert_eq!(metadata.get("text_line_count"), Some(&json!(2)));
    }

    #[test]
    fn detects_german_and_english() {
        let german = analyze("Der Vertrag ist mit der Stadt und den Erben für die Dauer geschlossen.");
        assert_eq!(german.get("text_language"), Some(&json!("de")));

        let english = analyze("This is the contract of the city and the heirs for a year.");
        assert_eq!(english.get("text_language"), Some(&json!("en")));
    }

    #[test]
    fn short_or_neutral_text_is_unknown() {
        assert_eq!(analyze("Rechnung 2024").get("text_language"), Some(&json!("unknown")));
        assert_eq!(analyze("").get("text_word_count"), Some(&json!(0)));
    }
}
