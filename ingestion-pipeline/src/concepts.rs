//! Tags documents with ontology concepts whose label or aliases occur in their text.

use std::collections::HashSet;

use common::storage::types::{
    document::{ConceptMatch, Metadata},
    ontology::{normalize_term, OntologySnapshot},
};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct ConceptMatcher {
    match_inner_nodes: bool,
}

impl ConceptMatcher {
    pub fn new(match_inner_nodes: bool) -> Self {
        Self { match_inner_nodes }
    }

    /// Every concept with at least one term present in `text` or a string metadata value.
    ///
    /// Multi-label: no best-match selection. A concept hit by several terms is reported once,
    /// with the first matching term in label-then-alias order.
    pub fn match_concepts(
        &self,
        snapshot: &OntologySnapshot,
        text: &str,
        metadata: &Metadata,
    ) -> Vec<ConceptMatch> {
        if snapshot.is_empty() {
            return Vec::new();
        }
        let haystack = haystack(text, metadata);
        if haystack.is_empty() {
            return Vec::new();
        }

        let mut seen = HashSet::new();
        let mut matches = Vec::new();
        for entry in snapshot.concepts() {
            if !entry.is_leaf && !self.match_inner_nodes {
                continue;
            }
            let hit = entry
                .terms
                .iter()
                .find(|(normalized, _)| !normalized.is_empty() && haystack.contains(normalized.as_str()));
            let Some((_, original)) = hit else { continue };
            if !seen.insert((entry.ontology_id.as_str(), entry.concept_id.as_str())) {
                continue;
            }
            matches.push(ConceptMatch {
                concept_id: entry.concept_id.clone(),
                label: entry.label.clone(),
                ontology_id: entry.ontology_id.clone(),
                matched_term: original.clone(),
            });
        }

        debug!(matched = matches.len(), "concepts matched");
        matches
    }
}

fn haystack(text: &str, metadata: &Metadata) -> String {
    let mut combined = String::with_capacity(text.len());
    combined.push_str(text);
    for value in metadata.values() {
        collect_strings(value, &mut combined);
    }
    normalize_term(&combined)
}

fn collect_strings(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            out.push('\n');
            out.push_str(s);
        }
        Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::ontology::{Ontology, OntologyNode};
    use serde_json::json;

    fn snapshot() -> OntologySnapshot {
        let contracts = OntologyNode::leaf("contracts", "Verträge", &["Vertrag"]).with_children(vec![
            OntologyNode::leaf("rental_contract", "Mietvertrag", &["Mietvereinbarung"]),
            OntologyNode::leaf("service_contract", "Dienstleistungsvertrag", &["Service Agreement"]),
        ]);
        let places = OntologyNode::leaf("vienna", "Wien", &["Vienna"]);
        OntologySnapshot::from_ontologies(vec![
            Ontology::new("document_types", vec![contracts]),
            Ontology::new("places", vec![places]),
        ])
    }

    fn ids(matches: &[ConceptMatch]) -> Vec<&str> {
        matches.iter().map(|m| m.concept_id.as_str()).collect()
    }

    #[test]
    fn matches_are_case_insensitive_and_multi_label() {
        let matches = ConceptMatcher::default().match_concepts(
            &snapshot(),
            "Der MIETVERTRAG für die Wohnung in vienna.",
            &Metadata::new(),
        );
        assert_eq!(ids(&matches), vec!["rental_contract", "vienna"]);
        assert_eq!(matches[1].matched_term, "Vienna");
        assert_eq!(matches[1].ontology_id, "places");
    }

    #[test]
    fn inner_nodes_need_opt_in() {
        let text = "Ein Vertrag ohne Typ";
        assert!(ConceptMatcher::new(false)
            .match_concepts(&snapshot(), text, &Metadata::new())
            .is_empty());
        let matches = ConceptMatcher::new(true).match_concepts(&snapshot(), text, &Metadata::new());
        assert_eq!(ids(&matches), vec!["contracts"]);
    }

    #[test]
    fn one_match_per_concept_even_with_several_terms() {
        let matches = ConceptMatcher::default().match_concepts(
            &snapshot(),
            "Mietvertrag bzw. Mietvereinbarung",
            &Metadata::new(),
        );
        assert_eq!(ids(&matches), vec!["rental_contract"]);
        assert_eq!(matches[0].matched_term, "Mietvertrag");
    }

    #[test]
    fn decomposed_umlauts_match_composed_terms() {
        let decomposed = "Vertra\u{0308}ge im Archiv";
        let matches = ConceptMatcher::new(true).match_concepts(&snapshot(), decomposed, &Metadata::new());
        assert_eq!(matches[0].matched_term, "Verträge");
    }

    #[test]
    fn metadata_strings_are_searched_too() {
        let metadata = Metadata::from([
            ("office_title".to_string(), json!("Service Agreement 2024")),
            ("filename_status".to_string(), json!(["final"])),
        ]);
        let matches = ConceptMatcher::default().match_concepts(&snapshot(), "", &metadata);
        assert_eq!(ids(&matches), vec!["service_contract"]);
    }

    #[test]
    fn empty_snapshot_matches_nothing() {
        assert!(ConceptMatcher::default()
            .match_concepts(&OntologySnapshot::default(), "Mietvertrag", &Metadata::new())
            .is_empty());
    }
}
