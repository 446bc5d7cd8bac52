//! Read-only ontology snapshots loaded from JSON taxonomies.
//!
//! Each `*.json` file in the ontology directory holds one ontology: either a single root node or
//! a list of root nodes. The file stem becomes the ontology id.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use unicode_normalization::UnicodeNormalization;

#[derive(Error, Debug)]
pub enum OntologyError {
    #[error("failed to read ontology {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed ontology {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("ontology {ontology}: node without id or label")]
    MissingLabel { ontology: String },
}

#[derive(Debug, Clone, Deserialize)]
struct RawNode {
    id: Option<String>,
    label: Option<String>,
    name: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    children: Vec<RawNode>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawTaxonomy {
    Many(Vec<RawNode>),
    One(RawNode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OntologyNode {
    pub id: String,
    pub label: String,
    pub aliases: Vec<String>,
    pub children: Vec<OntologyNode>,
}

impl OntologyNode {
    pub fn leaf(id: &str, label: &str, aliases: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            aliases: aliases.iter().map(|alias| (*alias).to_string()).collect(),
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<OntologyNode>) -> Self {
        self.children = children;
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    fn from_raw(raw: RawNode, ontology: &str) -> Result<Self, OntologyError> {
        let label = raw
            .label
            .or(raw.name)
            .filter(|label| !label.trim().is_empty())
            .ok_or_else(|| OntologyError::MissingLabel {
                ontology: ontology.to_string(),
            })?;
        let id = raw
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| label.replace(' ', "_"));
        let children = raw
            .children
            .into_iter()
            .map(|child| OntologyNode::from_raw(child, ontology))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id,
            label,
            aliases: raw.aliases,
            children,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ontology {
    pub id: String,
    pub roots: Vec<OntologyNode>,
}

impl Ontology {
    pub fn new(id: impl Into<String>, roots: Vec<OntologyNode>) -> Self {
        Self {
            id: id.into(),
            roots,
        }
    }

    pub fn from_json(id: &str, raw: &str, path: &Path) -> Result<Self, OntologyError> {
        let taxonomy: RawTaxonomy =
            serde_json::from_str(raw).map_err(|source| OntologyError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let raw_roots = match taxonomy {
            RawTaxonomy::Many(nodes) => nodes,
            RawTaxonomy::One(node) => vec![node],
        };
        let roots = raw_roots
            .into_iter()
            .map(|node| OntologyNode::from_raw(node, id))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(id, roots))
    }
}

/// One concept flattened out of an ontology tree, with its match terms pre-normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConceptEntry {
    pub ontology_id: String,
    pub concept_id: String,
    pub label: String,
    pub is_leaf: bool,
    /// `(normalized, original)` pairs, label first.
    pub terms: Vec<(String, String)>,
}

/// Immutable set of ontologies consumed by one ingestion run.
#[derive(Debug, Clone, Default)]
pub struct OntologySnapshot {
    ontologies: Vec<Ontology>,
    concepts: Vec<ConceptEntry>,
}

impl OntologySnapshot {
    pub fn from_ontologies(ontologies: Vec<Ontology>) -> Self {
        let mut concepts = Vec::new();
        for ontology in &ontologies {
            for root in &ontology.roots {
                flatten(&ontology.id, root, &mut concepts);
            }
        }
        Self {
            ontologies,
            concepts,
        }
    }

    /// Loads every `*.json` taxonomy in `dir`. Broken definitions are skipped and returned.
    pub async fn load_dir(dir: impl AsRef<Path>) -> (Self, Vec<OntologyError>) {
        let dir = dir.as_ref();
        let mut ontologies = Vec::new();
        let mut errors = Vec::new();

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(source) => {
                warn!(path = %dir.display(), error = %source, "ontology directory unavailable");
                errors.push(OntologyError::Read {
                    path: dir.to_path_buf(),
                    source,
                });
                return (Self::default(), errors);
            }
        };

        let mut paths = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "json") {
                        paths.push(path);
                    }
                }
                Ok(None) => break,
                Err(source) => {
                    errors.push(OntologyError::Read {
                        path: dir.to_path_buf(),
                        source,
                    });
                    break;
                }
            }
        }
        paths.sort();

        for path in paths {
            let id = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            let loaded = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => Ontology::from_json(&id, &raw, &path),
                Err(source) => Err(OntologyError::Read {
                    path: path.clone(),
                    source,
                }),
            };
            match loaded {
                Ok(ontology) => ontologies.push(ontology),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping ontology definition");
                    errors.push(err);
                }
            }
        }

        let snapshot = Self::from_ontologies(ontologies);
        info!(
            ontologies = snapshot.ontologies.len(),
            concepts = snapshot.concepts.len(),
            skipped = errors.len(),
            "ontology snapshot loaded"
        );
        (snapshot, errors)
    }

    pub fn ontologies(&self) -> &[Ontology] {
        &self.ontologies
    }

    pub fn concepts(&self) -> &[ConceptEntry] {
        &self.concepts
    }

    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty()
    }
}

fn flatten(ontology_id: &str, node: &OntologyNode, out: &mut Vec<ConceptEntry>) {
    let terms = std::iter::once(&node.label)
        .chain(node.aliases.iter())
        .filter(|term| !term.trim().is_empty())
        .map(|term| (normalize_term(term), term.clone()))
        .collect();
    out.push(ConceptEntry {
        ontology_id: ontology_id.to_string(),
        concept_id: node.id.clone(),
        label: node.label.clone(),
        is_leaf: node.is_leaf(),
        terms,
    });
    for child in &node.children {
        flatten(ontology_id, child, out);
    }
}

/// Canonical form for case-insensitive matching: NFC composition, then full Unicode lowercase.
pub fn normalize_term(input: &str) -> String {
    input.trim().nfc().collect::<String>().to_lowercase()
}
