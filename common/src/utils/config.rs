use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    Surreal,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Memory
}

/// Extension groups a directory can opt into through `file_types`.
pub const FILE_TYPE_GROUPS: &[(&str, &[&str])] = &[
    ("libreoffice", &["odt", "ods", "odp", "odg", "odf"]),
    (
        "office",
        &[
            "doc", "docx", "xls", "xlsx", "ppt", "pptx", "docm", "xlsm", "pptm",
        ],
    ),
    ("images", &["png", "jpg", "jpeg", "tif", "tiff", "bmp", "gif"]),
    ("pdf", &["pdf"]),
    ("text", &["txt", "md", "csv", "json", "xml", "html", "htm"]),
    ("email", &["eml", "msg"]),
    ("archives", &["zip", "tar", "gz", "7z"]),
];

#[derive(Clone, Deserialize, Debug)]
pub struct DirectoryConfig {
    pub id: String,
    pub path: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub recursive: bool,
    /// Group names from [`FILE_TYPE_GROUPS`] or bare extensions. Empty means every group.
    #[serde(default)]
    pub file_types: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

impl DirectoryConfig {
    /// Lowercase extensions (without dot) accepted for this directory.
    pub fn allowed_extensions(&self) -> Vec<String> {
        let mut extensions: Vec<String> = if self.file_types.is_empty() {
            FILE_TYPE_GROUPS
                .iter()
                .flat_map(|(_, exts)| exts.iter().map(|ext| (*ext).to_string()))
                .collect()
        } else {
            self.file_types
                .iter()
                .flat_map(|entry| {
                    let entry = entry.trim().trim_start_matches('.').to_lowercase();
                    FILE_TYPE_GROUPS
                        .iter()
                        .find(|(group, _)| *group == entry)
                        .map_or_else(
                            || vec![entry.clone()],
                            |(_, exts)| exts.iter().map(|ext| (*ext).to_string()).collect(),
                        )
                })
                .collect()
        };
        extensions.sort();
        extensions.dedup();
        extensions
    }

    pub fn accepts(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
            return false;
        };
        let ext = ext.to_lowercase();
        self.allowed_extensions().iter().any(|allowed| *allowed == ext)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct OcrSettings {
    pub tesseract_path: String,
    pub pdftoppm_path: String,
    pub rasterize_dpi: u32,
    pub neural_enabled: bool,
    pub neural_endpoint: Option<String>,
    pub language_hints: Vec<String>,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            tesseract_path: "tesseract".to_string(),
            pdftoppm_path: "pdftoppm".to_string(),
            rasterize_dpi: 300,
            neural_enabled: false,
            neural_endpoint: None,
            language_hints: vec!["deu".to_string(), "eng".to_string()],
        }
    }
}

/// Tunable heuristics and capacities for ingestion runs.
#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct IngestionSettings {
    pub worker_count: usize,
    pub min_native_text_chars: usize,
    pub handwriting_edge_density_min: f64,
    pub handwriting_variance_min: f64,
    pub historical_variance_max: f64,
    pub aged_tint_min: f64,
    pub low_quality_dpi_max: u32,
    pub min_acceptable_confidence: f64,
    pub neural_batch_capacity: usize,
    pub classic_batch_capacity: usize,
    pub classic_parallelism: Option<usize>,
    pub batch_max_wait_ms: u64,
    pub ocr_job_timeout_secs: u64,
    pub match_inner_concepts: bool,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            min_native_text_chars: 100,
            handwriting_edge_density_min: 0.15,
            handwriting_variance_min: 2_000.0,
            historical_variance_max: 1_000.0,
            aged_tint_min: 0.12,
            low_quality_dpi_max: 150,
            min_acceptable_confidence: 0.5,
            neural_batch_capacity: 8,
            classic_batch_capacity: 4,
            classic_parallelism: None,
            batch_max_wait_ms: 250,
            ocr_job_timeout_secs: 120,
            match_inner_concepts: false,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default = "default_surreal_address")]
    pub surrealdb_address: String,
    #[serde(default = "default_surreal_root")]
    pub surrealdb_username: String,
    #[serde(default = "default_surreal_root")]
    pub surrealdb_password: String,
    #[serde(default = "default_surreal_scope")]
    pub surrealdb_namespace: String,
    #[serde(default = "default_surreal_scope")]
    pub surrealdb_database: String,
    #[serde(default = "default_ontology_dir")]
    pub ontology_dir: String,
    #[serde(default)]
    pub directories: Vec<DirectoryConfig>,
    #[serde(default)]
    pub ocr: OcrSettings,
    #[serde(default)]
    pub ingestion: IngestionSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: default_storage_kind(),
            surrealdb_address: default_surreal_address(),
            surrealdb_username: default_surreal_root(),
            surrealdb_password: default_surreal_root(),
            surrealdb_namespace: default_surreal_scope(),
            surrealdb_database: default_surreal_scope(),
            ontology_dir: default_ontology_dir(),
            directories: Vec::new(),
            ocr: OcrSettings::default(),
            ingestion: IngestionSettings::default(),
        }
    }
}

fn default_surreal_address() -> String {
    "ws://127.0.0.1:8000".to_string()
}

fn default_surreal_root() -> String {
    "root".to_string()
}

fn default_surreal_scope() -> String {
    "docindex".to_string()
}

fn default_ontology_dir() -> String {
    "./ontologies".to_string()
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default().separator("__"))
        .build()?;

    config.try_deserialize()
}
