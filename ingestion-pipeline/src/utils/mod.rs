pub mod file_kind;
pub mod file_text_extraction;
pub mod hashing;
pub mod image_parsing;
pub mod office;
pub mod pdf_ingestion;
