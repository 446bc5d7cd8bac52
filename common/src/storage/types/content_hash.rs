use std::fmt::{self, Write};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Hex length of a SHA-256 digest.
pub const CONTENT_HASH_LEN: usize = 64;

/// Identity of a document: the lowercase hex SHA-256 digest of its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    pub fn from_hex(hex: impl Into<String>) -> Result<Self, AppError> {
        let hex = hex.into().to_ascii_lowercase();
        if hex.len() != CONTENT_HASH_LEN || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AppError::Validation(format!(
                "content hash must be {CONTENT_HASH_LEN} hex characters, got '{hex}'"
            )));
        }
        Ok(Self(hex))
    }

    /// Renders a raw SHA-256 digest.
    pub fn from_digest(digest: &[u8]) -> Self {
        let mut hex = String::with_capacity(digest.len().saturating_mul(2));
        for byte in digest {
            // Writing into a String cannot fail.
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(value)
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.0
    }
}
