use common::storage::types::content_hash::ContentHash;
use sha2::{Digest, Sha256};

/// Block size fed to the hasher per update.
const HASH_BLOCK: usize = 8192;

/// Computes the content identity of `bytes`.
pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    for block in bytes.chunks(HASH_BLOCK) {
        hasher.update(block);
    }
    ContentHash::from_digest(hasher.finalize().as_slice())
}

/// Hashes on the blocking pool; large scans should not stall the runtime.
pub async fn hash_owned(bytes: bytes::Bytes) -> Result<ContentHash, common::error::AppError> {
    Ok(tokio::task::spawn_blocking(move || hash_bytes(&bytes)).await?)
}
