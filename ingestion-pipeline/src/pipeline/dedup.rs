use std::{collections::HashMap, sync::Arc};

use common::storage::types::{content_hash::ContentHash, document::Document};
use tokio::sync::{Mutex, OnceCell};

/// Result of one full pipeline run, shared with every ingest of the same content.
pub type SharedOutcome = Result<Document, String>;

/// At most one pipeline run per content hash; concurrent callers await the same cell.
#[derive(Default)]
pub struct InFlight {
    runs: Mutex<HashMap<ContentHash, Arc<OnceCell<SharedOutcome>>>>,
}

impl InFlight {
    /// The cell for `hash`, created when no run is in flight.
    pub async fn slot(&self, hash: &ContentHash) -> Arc<OnceCell<SharedOutcome>> {
        let mut runs = self.runs.lock().await;
        Arc::clone(runs.entry(hash.clone()).or_default())
    }

    /// Forgets the run once it is settled so later ingests consult the index again.
    pub async fn release(&self, hash: &ContentHash, cell: &Arc<OnceCell<SharedOutcome>>) {
        let mut runs = self.runs.lock().await;
        if runs
            .get(hash)
            .is_some_and(|current| Arc::ptr_eq(current, cell) && current.initialized())
        {
            runs.remove(hash);
        }
    }

    pub async fn len(&self) -> usize {
        self.runs.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::hashing::hash_bytes;

    #[tokio::test]
    async fn callers_share_a_cell_until_release() {
        let in_flight = InFlight::default();
        let hash = hash_bytes(b"scan");
        let first = in_flight.slot(&hash).await;
        let second = in_flight.slot(&hash).await;
        assert!(Arc::ptr_eq(&first, &second));

        // Unsettled runs stay registered.
        in_flight.release(&hash, &first).await;
        assert_eq!(in_flight.len().await, 1);

        first
            .get_or_init(|| async { Err("unreadable".to_string()) })
            .await;
        in_flight.release(&hash, &second).await;
        assert_eq!(in_flight.len().await, 0);

        let third = in_flight.slot(&hash).await;
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
