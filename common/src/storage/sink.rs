//! The index the pipeline hands finished documents to.
//!
//! Documents are keyed by [`ContentHash`]. A document may be reachable from several paths: the
//! primary `path` plus `aliases`. Deleting or changing a file releases that path's claim on the
//! document; the document itself is tombstoned once no path refers to it.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, warn};

use crate::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            content_hash::ContentHash, document::Document, document_record::DocumentRecord,
            StoredObject,
        },
    },
};

#[async_trait]
pub trait IndexSink: Send + Sync {
    async fn upsert(&self, document: &Document) -> Result<(), AppError>;

    async fn exists(&self, hash: &ContentHash) -> Result<bool, AppError>;

    async fn fetch(&self, hash: &ContentHash) -> Result<Option<Document>, AppError>;

    /// Hash of the document currently indexed for `path`, if any.
    async fn hash_for_path(&self, path: &str) -> Result<Option<ContentHash>, AppError>;

    /// Attaches `path` to an existing document and returns the updated document.
    async fn record_alias(
        &self,
        hash: &ContentHash,
        path: &str,
    ) -> Result<Option<Document>, AppError>;

    /// Releases `path` from the document. Returns `true` when the document was removed.
    async fn tombstone(&self, hash: &ContentHash, path: &str) -> Result<bool, AppError>;
}

#[derive(Default)]
struct MemoryState {
    documents: HashMap<ContentHash, Document>,
    paths: HashMap<String, ContentHash>,
}

/// In-process index, used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryIndexSink {
    state: RwLock<MemoryState>,
}

impl MemoryIndexSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn documents(&self) -> Vec<Document> {
        let state = self.state.read().await;
        let mut documents: Vec<Document> = state.documents.values().cloned().collect();
        documents.sort_by(|a, b| a.id.cmp(&b.id));
        documents
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.documents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl IndexSink for MemoryIndexSink {
    async fn upsert(&self, document: &Document) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        for path in document.all_paths() {
            state.paths.insert(path.to_string(), document.id.clone());
        }
        state
            .documents
            .insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn exists(&self, hash: &ContentHash) -> Result<bool, AppError> {
        Ok(self.state.read().await.documents.contains_key(hash))
    }

    async fn fetch(&self, hash: &ContentHash) -> Result<Option<Document>, AppError> {
        Ok(self.state.read().await.documents.get(hash).cloned())
    }

    async fn hash_for_path(&self, path: &str) -> Result<Option<ContentHash>, AppError> {
        Ok(self.state.read().await.paths.get(path).cloned())
    }

    async fn record_alias(
        &self,
        hash: &ContentHash,
        path: &str,
    ) -> Result<Option<Document>, AppError> {
        let mut state = self.state.write().await;
        let Some(document) = state.documents.get_mut(hash) else {
            return Ok(None);
        };
        document.add_alias(path);
        let updated = document.clone();
        state.paths.insert(path.to_string(), hash.clone());
        Ok(Some(updated))
    }

    async fn tombstone(&self, hash: &ContentHash, path: &str) -> Result<bool, AppError> {
        let mut state = self.state.write().await;
        if state.paths.get(path) == Some(hash) {
            state.paths.remove(path);
        }
        let Some(document) = state.documents.get_mut(hash) else {
            return Ok(false);
        };
        if document.release_path(path) {
            state.documents.remove(hash);
            return Ok(true);
        }
        Ok(false)
    }
}

/// Compare-and-swap rounds for releasing a path before the document counts as contended.
const RELEASE_ATTEMPTS: usize = 16;

/// Backoff settings for sink writes before a failure is treated as a lost connection.
#[derive(Debug, Clone)]
pub struct SinkRetry {
    pub attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for SinkRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 800,
        }
    }
}

/// Index stored in the `document` table of SurrealDB.
pub struct SurrealIndexSink {
    db: Arc<SurrealDbClient>,
    retry: SinkRetry,
}

impl SurrealIndexSink {
    pub async fn new(db: Arc<SurrealDbClient>, retry: SinkRetry) -> Result<Self, AppError> {
        db.ensure_initialized().await?;
        Ok(Self { db, retry })
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, action: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let strategy = ExponentialBackoff::from_millis(self.retry.initial_backoff_ms.max(1))
            .max_delay(Duration::from_millis(self.retry.max_backoff_ms))
            .map(jitter)
            .take(self.retry.attempts.saturating_sub(1));

        Retry::spawn(strategy, action).await.map_err(|err| {
            warn!(operation, error = %err, "index sink operation failed after retries");
            match err {
                AppError::Database(inner) => AppError::Sink(format!("{operation}: {inner}")),
                other => other,
            }
        })
    }

    async fn record_for_path(&self, path: &str) -> Result<Option<DocumentRecord>, AppError> {
        let path = path.to_string();
        self.with_retry("hash_for_path", || {
            let path = path.clone();
            async move {
                let mut response = self
                    .db
                    .query(
                        "SELECT * FROM type::table($table) WHERE path = $path OR aliases CONTAINS $path LIMIT 1",
                    )
                    .bind(("table", DocumentRecord::table_name()))
                    .bind(("path", path))
                    .await?;
                let records: Vec<DocumentRecord> = response.take(0)?;
                Ok::<_, AppError>(records.into_iter().next())
            }
        })
        .await
    }

    /// Writes `after` (or deletes the record when `None`) only if the stored paths still match
    /// `before`. Returns `false` when another writer changed them first.
    async fn swap_paths(
        &self,
        before: &Document,
        after: Option<&Document>,
    ) -> Result<bool, AppError> {
        let query = match after {
            Some(_) => {
                "UPDATE type::thing($table, $id) SET path = $path, aliases = $aliases WHERE path = $old_path AND aliases = $old_aliases RETURN AFTER"
            }
            None => {
                "DELETE type::thing($table, $id) WHERE path = $old_path AND aliases = $old_aliases RETURN BEFORE"
            }
        };
        let (path, aliases) = after.map_or_else(
            || (String::new(), Vec::new()),
            |document| (document.path.clone(), document.aliases.clone()),
        );

        self.with_retry("tombstone", || {
            let path = path.clone();
            let aliases = aliases.clone();
            async move {
                let mut response = self
                    .db
                    .query(query)
                    .bind(("table", DocumentRecord::table_name()))
                    .bind(("id", before.id.as_str().to_string()))
                    .bind(("old_path", before.path.clone()))
                    .bind(("old_aliases", before.aliases.clone()))
                    .bind(("path", path))
                    .bind(("aliases", aliases))
                    .await?;
                let records: Vec<DocumentRecord> = response.take(0)?;
                Ok::<_, AppError>(!records.is_empty())
            }
        })
        .await
    }
}

#[async_trait]
impl IndexSink for SurrealIndexSink {
    async fn upsert(&self, document: &Document) -> Result<(), AppError> {
        let record = DocumentRecord::from_document(document)?;
        self.with_retry("upsert", || {
            let record = record.clone();
            async move {
                self.db.upsert_item(record).await?;
                Ok::<_, AppError>(())
            }
        })
        .await?;
        debug!(hash = %document.id.short(), path = %document.path, "document upserted");
        Ok(())
    }

    async fn exists(&self, hash: &ContentHash) -> Result<bool, AppError> {
        Ok(self.fetch(hash).await?.is_some())
    }

    async fn fetch(&self, hash: &ContentHash) -> Result<Option<Document>, AppError> {
        let record = self
            .with_retry("fetch", || async {
                Ok::<_, AppError>(self.db.get_item::<DocumentRecord>(hash.as_str()).await?)
            })
            .await?;
        record.map(DocumentRecord::into_document).transpose()
    }

    async fn hash_for_path(&self, path: &str) -> Result<Option<ContentHash>, AppError> {
        self.record_for_path(path)
            .await?
            .map(|record| ContentHash::from_hex(record.id))
            .transpose()
    }

    async fn record_alias(
        &self,
        hash: &ContentHash,
        path: &str,
    ) -> Result<Option<Document>, AppError> {
        let path = path.to_string();
        let updated: Option<DocumentRecord> = self
            .with_retry("record_alias", || {
                let path = path.clone();
                async move {
                    let mut response = self
                        .db
                        .query(
                            "UPDATE type::thing($table, $id) SET aliases = IF path = $path THEN aliases ELSE array::union(aliases, [$path]) END RETURN AFTER",
                        )
                        .bind(("table", DocumentRecord::table_name()))
                        .bind(("id", hash.as_str().to_string()))
                        .bind(("path", path))
                        .await?;
                    let records: Vec<DocumentRecord> = response.take(0)?;
                    Ok::<_, AppError>(records.into_iter().next())
                }
            })
            .await?;
        updated.map(DocumentRecord::into_document).transpose()
    }

    async fn tombstone(&self, hash: &ContentHash, path: &str) -> Result<bool, AppError> {
        for _ in 0..RELEASE_ATTEMPTS {
            let Some(document) = self.fetch(hash).await? else {
                return Ok(false);
            };
            if !document.has_path(path) {
                return Ok(false);
            }

            let mut released = document.clone();
            let removed = released.release_path(path);
            let after = (!removed).then_some(&released);
            if self.swap_paths(&document, after).await? {
                if removed {
                    debug!(hash = %hash.short(), path, "document tombstoned");
                }
                return Ok(removed);
            }
            debug!(hash = %hash.short(), path, "paths changed concurrently, retrying release");
        }
        Err(AppError::Sink(format!(
            "tombstone: paths of {} kept changing",
            hash.short()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::document::fixtures::document;
    use uuid::Uuid;

    async fn surreal_sink() -> SurrealIndexSink {
        let db = SurrealDbClient::memory("sink_test", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");
        SurrealIndexSink::new(Arc::new(db), SinkRetry::default())
            .await
            .expect("sink")
    }

    async fn exercise_sink(sink: &dyn IndexSink) {
        let doc = document('d', "/docs/a.pdf");
        assert!(!sink.exists(&doc.id).await.expect("exists"));

        sink.upsert(&doc).await.expect("upsert");
        assert!(sink.exists(&doc.id).await.expect("exists"));
        assert_eq!(
            sink.hash_for_path("/docs/a.pdf").await.expect("lookup"),
            Some(doc.id.clone())
        );

        let aliased = sink
            .record_alias(&doc.id, "/docs/copy.pdf")
            .await
            .expect("alias")
            .expect("document present");
        assert_eq!(aliased.aliases, vec!["/docs/copy.pdf".to_string()]);
        assert_eq!(
            sink.hash_for_path("/docs/copy.pdf").await.expect("lookup"),
            Some(doc.id.clone())
        );

        assert!(!sink.tombstone(&doc.id, "/docs/a.pdf").await.expect("release"));
        let remaining = sink.fetch(&doc.id).await.expect("fetch").expect("present");
        assert_eq!(remaining.path, "/docs/copy.pdf");
        assert!(sink.hash_for_path("/docs/a.pdf").await.expect("lookup").is_none());

        assert!(sink
            .tombstone(&doc.id, "/docs/copy.pdf")
            .await
            .expect("tombstone"));
        assert!(!sink.exists(&doc.id).await.expect("exists"));
    }

    #[tokio::test]
    async fn memory_sink_tracks_paths_and_tombstones() {
        let sink = MemoryIndexSink::new();
        exercise_sink(&sink).await;
        assert!(sink.is_empty().await);
    }

    #[tokio::test]
    async fn surreal_sink_tracks_paths_and_tombstones() {
        let sink = surreal_sink().await;
        exercise_sink(&sink).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_aliases_survive_a_release() {
        let sink = Arc::new(surreal_sink().await);
        let mut doc = document('f', "/docs/a.pdf");
        doc.aliases.push("/docs/keep.pdf".to_string());
        sink.upsert(&doc).await.expect("upsert");

        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..8 {
            let sink = Arc::clone(&sink);
            let hash = doc.id.clone();
            tasks.spawn(async move {
                sink.record_alias(&hash, &format!("/docs/copy-{n}.pdf"))
                    .await
                    .map(|updated| updated.is_none())
            });
        }
        let release = {
            let sink = Arc::clone(&sink);
            let hash = doc.id.clone();
            tokio::spawn(async move { sink.tombstone(&hash, "/docs/a.pdf").await })
        };

        while let Some(result) = tasks.join_next().await {
            assert!(!result.expect("alias task").expect("alias"));
        }
        assert!(!release.await.expect("release task").expect("release"));

        let remaining = sink.fetch(&doc.id).await.expect("fetch").expect("present");
        assert!(!remaining.has_path("/docs/a.pdf"));
        assert!(remaining.has_path("/docs/keep.pdf"));
        for n in 0..8 {
            assert!(remaining.has_path(&format!("/docs/copy-{n}.pdf")));
        }
        assert_eq!(remaining.aliases.len(), 8);
    }

    #[tokio::test]
    async fn alias_for_unknown_hash_is_none() {
        let sink = MemoryIndexSink::new();
        let doc = document('e', "/docs/e.pdf");
        assert!(sink
            .record_alias(&doc.id, "/docs/other.pdf")
            .await
            .expect("alias")
            .is_none());
        assert!(!sink.tombstone(&doc.id, "/docs/e.pdf").await.expect("tombstone"));
    }
}
