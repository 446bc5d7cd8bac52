mod config;
mod context;
mod dedup;
mod services;
mod stages;
mod state;

pub use config::{IngestionConfig, IngestionTuning};
#[allow(clippy::module_name_repetitions)]
pub use services::{DefaultPipelineServices, PipelineServices};

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    error::AppError,
    storage::{
        sink::IndexSink,
        types::{
            content_hash::ContentHash,
            document::Document,
            file_reference::{FileEvent, FileReference},
            ontology::OntologySnapshot,
        },
    },
    utils::config::AppConfig,
};
use futures::{stream, StreamExt};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::{
    context::PipelineContext,
    dedup::{InFlight, SharedOutcome},
    stages::{
        assemble, extract, extract_metadata, fail, hash_content, index, map_guard_error,
        match_concepts, record_alias, skip_unchanged, Extracted,
    },
    state::{discovered, removal, Hashed, IngestionMachine},
};
use crate::ocr::stats::{OcrStatistics, StatisticsSnapshot};

/// Terminal result of ingesting one file.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Indexed(Document),
    /// The content was already indexed; the file's path is now one of its aliases.
    Duplicate(Document),
    SkippedUnchanged(ContentHash),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Ingested(IngestOutcome),
    Removed(ContentHash),
    /// A deletion for a path the index never held.
    NotIndexed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub indexed: usize,
    pub skipped_unchanged: usize,
    pub duplicates: usize,
    pub removed: usize,
    pub not_indexed: usize,
    pub failed: usize,
    pub failures_by_directory: BTreeMap<String, usize>,
    pub cancelled: bool,
}

impl RunSummary {
    /// Events that reached a terminal state other than failure.
    pub fn processed(&self) -> usize {
        self.indexed
            .saturating_add(self.skipped_unchanged)
            .saturating_add(self.duplicates)
            .saturating_add(self.removed)
            .saturating_add(self.not_indexed)
    }

    fn record(&mut self, directory_id: &str, result: &Result<EventOutcome, AppError>) {
        let counter = match result {
            Ok(EventOutcome::Ingested(IngestOutcome::Indexed(_))) => &mut self.indexed,
            Ok(EventOutcome::Ingested(IngestOutcome::Duplicate(_))) => &mut self.duplicates,
            Ok(EventOutcome::Ingested(IngestOutcome::SkippedUnchanged(_))) => {
                &mut self.skipped_unchanged
            }
            Ok(EventOutcome::Removed(_)) => &mut self.removed,
            Ok(EventOutcome::NotIndexed) => &mut self.not_indexed,
            Err(_) => {
                let per_directory = self
                    .failures_by_directory
                    .entry(directory_id.to_string())
                    .or_default();
                *per_directory = per_directory.saturating_add(1);
                &mut self.failed
            }
        };
        *counter = counter.saturating_add(1);
    }
}

/// What the leading run of a content hash left behind for its own caller.
#[derive(Default)]
struct Leadership {
    produced: bool,
    error: Option<AppError>,
}

#[allow(clippy::module_name_repetitions)]
pub struct IngestionPipeline {
    sink: Arc<dyn IndexSink>,
    pipeline_config: IngestionConfig,
    services: Arc<dyn PipelineServices>,
    ontologies: RwLock<Arc<OntologySnapshot>>,
    stats: Arc<OcrStatistics>,
    in_flight: InFlight,
}

impl IngestionPipeline {
    /// Wires the tesseract and neural adapters from `config`; must run inside a tokio runtime.
    pub fn new(sink: Arc<dyn IndexSink>, config: &AppConfig, ontologies: OntologySnapshot) -> Self {
        let tuning = IngestionTuning::from_settings(&config.ingestion, &config.ocr);
        let stats = Arc::new(OcrStatistics::default());
        let services = DefaultPipelineServices::new(&config.ocr, &tuning, Arc::clone(&stats));

        Self::from_parts(
            sink,
            IngestionConfig::from_tuning(tuning),
            Arc::new(services),
            ontologies,
            stats,
        )
    }

    pub fn with_services(
        sink: Arc<dyn IndexSink>,
        pipeline_config: IngestionConfig,
        services: Arc<dyn PipelineServices>,
        ontologies: OntologySnapshot,
    ) -> Self {
        Self::from_parts(
            sink,
            pipeline_config,
            services,
            ontologies,
            Arc::new(OcrStatistics::default()),
        )
    }

    fn from_parts(
        sink: Arc<dyn IndexSink>,
        pipeline_config: IngestionConfig,
        services: Arc<dyn PipelineServices>,
        ontologies: OntologySnapshot,
        stats: Arc<OcrStatistics>,
    ) -> Self {
        Self {
            sink,
            pipeline_config,
            services,
            ontologies: RwLock::new(Arc::new(ontologies)),
            stats,
            in_flight: InFlight::default(),
        }
    }

    /// Swaps the ontology snapshot used by runs that start afterwards.
    pub async fn replace_ontologies(&self, ontologies: OntologySnapshot) {
        *self.ontologies.write().await = Arc::new(ontologies);
    }

    pub async fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot().await
    }

    /// Drains queued OCR work. The pipeline accepts no OCR jobs afterwards.
    pub async fn shutdown(&self) {
        self.services.shutdown().await;
    }

    async fn snapshot(&self) -> Arc<OntologySnapshot> {
        Arc::clone(&*self.ontologies.read().await)
    }

    fn duration_millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }

    pub async fn ingest(&self, reference: FileReference) -> Result<IngestOutcome, AppError> {
        let snapshot = self.snapshot().await;
        self.ingest_with(&reference, &snapshot).await
    }

    pub async fn handle_event(&self, event: FileEvent) -> Result<EventOutcome, AppError> {
        let snapshot = self.snapshot().await;
        self.handle_event_with(event, &snapshot).await
    }

    async fn handle_event_with(
        &self,
        event: FileEvent,
        snapshot: &OntologySnapshot,
    ) -> Result<EventOutcome, AppError> {
        match event {
            FileEvent::Created(reference) | FileEvent::Modified(reference) => self
                .ingest_with(&reference, snapshot)
                .await
                .map(EventOutcome::Ingested),
            FileEvent::Deleted(reference) => self.remove(&reference).await,
        }
    }

    /// Processes `events` with `worker_count` files in flight.
    ///
    /// Cancelling `cancel` stops intake; files already started run to completion. A fatal
    /// sink error ends the run with that error; any other failure is counted and skipped.
    #[tracing::instrument(skip_all, fields(directory_id = %directory_id, events = events.len()))]
    pub async fn run_directory(
        &self,
        directory_id: &str,
        events: Vec<FileEvent>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, AppError> {
        self.stats.reset().await;
        self.services.begin_run().await;
        let snapshot = self.snapshot().await;
        let workers = self.pipeline_config.tuning.worker_count.max(1);
        let started = Instant::now();

        let mut results = std::pin::pin!(stream::iter(events)
            .take_until(cancel.clone().cancelled_owned())
            .map(|event| {
                let snapshot = snapshot.as_ref();
                async move {
                    let event_directory = event.reference().directory_id.clone();
                    let path = event.reference().path_key();
                    let result = self.handle_event_with(event, snapshot).await;
                    (event_directory, path, result)
                }
            })
            .buffer_unordered(workers));

        let mut summary = RunSummary::default();
        while let Some((event_directory, path, result)) = results.next().await {
            match result {
                Err(err) if err.is_fatal() => {
                    error!(
                        directory_id = %directory_id,
                        path = %path,
                        error = %err,
                        "index sink failed, aborting run"
                    );
                    return Err(err);
                }
                result => {
                    if let Err(err) = &result {
                        warn!(path = %path, error = %err, "file failed, continuing");
                    }
                    summary.record(&event_directory, &result);
                }
            }
        }
        summary.cancelled = cancel.is_cancelled();

        info!(
            directory_id = %directory_id,
            indexed = summary.indexed,
            skipped_unchanged = summary.skipped_unchanged,
            duplicates = summary.duplicates,
            removed = summary.removed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            total_ms = Self::duration_millis(started.elapsed()),
            "directory run finished"
        );
        Ok(summary)
    }

    #[tracing::instrument(
        skip_all,
        fields(path = %reference.path.display(), directory_id = %reference.directory_id)
    )]
    async fn ingest_with(
        &self,
        reference: &FileReference,
        snapshot: &OntologySnapshot,
    ) -> Result<IngestOutcome, AppError> {
        let result = self.drive_pipeline(reference, snapshot).await;
        match &result {
            Ok(_) => self.stats.record_processed(),
            Err(_) => self.stats.record_failure(),
        }
        result
    }

    async fn drive_pipeline(
        &self,
        reference: &FileReference,
        snapshot: &OntologySnapshot,
    ) -> Result<IngestOutcome, AppError> {
        let mut ctx = PipelineContext::new(
            reference,
            &self.pipeline_config,
            self.services.as_ref(),
            self.sink.as_ref(),
            snapshot,
            &self.stats,
        );

        let machine = discovered();
        let machine = hash_content(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let hash = ctx.hash()?.clone();

        let previous = match self.sink.hash_for_path(&ctx.path_key).await {
            Ok(previous) => previous,
            Err(err) => return Err(ctx.abort(fail(machine.abort(), err))),
        };
        match previous {
            Some(previous) if previous == hash => {
                let _machine = skip_unchanged(machine, &ctx).map_err(|err| ctx.abort(err))?;
                return Ok(IngestOutcome::SkippedUnchanged(hash));
            }
            Some(previous) => {
                if let Err(err) = self.sink.tombstone(&previous, &ctx.path_key).await {
                    return Err(ctx.abort(fail(machine.abort(), err)));
                }
                info!(
                    path = %ctx.path_key,
                    previous = %previous.short(),
                    hash = %hash.short(),
                    "content changed, released previous version"
                );
            }
            None => {}
        }

        let cell = self.in_flight.slot(&hash).await;
        let mut pending = Some(machine);
        let mut leadership = Leadership::default();
        let shared = cell
            .get_or_init(|| self.lead(&mut pending, &mut ctx, &mut leadership))
            .await
            .clone();
        self.in_flight.release(&hash, &cell).await;

        if let Some(err) = leadership.error {
            return Err(err);
        }
        match (shared, pending) {
            (Ok(document), _) if leadership.produced => Ok(IngestOutcome::Indexed(document)),
            (Ok(document), Some(machine)) => self.attach_alias(machine, &mut ctx, document).await,
            (Ok(_), None) => Err(ctx.abort(AppError::InternalError(
                "ingestion machine consumed without a result".into(),
            ))),
            (Err(reason), _) => Err(ctx.abort(AppError::Processing(format!(
                "concurrent ingest of identical content failed: {reason}"
            )))),
        }
    }

    /// Runs the full pipeline unless the content is already indexed.
    async fn lead(
        &self,
        pending: &mut Option<IngestionMachine<(), Hashed>>,
        ctx: &mut PipelineContext<'_>,
        leadership: &mut Leadership,
    ) -> SharedOutcome {
        let outcome = match ctx.hash().cloned() {
            Ok(hash) => match self.sink.fetch(&hash).await {
                Ok(Some(existing)) => return Ok(existing),
                Ok(None) => match pending.take() {
                    Some(machine) => self.complete(machine, ctx).await,
                    None => Err(AppError::InternalError(
                        "ingestion machine already consumed".into(),
                    )),
                },
                Err(err) => match pending.take() {
                    Some(machine) => Err(ctx.abort(fail(machine.abort(), err))),
                    None => Err(ctx.abort(err)),
                },
            },
            Err(err) => Err(err),
        };

        match outcome {
            Ok(document) => {
                leadership.produced = true;
                Ok(document)
            }
            Err(err) => {
                let reason = err.to_string();
                leadership.error = Some(err);
                Err(reason)
            }
        }
    }

    async fn complete(
        &self,
        machine: IngestionMachine<(), Hashed>,
        ctx: &mut PipelineContext<'_>,
    ) -> Result<Document, AppError> {
        let pipeline_started = Instant::now();

        let stage_start = Instant::now();
        let extracted = extract(machine, ctx).await.map_err(|err| ctx.abort(err))?;
        let ocr_applied = matches!(extracted, Extracted::Ocr(_));
        let extract_duration = stage_start.elapsed();

        let stage_start = Instant::now();
        let machine = extract_metadata(extracted, ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let machine = match_concepts(machine, ctx).map_err(|err| ctx.abort(err))?;
        let machine = assemble(machine, ctx).map_err(|err| ctx.abort(err))?;
        let enrich_duration = stage_start.elapsed();

        let stage_start = Instant::now();
        let (_machine, document) = index(machine, ctx).await.map_err(|err| ctx.abort(err))?;
        let index_duration = stage_start.elapsed();

        info!(
            path = %ctx.path_key,
            hash = %document.id.short(),
            ocr_applied,
            confidence = document.ocr_confidence,
            concepts = document.concepts.len(),
            total_ms = Self::duration_millis(pipeline_started.elapsed()),
            extract_ms = Self::duration_millis(extract_duration),
            enrich_ms = Self::duration_millis(enrich_duration),
            index_ms = Self::duration_millis(index_duration),
            "ingestion pipeline finished"
        );
        Ok(document)
    }

    async fn attach_alias(
        &self,
        machine: IngestionMachine<(), Hashed>,
        ctx: &mut PipelineContext<'_>,
        document: Document,
    ) -> Result<IngestOutcome, AppError> {
        let document = if document.has_path(&ctx.path_key) {
            document
        } else {
            match self.sink.record_alias(&document.id, &ctx.path_key).await {
                Ok(Some(updated)) => updated,
                Ok(None) => {
                    let err = AppError::NotFound(format!(
                        "document {} vanished before alias {} was recorded",
                        document.id, ctx.path_key
                    ));
                    return Err(ctx.abort(fail(machine.abort(), err)));
                }
                Err(err) => return Err(ctx.abort(fail(machine.abort(), err))),
            }
        };
        let _machine = record_alias(machine).map_err(|err| ctx.abort(err))?;
        info!(
            path = %ctx.path_key,
            hash = %document.id.short(),
            primary = %document.path,
            "duplicate content, recorded alias"
        );
        Ok(IngestOutcome::Duplicate(document))
    }

    #[tracing::instrument(
        skip_all,
        fields(path = %reference.path.display(), directory_id = %reference.directory_id)
    )]
    async fn remove(&self, reference: &FileReference) -> Result<EventOutcome, AppError> {
        let path = reference.path_key();
        let machine = removal::tracked();

        let released = match self.sink.hash_for_path(&path).await {
            Ok(Some(hash)) => self
                .sink
                .tombstone(&hash, &path)
                .await
                .map(|document_removed| Some((hash, document_removed))),
            Ok(None) => Ok(None),
            Err(err) => Err(err),
        };

        match released {
            Ok(Some((hash, document_removed))) => {
                let _machine = machine
                    .remove()
                    .map_err(|(_, guard)| map_guard_error("remove", &guard))?;
                info!(
                    path = %path,
                    hash = %hash.short(),
                    document_removed,
                    "path removed from index"
                );
                Ok(EventOutcome::Removed(hash))
            }
            Ok(None) => {
                let _machine = machine
                    .skip()
                    .map_err(|(_, guard)| map_guard_error("skip", &guard))?;
                debug!(path = %path, "deleted path was never indexed");
                Ok(EventOutcome::NotIndexed)
            }
            Err(err) => {
                let _machine = machine
                    .abort()
                    .map_err(|(_, guard)| map_guard_error("abort", &guard))?;
                error!(path = %path, error = %err, "removal aborted");
                Err(err)
            }
        }
    }
}
