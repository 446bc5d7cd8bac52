mod scan;

use std::sync::Arc;

use common::{
    storage::{
        db::SurrealDbClient,
        sink::{IndexSink, MemoryIndexSink, SinkRetry, SurrealIndexSink},
        types::ontology::OntologySnapshot,
    },
    utils::config::{get_config, AppConfig, StorageKind},
};
use ingestion_pipeline::{ocr::stats::StatisticsSnapshot, IngestionPipeline};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;
    let sink = open_sink(&config).await?;

    let (ontologies, ontology_errors) = OntologySnapshot::load_dir(&config.ontology_dir).await;
    for err in &ontology_errors {
        warn!(error = %err, "skipping ontology");
    }
    info!(
        ontology_dir = %config.ontology_dir,
        concepts = ontologies.concepts().len(),
        "ontologies loaded"
    );

    let pipeline = IngestionPipeline::new(sink, &config, ontologies);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing files already in flight");
                cancel.cancel();
            }
        }
    });

    let mut stats = StatisticsSnapshot::default();
    let result = run(&pipeline, &config, &cancel, &mut stats).await;

    info!(
        processed = stats.processed,
        ocr_applied = stats.ocr_applied,
        handwriting_detected = stats.handwriting_detected,
        failures = stats.failures,
        engines = ?stats.engine_used,
        preprocessing = ?stats.preprocessing,
        unavailable_engines = ?stats.unavailable_engines,
        "ingestion finished"
    );
    pipeline.shutdown().await;

    result
}

async fn open_sink(config: &AppConfig) -> Result<Arc<dyn IndexSink>, Box<dyn std::error::Error>> {
    match config.storage {
        StorageKind::Memory => {
            info!("using in-memory index");
            Ok(Arc::new(MemoryIndexSink::new()))
        }
        StorageKind::Surreal => {
            let db = Arc::new(
                SurrealDbClient::new(
                    &config.surrealdb_address,
                    &config.surrealdb_username,
                    &config.surrealdb_password,
                    &config.surrealdb_namespace,
                    &config.surrealdb_database,
                )
                .await?,
            );
            info!(address = %config.surrealdb_address, "connected to SurrealDB index");
            Ok(Arc::new(SurrealIndexSink::new(db, SinkRetry::default()).await?))
        }
    }
}

async fn run(
    pipeline: &IngestionPipeline,
    config: &AppConfig,
    cancel: &CancellationToken,
    stats: &mut StatisticsSnapshot,
) -> Result<(), Box<dyn std::error::Error>> {
    for directory in config.directories.iter().filter(|dir| dir.enabled) {
        if cancel.is_cancelled() {
            break;
        }

        let events = match scan::collect_events(directory).await {
            Ok(events) => events,
            Err(err) => {
                error!(directory_id = %directory.id, error = %err, "directory scan failed");
                continue;
            }
        };
        info!(
            directory_id = %directory.id,
            path = %directory.path,
            files = events.len(),
            "directory scanned"
        );

        // Statistics reset with every directory run; keep a running total.
        let summary = pipeline
            .run_directory(&directory.id, events, cancel.clone())
            .await;
        stats.merge(&pipeline.statistics().await);
        let summary = summary?;
        info!(
            directory_id = %directory.id,
            indexed = summary.indexed,
            skipped_unchanged = summary.skipped_unchanged,
            duplicates = summary.duplicates,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "directory finished"
        );
    }
    Ok(())
}
