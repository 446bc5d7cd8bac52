use std::{collections::HashMap, sync::Arc, time::Duration};

use common::storage::types::document::OcrEngineKind;
use futures::{stream, StreamExt};
use tokio::{
    sync::{mpsc, oneshot, Mutex, RwLock},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use super::{recognize, stats::OcrStatistics, OcrExecutor, OcrJob, OcrResult};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub neural_capacity: usize,
    pub classic_capacity: usize,
    /// Concurrent classic jobs inside one batch.
    pub classic_parallelism: usize,
    pub max_wait: Duration,
    pub job_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            neural_capacity: 8,
            classic_capacity: 4,
            classic_parallelism: std::thread::available_parallelism()
                .map_or(1, std::num::NonZeroUsize::get),
            max_wait: Duration::from_millis(250),
            job_timeout: Duration::from_secs(120),
        }
    }
}

struct Pending {
    job: OcrJob,
    reply: oneshot::Sender<OcrResult>,
}

/// Collects OCR jobs into per-engine batches.
///
/// A lane dispatches once it holds `capacity` jobs or `max_wait` after its first job arrived.
/// The neural lane runs one batch at a time because the accelerator is a single shared device;
/// the classic lane runs up to `classic_parallelism` jobs of a batch at once.
pub struct BatchScheduler {
    lanes: RwLock<Option<HashMap<OcrEngineKind, mpsc::Sender<Pending>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct Lane {
    executor: Arc<dyn OcrExecutor>,
    capacity: usize,
    parallelism: usize,
    max_wait: Duration,
    job_timeout: Duration,
    stats: Arc<OcrStatistics>,
}

impl BatchScheduler {
    /// Spawns one lane per executor; must run inside a tokio runtime.
    pub fn start(
        executors: Vec<Arc<dyn OcrExecutor>>,
        config: &BatchConfig,
        stats: Arc<OcrStatistics>,
    ) -> Self {
        let mut senders = HashMap::new();
        let mut handles = Vec::new();

        for executor in executors {
            let kind = executor.kind();
            let (capacity, parallelism) = match kind {
                OcrEngineKind::Neural => (config.neural_capacity.max(1), config.neural_capacity.max(1)),
                OcrEngineKind::Classic => (
                    config.classic_capacity.max(1),
                    config.classic_parallelism.max(1),
                ),
            };
            let (tx, rx) = mpsc::channel(capacity.saturating_mul(4));
            let lane = Lane {
                executor,
                capacity,
                parallelism,
                max_wait: config.max_wait,
                job_timeout: config.job_timeout,
                stats: Arc::clone(&stats),
            };
            handles.push(tokio::spawn(lane.run(rx)));
            senders.insert(kind, tx);
        }

        Self {
            lanes: RwLock::new(Some(senders)),
            handles: Mutex::new(handles),
        }
    }

    /// Queues `job` on its engine's lane and waits for its result.
    pub async fn submit(&self, job: OcrJob) -> OcrResult {
        let kind = job.engine.kind;
        let handwriting = job.handwriting;
        let sender = {
            let lanes = self.lanes.read().await;
            lanes.as_ref().and_then(|lanes| lanes.get(&kind).cloned())
        };
        let Some(sender) = sender else {
            return OcrResult::failed(kind, handwriting, format!("no {kind} OCR lane is running"));
        };

        let (reply, response) = oneshot::channel();
        if sender.send(Pending { job, reply }).await.is_err() {
            return OcrResult::failed(kind, handwriting, "OCR scheduler has shut down");
        }
        // Lanes only drain on shutdown once every sender clone is gone.
        drop(sender);
        response
            .await
            .unwrap_or_else(|_| OcrResult::failed(kind, handwriting, "OCR lane dropped the job"))
    }

    /// Stops intake, lets every lane finish its queued jobs, then waits for the lanes.
    pub async fn shutdown(&self) {
        self.lanes.write().await.take();
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "OCR lane terminated abnormally");
            }
        }
        info!("OCR scheduler stopped");
    }
}

impl Lane {
    async fn run(self, mut rx: mpsc::Receiver<Pending>) {
        let kind = self.executor.kind();
        while let Some(first) = rx.recv().await {
            let mut batch = Vec::with_capacity(self.capacity);
            batch.push(first);
            let deadline = Instant::now() + self.max_wait;
            while batch.len() < self.capacity {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(pending)) => batch.push(pending),
                    Ok(None) | Err(_) => break,
                }
            }
            debug!(engine = %kind, size = batch.len(), "dispatching OCR batch");
            self.dispatch(batch).await;
        }
        debug!(engine = %kind, "OCR lane drained");
    }

    async fn dispatch(&self, batch: Vec<Pending>) {
        stream::iter(batch)
            .for_each_concurrent(self.parallelism, |pending| async move {
                let Pending { job, reply } = pending;
                let kind = self.executor.kind();
                let handwriting = job.handwriting;
                let executor = Arc::clone(&self.executor);
                let stats = Arc::clone(&self.stats);
                let timeout = self.job_timeout;
                let task = tokio::spawn(async move {
                    recognize(executor.as_ref(), &job, timeout, &stats).await
                });
                let result = task.await.unwrap_or_else(|err| {
                    warn!(engine = %kind, error = %err, "OCR job crashed");
                    OcrResult::failed(kind, handwriting, format!("OCR job crashed: {err}"))
                });
                // The submitter may have gone away; its result is simply dropped.
                let _ = reply.send(result);
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::{
        testing::{job, Behaviour, ScriptedExecutor},
        Confidence, EngineChoice, EngineProfile,
    };

    fn config(capacity: usize, max_wait_ms: u64) -> BatchConfig {
        BatchConfig {
            neural_capacity: capacity,
            classic_capacity: capacity,
            classic_parallelism: 2,
            max_wait: Duration::from_millis(max_wait_ms),
            job_timeout: Duration::from_millis(200),
        }
    }

    fn classic() -> EngineChoice {
        EngineChoice::classic(EngineProfile::Default)
    }

    #[tokio::test]
    async fn full_batch_dispatches_without_waiting() {
        let executor = Arc::new(ScriptedExecutor::new(
            OcrEngineKind::Classic,
            Behaviour::Text("ok", 0.9),
        ));
        let scheduler = BatchScheduler::start(
            vec![executor.clone() as Arc<dyn OcrExecutor>],
            &config(2, 60_000),
            Arc::new(OcrStatistics::default()),
        );

        let (a, b) = tokio::time::timeout(
            Duration::from_secs(5),
            futures::future::join(
                scheduler.submit(job(1, classic())),
                scheduler.submit(job(2, classic())),
            ),
        )
        .await
        .expect("batch should dispatch at capacity");

        assert_eq!(a.text, "ok");
        assert_eq!(b.text, "ok");
        let mut pages = executor.pages.lock().await.clone();
        pages.sort_unstable();
        assert_eq!(pages, vec![1, 2]);
    }

    #[tokio::test]
    async fn partial_batch_flushes_after_max_wait() {
        let executor = Arc::new(ScriptedExecutor::new(
            OcrEngineKind::Neural,
            Behaviour::Text("hand", 0.8),
        ));
        let scheduler = BatchScheduler::start(
            vec![executor.clone() as Arc<dyn OcrExecutor>],
            &config(8, 20),
            Arc::new(OcrStatistics::default()),
        );

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.submit(job(3, EngineChoice::neural())),
        )
        .await
        .expect("partial batch should flush");
        assert_eq!(result.engine_used, OcrEngineKind::Neural);
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn crashing_job_fails_alone() {
        let crashing = Arc::new(ScriptedExecutor::new(OcrEngineKind::Classic, Behaviour::Panic));
        let healthy = Arc::new(ScriptedExecutor::new(
            OcrEngineKind::Neural,
            Behaviour::Text("fine", 0.7),
        ));
        let scheduler = BatchScheduler::start(
            vec![
                crashing as Arc<dyn OcrExecutor>,
                healthy as Arc<dyn OcrExecutor>,
            ],
            &config(2, 10),
            Arc::new(OcrStatistics::default()),
        );

        let (crashed, fine) = futures::future::join(
            scheduler.submit(job(1, classic())),
            scheduler.submit(job(2, EngineChoice::neural())),
        )
        .await;
        assert_eq!(crashed.confidence, Confidence::ZERO);
        assert!(crashed.error.is_some());
        assert_eq!(fine.text, "fine");

        // The lane survives the panic.
        let again = scheduler.submit(job(4, classic())).await;
        assert!(again.error.is_some());
    }

    #[tokio::test]
    async fn hanging_job_times_out() {
        let scheduler = BatchScheduler::start(
            vec![Arc::new(ScriptedExecutor::new(OcrEngineKind::Classic, Behaviour::Hang))
                as Arc<dyn OcrExecutor>],
            &config(1, 10),
            Arc::new(OcrStatistics::default()),
        );
        let result = scheduler.submit(job(1, classic())).await;
        assert_eq!(result.confidence, Confidence::ZERO);
        assert!(result.error.is_some_and(|e| e.contains("timed out")));
    }

    #[tokio::test]
    async fn missing_lane_and_shutdown_yield_failed_results() {
        let scheduler = BatchScheduler::start(
            vec![Arc::new(ScriptedExecutor::new(
                OcrEngineKind::Classic,
                Behaviour::Text("queued", 0.9),
            )) as Arc<dyn OcrExecutor>],
            &config(4, 60_000),
            Arc::new(OcrStatistics::default()),
        );

        let no_lane = scheduler.submit(job(1, EngineChoice::neural())).await;
        assert!(no_lane.error.is_some());

        let (queued, ()) = tokio::join!(scheduler.submit(job(2, classic())), async {
            tokio::task::yield_now().await;
            scheduler.shutdown().await;
        });
        assert_eq!(queued.text, "queued");

        let after = scheduler.submit(job(3, classic())).await;
        assert!(after.error.is_some());
    }
}
