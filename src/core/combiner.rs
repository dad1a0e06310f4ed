//! Background combination of clip pairs.
//!
//! A single worker consumes a FIFO of [`CombinationJob`]s, one at a time, so
//! merges never compete with each other for CPU or disk. Callers hold a
//! cloneable [`CombinationQueue`] handle; enqueueing never blocks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::core::merge_engine::{MergeEngine, MergeMethod, MergeRequest};
use crate::core::metadata::{self, CombinedInfo};
use crate::core::models::CombinationJob;
use crate::core::storage::partial_path;

#[derive(Debug, Error)]
pub enum CombineError {
    #[error("input clip {0} does not exist")]
    MissingInput(PathBuf),
    #[error("every merge method failed for {0}")]
    AllMethodsFailed(PathBuf),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CombinationReport {
    pub output: PathBuf,
    pub method: MergeMethod,
    pub elapsed: Duration,
    pub size_bytes: u64,
}

/// Merge `job.clip_b` onto the end of `job.clip_a`, trying each method in
/// turn. Attempts write to a `.part` sibling that is renamed over the target
/// only after an attempt succeeds, so a failed job leaves nothing behind.
pub async fn combine_clips(
    engine: &dyn MergeEngine,
    job: &CombinationJob,
) -> Result<CombinationReport, CombineError> {
    for clip in [&job.clip_a, &job.clip_b] {
        if !tokio::fs::try_exists(clip).await.unwrap_or(false) {
            return Err(CombineError::MissingInput(clip.clone()));
        }
    }
    if let Some(parent) = job.output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let partial = partial_path(&job.output);
    let started = Instant::now();

    for method in MergeMethod::TIERS {
        let _ = tokio::fs::remove_file(&partial).await;
        let request = MergeRequest {
            clip_a: job.clip_a.clone(),
            clip_b: job.clip_b.clone(),
            output: partial.clone(),
            method,
        };

        let attempt_start = Instant::now();
        debug!(%method, "Trying merge method");
        match timeout(method.timeout(), engine.merge(&request)).await {
            Ok(Ok(())) => match tokio::fs::metadata(&partial).await {
                Ok(meta) if meta.len() > 0 => {
                    tokio::fs::rename(&partial, &job.output).await?;
                    info!(
                        %method,
                        attempt_ms = attempt_start.elapsed().as_millis() as u64,
                        "Merge method succeeded"
                    );
                    return Ok(CombinationReport {
                        output: job.output.clone(),
                        method,
                        elapsed: started.elapsed(),
                        size_bytes: meta.len(),
                    });
                }
                _ => warn!(%method, "Merge reported success but produced no output"),
            },
            Ok(Err(e)) => warn!(%method, error = %e, "Merge method failed"),
            Err(_) => warn!(%method, timeout_s = method.timeout().as_secs(), "Merge method timed out"),
        }
    }

    let _ = tokio::fs::remove_file(&partial).await;
    Err(CombineError::AllMethodsFailed(job.output.clone()))
}

/// [`combine_clips`], then the sidecar for the combined file. A sidecar
/// that cannot be written is logged and ignored.
pub async fn combine_and_describe(
    engine: &dyn MergeEngine,
    job: &CombinationJob,
) -> Result<CombinationReport, CombineError> {
    let report = combine_clips(engine, job).await?;
    let info = CombinedInfo {
        output: &report.output,
        clip_a: &job.clip_a,
        clip_b: &job.clip_b,
        method: report.method,
        merge_time: report.elapsed,
        size_bytes: report.size_bytes,
    };
    if let Err(e) = metadata::write_combined(&info).await {
        warn!(error = %e, "Failed to write combined metadata");
    }
    Ok(report)
}

enum QueueMessage {
    Job(CombinationJob),
    Shutdown,
}

/// Producer handle for the combination worker.
#[derive(Clone)]
pub struct CombinationQueue {
    tx: mpsc::UnboundedSender<QueueMessage>,
    pending: Arc<watch::Sender<usize>>,
}

impl CombinationQueue {
    /// Hand a job to the worker. Returns `false` if the worker is gone.
    pub fn enqueue(&self, job: CombinationJob) -> bool {
        self.pending.send_modify(|n| *n += 1);
        let output = job.output.clone();
        if self.tx.send(QueueMessage::Job(job)).is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            error!(output = %output.display(), "Combination worker is not running, job dropped");
            return false;
        }
        info!(output = %output.display(), pending = self.pending(), "Combination job queued");
        true
    }

    /// Jobs queued or in progress.
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Wait up to `limit` for the queue to run dry. Returns whether it did.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let mut rx = self.pending.subscribe();
        matches!(timeout(limit, rx.wait_for(|n| *n == 0)).await, Ok(Ok(_)))
    }

    /// Ask the worker to stop once it has finished its current job. Jobs
    /// still in the queue are not processed.
    pub fn shutdown(&self) {
        let _ = self.tx.send(QueueMessage::Shutdown);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub succeeded: usize,
    pub failed: usize,
}

pub struct CombinationWorker {
    engine: Arc<dyn MergeEngine>,
    rx: mpsc::UnboundedReceiver<QueueMessage>,
    pending: Arc<watch::Sender<usize>>,
    poll: Duration,
}

/// Create a queue handle and the worker that drains it.
pub fn channel(engine: Arc<dyn MergeEngine>, poll: Duration) -> (CombinationQueue, CombinationWorker) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (pending, _) = watch::channel(0usize);
    let pending = Arc::new(pending);
    (
        CombinationQueue {
            tx,
            pending: pending.clone(),
        },
        CombinationWorker {
            engine,
            rx,
            pending,
            poll,
        },
    )
}

impl CombinationWorker {
    pub fn spawn(self) -> JoinHandle<WorkerStats> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> WorkerStats {
        info!("Combination worker started");
        let mut stats = WorkerStats::default();

        loop {
            let message = match timeout(self.poll, self.rx.recv()).await {
                Err(_) => {
                    trace!("Combination queue idle");
                    continue;
                }
                Ok(None) => {
                    debug!("All queue handles dropped");
                    break;
                }
                Ok(Some(message)) => message,
            };

            let job = match message {
                QueueMessage::Shutdown => {
                    info!("Combination worker received shutdown");
                    break;
                }
                QueueMessage::Job(job) => job,
            };

            if self.process(&job).await {
                stats.succeeded += 1;
            } else {
                stats.failed += 1;
            }
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
        }

        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            "Combination worker stopped"
        );
        stats
    }

    async fn process(&self, job: &CombinationJob) -> bool {
        let span = info_span!("combine", output = %job.output.display());
        async {
            info!(timestamp = %job.timestamp, "Combining clips");
            match combine_and_describe(self.engine.as_ref(), job).await {
                Ok(report) => {
                    info!(
                        method = %report.method,
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        size_mb = format!("{:.1}", report.size_bytes as f64 / (1024.0 * 1024.0)),
                        "Combination complete"
                    );
                    true
                }
                Err(e) => {
                    error!(error = %e, "Combination failed");
                    false
                }
            }
        }
        .instrument(span)
        .await
    }
}
