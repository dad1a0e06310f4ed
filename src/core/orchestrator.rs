use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Local;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapters;
use crate::config::secs;
use crate::context::AppContext;
use crate::core::capture::CaptureCoordinator;
use crate::core::combiner::{self, CombinationQueue, CombinationReport, WorkerStats};
use crate::core::connection::ConnectionManager;
use crate::core::hardware::IoLines;
use crate::core::models::{CaptureJob, CombinationJob, ConnectionState, Device, LABEL_FORMAT};
use crate::core::trigger::TriggerLoop;

type Worker = (CombinationQueue, JoinHandle<WorkerStats>);

pub struct Orchestrator {
    ctx: AppContext,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Run the daemon until Ctrl-C: connect every device, then capture on
    /// each trigger. Queued combinations get a grace period on the way out.
    pub async fn start(&self) -> Result<()> {
        let devices = &self.ctx.devices;
        info!(
            devices = devices.len(),
            simulation = self.ctx.config.simulation,
            "twincam starting"
        );

        let storage = self.ctx.storage()?;
        info!(
            base = %storage.base().display(),
            fallback = storage.is_fallback(),
            "Clips directory"
        );
        let worker = self.start_worker().await;

        let manager = self.ctx.connection_manager();
        let connected = manager.connect_all(devices).await;
        if connected == 0 {
            self.drain(worker).await;
            bail!("No device could be connected");
        }
        if connected < devices.len() {
            warn!(connected, total = devices.len(), "Not every device connected, will retry on trigger");
        } else {
            info!(connected, "All devices connected");
        }

        let coordinator = self
            .ctx
            .capture_coordinator(storage, worker.as_ref().map(|(queue, _)| queue.clone()));
        let lines = IoLines::new(self.ctx.io.clone(), &self.ctx.config.trigger);
        if let Err(e) = lines.set_busy(false).await {
            warn!(error = %e, "Failed to clear busy output");
        }

        if let Some(simulator) = &self.ctx.simulator {
            adapters::spawn_stdin_controller(simulator.clone());
            info!("(Simulator) Type 't' and Enter to trigger a capture");
        }

        let cancel = CancellationToken::new();
        spawn_signal_handler(cancel.clone());

        let t = &self.ctx.config.trigger;
        let trigger = TriggerLoop::new(
            lines.clone(),
            Duration::from_millis(t.poll_interval_ms),
            Duration::from_millis(t.debounce_ms),
        );

        let handled = {
            let manager = &manager;
            let coordinator = &coordinator;
            let lines = &lines;
            trigger
                .run(cancel, move || {
                    handle_trigger(manager, coordinator, lines, devices)
                })
                .await
        };

        info!(
            triggers = handled,
            radio_resets = self.ctx.radio.total_resets(),
            "Trigger loop stopped"
        );
        self.drain(worker).await;
        Ok(())
    }

    /// Fast probe of every device. No radio or network commands.
    pub async fn status(&self) -> Vec<(Device, ConnectionState)> {
        let manager = self.ctx.connection_manager();
        for device in &self.ctx.devices {
            manager.refresh(device).await;
        }

        let states = manager.tracker().snapshot().await;
        self.ctx
            .devices
            .iter()
            .map(|d| {
                let state = states.get(&d.id).copied().unwrap_or(ConnectionState::Unverified);
                (d.clone(), state)
            })
            .collect()
    }

    /// Run the connection state machine for one device, or all of them.
    /// Returns how many devices ended up verified.
    pub async fn connect(&self, device_id: Option<&str>) -> Result<usize> {
        let manager = self.ctx.connection_manager();
        match device_id {
            Some(id) => {
                let device = self
                    .ctx
                    .config
                    .device(id)
                    .with_context(|| format!("Unknown device '{id}'"))?;
                Ok(usize::from(manager.ensure_connected(&device).await?))
            }
            None => Ok(manager.connect_all(&self.ctx.devices).await),
        }
    }

    /// One capture cycle without the trigger loop. Waits for the resulting
    /// combination before returning.
    pub async fn capture_once(&self) -> Result<CaptureJob> {
        let devices = &self.ctx.devices;
        let storage = self.ctx.storage()?;
        let worker = self.start_worker().await;

        let manager = self.ctx.connection_manager();
        manager.connect_all(devices).await;

        let coordinator = self
            .ctx
            .capture_coordinator(storage, worker.as_ref().map(|(queue, _)| queue.clone()));
        let result = coordinator.run_capture_job(devices).await;

        self.drain(worker).await;
        Ok(result?)
    }

    /// Tiered merge of two local files, outside the queue.
    pub async fn combine(
        &self,
        clip_a: PathBuf,
        clip_b: PathBuf,
        output: PathBuf,
    ) -> Result<CombinationReport> {
        let job = CombinationJob {
            clip_a,
            clip_b,
            output,
            timestamp: Local::now().format(LABEL_FORMAT).to_string(),
        };
        let report = combiner::combine_and_describe(self.ctx.merge_engine.as_ref(), &job).await?;
        Ok(report)
    }

    /// Start the combination worker if the merge backend works. Captures go
    /// on without combination otherwise.
    async fn start_worker(&self) -> Option<Worker> {
        match self.ctx.merge_engine.check_available().await {
            Ok(version) => info!(%version, "Merge backend available"),
            Err(e) => {
                error!(error = %e, "Merge backend unavailable, clips will not be combined");
                return None;
            }
        }

        let poll = Duration::from_millis(self.ctx.config.combination.queue_poll_ms);
        let (queue, worker) = combiner::channel(self.ctx.merge_engine.clone(), poll);
        Some((queue, worker.spawn()))
    }

    async fn drain(&self, worker: Option<Worker>) {
        let Some((queue, handle)) = worker else {
            return;
        };
        let c = &self.ctx.config.combination;

        let pending = queue.pending();
        if pending > 0 {
            info!(pending, "Waiting for queued combinations");
        }
        if !queue.wait_idle(secs(c.drain_timeout_secs)).await {
            warn!(pending = queue.pending(), "Combination queue did not drain in time");
        }

        queue.shutdown();
        match timeout(secs(c.join_timeout_secs), handle).await {
            Ok(Ok(stats)) => info!(
                succeeded = stats.succeeded,
                failed = stats.failed,
                "Combination worker joined"
            ),
            Ok(Err(e)) => error!(error = %e, "Combination worker panicked"),
            Err(_) => warn!("Combination worker did not stop in time"),
        }
    }
}

async fn handle_trigger(
    manager: &ConnectionManager,
    coordinator: &CaptureCoordinator,
    lines: &IoLines,
    devices: &[Device],
) {
    if !manager.ensure_all(devices).await {
        warn!(
            verified = manager.tracker().verified_count().await,
            total = devices.len(),
            "Not every device is connected, capture skipped"
        );
        return;
    }

    set_busy(lines, true).await;
    match coordinator.run_capture_job(devices).await {
        Ok(job) => info!(
            label = %job.label(),
            recorded = job.records_ok(),
            downloaded = job.downloads_ok(),
            combination_queued = job.combination.is_some(),
            "Capture finished"
        ),
        Err(e) => warn!(error = %e, "Capture refused"),
    }
    set_busy(lines, false).await;
}

async fn set_busy(lines: &IoLines, busy: bool) {
    if let Err(e) = lines.set_busy(busy).await {
        warn!(busy, error = %e, "Failed to drive busy output");
    }
}

/// First Ctrl-C stops the trigger loop after the current capture; a second
/// one exits immediately.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Shutdown requested, Ctrl-C again to force");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Forced exit");
            std::process::exit(130);
        }
    });
}
