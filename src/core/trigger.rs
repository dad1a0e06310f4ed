//! Polls the trigger input and runs a handler for each press.
//!
//! The loop is level-triggered and single-threaded with respect to the
//! handler: a new press is not looked at until the handler has returned and
//! the line has been released or the debounce window has passed.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::hardware::IoLines;
use crate::logging::LogThrottle;

pub struct TriggerLoop {
    lines: IoLines,
    poll: Duration,
    debounce: Duration,
}

impl TriggerLoop {
    pub fn new(lines: IoLines, poll: Duration, debounce: Duration) -> Self {
        Self {
            lines,
            poll,
            debounce,
        }
    }

    /// Run until `cancel` fires. Returns how many triggers were handled.
    pub async fn run<F, Fut>(&self, cancel: CancellationToken, mut on_trigger: F) -> u64
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        let read_errors = LogThrottle::new(Duration::from_secs(30));
        let mut failing = false;
        let mut handled = 0;
        info!(poll_ms = self.poll.as_millis() as u64, "Waiting for trigger");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.poll) => {}
            }

            let asserted = match self.lines.trigger_asserted().await {
                Ok(asserted) => asserted,
                Err(e) => {
                    failing = true;
                    if let Some(held) = read_errors.admit() {
                        warn!(error = %e, suppressed = held, "Failed to read trigger input");
                    }
                    continue;
                }
            };
            if failing {
                failing = false;
                let held = read_errors.reset();
                info!(suppressed = held, "Trigger input readable again");
            }
            if !asserted {
                continue;
            }

            handled += 1;
            info!(trigger = handled, "Trigger detected");
            on_trigger().await;

            self.debounce_release(&cancel).await;
            info!("Ready for next trigger");
        }

        debug!(handled, "Trigger loop stopped");
        handled
    }

    /// Wait while the line stays asserted, at most the debounce window.
    async fn debounce_release(&self, cancel: &CancellationToken) {
        let started = Instant::now();
        while started.elapsed() < self.debounce && !cancel.is_cancelled() {
            match self.lines.trigger_asserted().await {
                Ok(true) => sleep(self.poll).await,
                _ => break,
            }
        }
    }
}
