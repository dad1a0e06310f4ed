//! Tracing setup for the twincam daemon.
//!
//! Console output is compact and human oriented; `--json-logs` switches to
//! one JSON object per line for shipping to a collector.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Options for [`init`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// Emit JSON lines instead of the human formatter.
    pub json: bool,
    /// Lower the default level to DEBUG.
    pub verbose: bool,
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the `verbose` flag when it is set, so
/// `RUST_LOG=twincam::core::connection=trace` narrows output to the
/// connection state machine.
pub fn init(config: LogConfig) {
    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("twincam={}", level.as_str().to_lowercase())));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_thread_ids(false),
            )
            .init();
    }
}

const NEVER: u64 = u64::MAX;

/// Lets at most one log line through per interval and counts the ones it
/// held back, so the next line can say how many were dropped.
///
/// Runs on the tokio clock, which keeps paused-time tests deterministic.
pub struct LogThrottle {
    interval_ms: u64,
    last_ms: AtomicU64,
    held: AtomicU64,
    origin: Instant,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_ms: AtomicU64::new(NEVER),
            held: AtomicU64::new(0),
            origin: Instant::now(),
        }
    }

    /// `Some(held)` when the caller should emit its line now, with the
    /// number of lines held back since the previous one.
    pub fn admit(&self) -> Option<u64> {
        let now = self.origin.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Relaxed);

        let due = last == NEVER || now.saturating_sub(last) >= self.interval_ms;
        // A lost race means a concurrent caller just logged.
        if due
            && self
                .last_ms
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            Some(self.held.swap(0, Ordering::Relaxed))
        } else {
            self.held.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Reopen the gate. Returns the lines held back since the last one let
    /// through.
    pub fn reset(&self) -> u64 {
        self.last_ms.store(NEVER, Ordering::Relaxed);
        self.held.swap(0, Ordering::Relaxed)
    }
}
