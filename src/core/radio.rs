//! The short-range radio adapter, shared by every device state machine.
//!
//! Activations hold a read guard; a reset takes the write guard, so it waits
//! for in-flight activations on other devices and blocks new ones until its
//! cool-down has passed. Each connection cycle carries a [`ResetBudget`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::core::gateway::{ActivationFailure, ActivationMode, DeviceGateway};
use crate::core::models::Device;

/// Remaining resets one device may trigger during one connection cycle.
#[derive(Debug)]
pub struct ResetBudget {
    remaining: u32,
}

impl ResetBudget {
    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    Done,
    BudgetExhausted,
    Failed,
}

pub struct RadioAdapter {
    gateway: Arc<dyn DeviceGateway>,
    guard: RwLock<()>,
    max_resets: u32,
    cooldown: Duration,
    resets: AtomicU64,
}

impl RadioAdapter {
    pub fn new(gateway: Arc<dyn DeviceGateway>, max_resets: u32, cooldown: Duration) -> Self {
        Self {
            gateway,
            guard: RwLock::new(()),
            max_resets,
            cooldown,
            resets: AtomicU64::new(0),
        }
    }

    /// Fresh budget for a new connection cycle.
    pub fn budget(&self) -> ResetBudget {
        ResetBudget {
            remaining: self.max_resets,
        }
    }

    pub async fn activate(
        &self,
        device: &Device,
        timeout: Duration,
        mode: ActivationMode,
    ) -> Result<(), ActivationFailure> {
        let _shared = self.guard.read().await;
        self.gateway.activate_wireless(device, timeout, mode).await
    }

    /// Reset the adapter if the budget allows. The cool-down runs while the
    /// exclusive guard is still held.
    pub async fn reset(&self, device: &Device, budget: &mut ResetBudget) -> ResetOutcome {
        if budget.remaining == 0 {
            info!(device = %device.id, "Radio reset budget exhausted, skipping reset");
            return ResetOutcome::BudgetExhausted;
        }
        budget.remaining -= 1;

        let _exclusive = self.guard.write().await;
        let n = self.resets.fetch_add(1, Ordering::Relaxed) + 1;
        info!(device = %device.id, reset = n, "Resetting radio adapter");

        let outcome = match self.gateway.reset_radio().await {
            Ok(()) => ResetOutcome::Done,
            Err(e) => {
                warn!(device = %device.id, error = %e, "Radio reset failed, continuing without it");
                ResetOutcome::Failed
            }
        };

        tokio::time::sleep(self.cooldown).await;
        outcome
    }

    /// Resets performed since startup, across all devices.
    pub fn total_resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }
}
