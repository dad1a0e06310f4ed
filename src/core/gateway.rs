//! Capability interface to the radio and network subsystems.
//!
//! The connection state machine only ever talks to a [`DeviceGateway`]. The
//! Linux implementation shells out to the BLE tool, `wpa_supplicant`,
//! `dhclient` and `ip`; tests and `--simulation` plug in scripted ones.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use crate::core::models::Device;

/// Why an activation command failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ActivationFailure {
    #[error("activation timed out")]
    Timeout,
    #[error("radio connection refused")]
    Refused,
    #[error("radio device not found")]
    NotFound,
    #[error("activation failed")]
    Unknown,
}

static TIMEOUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)timed?\s*out").expect("static regex"));
static REFUSED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)connection refused|no route").expect("static regex"));
static NOT_FOUND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)device not found|not available|no such device").expect("static regex"));

impl ActivationFailure {
    /// Map tool output onto the closed failure set.
    pub fn classify(output: &str) -> Self {
        if TIMEOUT_RE.is_match(output) {
            Self::Timeout
        } else if REFUSED_RE.is_match(output) {
            Self::Refused
        } else if NOT_FOUND_RE.is_match(output) {
            Self::NotFound
        } else {
            Self::Unknown
        }
    }

    /// Whether this failure on zero-based `attempt` calls for an adapter reset.
    ///
    /// A sleeping camera times out a couple of times before a reset helps;
    /// refusals and missing devices point at a wedged adapter straight away.
    pub fn warrants_reset(self, attempt: u32) -> bool {
        match self {
            Self::Timeout => attempt >= 2,
            Self::Refused | Self::NotFound => true,
            Self::Unknown => attempt >= 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationMode {
    Interactive,
    /// Last-resort invocation without the interactive session.
    NonInteractive,
}

#[async_trait]
pub trait DeviceGateway: Send + Sync {
    async fn interface_exists(&self, interface: &str) -> bool;

    /// Ask the camera over BLE to start broadcasting its network.
    async fn activate_wireless(
        &self,
        device: &Device,
        timeout: Duration,
        mode: ActivationMode,
    ) -> Result<(), ActivationFailure>;

    /// Evidence that the camera's network is actually on air.
    async fn network_visible(&self, device: &Device) -> bool;

    /// Cycle the shared radio adapter. Callers go through
    /// [`RadioAdapter`](crate::core::radio::RadioAdapter), never directly.
    async fn reset_radio(&self) -> anyhow::Result<()>;

    /// Join the camera network on the device's interface and make its
    /// address routable through that interface.
    async fn associate_network(&self, device: &Device) -> anyhow::Result<()>;
}
