//! Per-device connection state machine.
//!
//! Brings a camera from unknown to HTTP-reachable: fast probe, radio
//! activation with backoff and bounded adapter resets, network association,
//! then a final probe loop. Every external failure is logged and retried; the
//! only hard error is a missing interface.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{ConnectionConfig, secs};
use crate::core::camera::CameraApi;
use crate::core::gateway::{ActivationFailure, ActivationMode, DeviceGateway};
use crate::core::models::{ConnectionState, Device};
use crate::core::radio::RadioAdapter;
use crate::core::state::ConnectionTracker;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("interface {interface} for device '{device}' does not exist")]
    MissingInterface { device: String, interface: String },
}

/// Timing bounds for one connection cycle.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub settle: Duration,
    pub backoff_base: Duration,
    pub backoff_factor: f64,
    pub backoff_cap: Duration,
    pub backoff_step: Duration,
    pub activation_timeout: Duration,
    pub activation_timeout_step: Duration,
    pub broadcast_checks: u32,
    pub broadcast_interval: Duration,
    pub fallback_attempts: u32,
    pub fallback_settle: Duration,
    pub fast_probe_timeout: Duration,
    pub probe_attempts: u32,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub inter_device: Duration,
}

impl From<&ConnectionConfig> for RetryPolicy {
    fn from(c: &ConnectionConfig) -> Self {
        Self {
            max_attempts: c.max_attempts,
            settle: secs(c.settle_secs),
            backoff_base: secs(c.backoff_base_secs),
            backoff_factor: c.backoff_factor,
            backoff_cap: secs(c.backoff_cap_secs),
            backoff_step: secs(c.backoff_step_secs),
            activation_timeout: secs(c.activation_timeout_secs),
            activation_timeout_step: secs(c.activation_timeout_step_secs),
            broadcast_checks: c.broadcast_checks,
            broadcast_interval: secs(c.broadcast_interval_secs),
            fallback_attempts: c.fallback_attempts,
            fallback_settle: secs(c.fallback_settle_secs),
            fast_probe_timeout: secs(c.fast_probe_timeout_secs),
            probe_attempts: c.probe_attempts,
            probe_interval: secs(c.probe_interval_secs),
            probe_timeout: secs(c.probe_timeout_secs),
            inter_device: secs(c.inter_device_secs),
        }
    }
}

impl RetryPolicy {
    /// Wait before a retry: `base * factor^attempt + attempt * step`, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.backoff_base.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let linear = self.backoff_step.as_secs_f64() * f64::from(attempt);
        let cap = self.backoff_cap.as_secs_f64();
        secs((exp + linear).min(cap))
    }

    /// Wait before activation attempt `attempt` (zero-based). The first
    /// attempt waits for the camera to start advertising instead.
    pub fn wait_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            self.settle
        } else {
            self.backoff_delay(attempt)
        }
    }

    pub fn activation_timeout(&self, attempt: u32) -> Duration {
        self.activation_timeout + self.activation_timeout_step * attempt
    }

    fn is_fallback_attempt(&self, attempt: u32) -> bool {
        attempt + self.fallback_attempts >= self.max_attempts
    }

    fn is_last_attempt(&self, attempt: u32) -> bool {
        attempt + 1 >= self.max_attempts
    }
}

pub struct ConnectionManager {
    gateway: Arc<dyn DeviceGateway>,
    camera: Arc<dyn CameraApi>,
    radio: Arc<RadioAdapter>,
    tracker: ConnectionTracker,
    policy: RetryPolicy,
}

impl ConnectionManager {
    pub fn new(
        gateway: Arc<dyn DeviceGateway>,
        camera: Arc<dyn CameraApi>,
        radio: Arc<RadioAdapter>,
        tracker: ConnectionTracker,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            gateway,
            camera,
            radio,
            tracker,
            policy,
        }
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Drive `device` to `Verified`. `Ok(false)` means every recovery step
    /// was exhausted; `Err` is a configuration problem and is not retried.
    pub async fn ensure_connected(&self, device: &Device) -> Result<bool, ConnectionError> {
        let span = info_span!("connect", device = %device.id);
        self.ensure_connected_inner(device).instrument(span).await
    }

    async fn ensure_connected_inner(&self, device: &Device) -> Result<bool, ConnectionError> {
        if !self.gateway.interface_exists(&device.interface).await {
            error!(interface = %device.interface, "Network interface not found");
            self.tracker.set(&device.id, ConnectionState::Failed).await;
            return Err(ConnectionError::MissingInterface {
                device: device.id.clone(),
                interface: device.interface.clone(),
            });
        }

        if self.probe_once(device).await {
            info!("Already reachable");
            self.tracker.set(&device.id, ConnectionState::Verified).await;
            return Ok(true);
        }

        self.tracker.set(&device.id, ConnectionState::Unverified).await;
        self.tracker
            .set(&device.id, ConnectionState::RadioActivating)
            .await;
        if !self.activate(device).await {
            error!(
                attempts = self.policy.max_attempts,
                "Radio activation failed on every attempt"
            );
            self.tracker.set(&device.id, ConnectionState::Failed).await;
            return Ok(false);
        }

        self.tracker
            .set(&device.id, ConnectionState::NetworkAssociating)
            .await;
        if let Err(e) = self.gateway.associate_network(device).await {
            error!(error = %e, "Network association failed");
            self.tracker.set(&device.id, ConnectionState::Failed).await;
            return Ok(false);
        }

        if self.probe_until_reachable(device).await {
            info!("Connected");
            self.tracker.set(&device.id, ConnectionState::Verified).await;
            Ok(true)
        } else {
            error!(
                attempts = self.policy.probe_attempts,
                "Still unreachable after association"
            );
            self.tracker.set(&device.id, ConnectionState::Failed).await;
            Ok(false)
        }
    }

    /// Fast probe with no radio or network side effects. Updates the tracker.
    pub async fn refresh(&self, device: &Device) -> bool {
        let reachable = self.probe_once(device).await;
        let state = if reachable {
            ConnectionState::Verified
        } else {
            ConnectionState::Unverified
        };
        self.tracker.set(&device.id, state).await;
        reachable
    }

    /// Connect devices strictly one after another, pausing between them so
    /// the shared radio is never driven for two devices at once. Returns how
    /// many ended up verified.
    pub async fn connect_all(&self, devices: &[Device]) -> usize {
        let mut connected = 0;
        for (i, device) in devices.iter().enumerate() {
            if i > 0 {
                sleep(self.policy.inter_device).await;
            }
            match self.ensure_connected(device).await {
                Ok(true) => connected += 1,
                Ok(false) => warn!(device = %device.id, "Device not connected"),
                Err(e) => error!(device = %device.id, error = %e, "Skipping device"),
            }
        }
        connected
    }

    /// Re-check every device before a capture. A single missing device is
    /// reconnected on its own; otherwise all are reconnected in sequence.
    pub async fn ensure_all(&self, devices: &[Device]) -> bool {
        let mut missing = Vec::new();
        for device in devices {
            if !self.refresh(device).await {
                missing.push(device.clone());
            }
        }

        match missing.len() {
            0 => return true,
            1 => {
                warn!(device = %missing[0].id, "Device dropped off, reconnecting");
                if let Err(e) = self.ensure_connected(&missing[0]).await {
                    error!(error = %e, "Reconnect impossible");
                }
            }
            n => {
                warn!(missing = n, "Several devices unreachable, reconnecting all");
                self.connect_all(devices).await;
            }
        }

        self.tracker
            .all_verified(devices.iter().map(|d| d.id.as_str()))
            .await
    }

    async fn probe_once(&self, device: &Device) -> bool {
        self.camera
            .probe(device, self.policy.fast_probe_timeout)
            .await
    }

    async fn probe_until_reachable(&self, device: &Device) -> bool {
        for attempt in 0..self.policy.probe_attempts {
            if self.camera.probe(device, self.policy.probe_timeout).await {
                return true;
            }
            debug!(
                attempt = attempt + 1,
                of = self.policy.probe_attempts,
                "Probe failed"
            );
            if attempt + 1 < self.policy.probe_attempts {
                sleep(self.policy.probe_interval).await;
            }
        }
        false
    }

    /// Poll for the camera's network after the radio reported success.
    async fn await_broadcast(&self, device: &Device) -> bool {
        for check in 0..self.policy.broadcast_checks {
            sleep(self.policy.broadcast_interval).await;
            if self.gateway.network_visible(device).await {
                return true;
            }
            debug!(check = check + 1, "Network not broadcasting yet");
        }
        false
    }

    async fn activate(&self, device: &Device) -> bool {
        if self.gateway.network_visible(device).await {
            info!(network = %device.network_name, "Network already broadcasting");
            return true;
        }

        let mut budget = self.radio.budget();

        for attempt in 0..self.policy.max_attempts {
            let wait = self.policy.wait_before(attempt);
            let timeout = self.policy.activation_timeout(attempt);
            info!(
                attempt = attempt + 1,
                of = self.policy.max_attempts,
                wait_ms = wait.as_millis() as u64,
                "Activating radio"
            );
            sleep(wait).await;

            let failure = match self
                .radio
                .activate(device, timeout, ActivationMode::Interactive)
                .await
            {
                Ok(()) => {
                    if self.await_broadcast(device).await {
                        info!(attempt = attempt + 1, "Network broadcasting");
                        return true;
                    }
                    warn!("Activation reported success but no network appeared");
                    ActivationFailure::Unknown
                }
                Err(failure) => {
                    warn!(attempt = attempt + 1, %failure, "Activation failed");
                    failure
                }
            };

            if failure.warrants_reset(attempt) && !self.policy.is_last_attempt(attempt) {
                self.radio.reset(device, &mut budget).await;
            }

            if self.policy.is_fallback_attempt(attempt) && self.activate_fallback(device, timeout).await
            {
                return true;
            }
        }

        false
    }

    async fn activate_fallback(&self, device: &Device, timeout: Duration) -> bool {
        info!("Trying non-interactive activation");
        if self
            .radio
            .activate(device, timeout, ActivationMode::NonInteractive)
            .await
            .is_err()
        {
            return false;
        }
        sleep(self.policy.fallback_settle).await;
        let visible = self.gateway.network_visible(device).await;
        if visible {
            info!("Non-interactive activation worked");
        }
        visible
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::camera::{CameraError, RemoteMedia};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Gateway whose activation outcomes are scripted per call.
    #[derive(Default)]
    struct ScriptedGateway {
        missing_interface: bool,
        activations: Mutex<VecDeque<Result<(), ActivationFailure>>>,
        activation_calls: AtomicU32,
        fallback_calls: AtomicU32,
        resets: AtomicU32,
        associations: AtomicU32,
        broadcasting: AtomicBool,
        associated: Arc<AtomicBool>,
    }

    impl ScriptedGateway {
        fn with_activations(outcomes: Vec<Result<(), ActivationFailure>>) -> Self {
            Self {
                activations: Mutex::new(outcomes.into()),
                ..Default::default()
            }
        }

        fn radio_commands(&self) -> u32 {
            self.activation_calls.load(Ordering::SeqCst)
                + self.fallback_calls.load(Ordering::SeqCst)
                + self.resets.load(Ordering::SeqCst)
                + self.associations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeviceGateway for ScriptedGateway {
        async fn interface_exists(&self, _interface: &str) -> bool {
            !self.missing_interface
        }

        async fn activate_wireless(
            &self,
            _device: &Device,
            _timeout: Duration,
            mode: ActivationMode,
        ) -> Result<(), ActivationFailure> {
            if mode == ActivationMode::NonInteractive {
                self.fallback_calls.fetch_add(1, Ordering::SeqCst);
                return Err(ActivationFailure::Unknown);
            }
            self.activation_calls.fetch_add(1, Ordering::SeqCst);
            let outcome = self
                .activations
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ActivationFailure::Unknown));
            if outcome.is_ok() {
                self.broadcasting.store(true, Ordering::SeqCst);
            }
            outcome
        }

        async fn network_visible(&self, _device: &Device) -> bool {
            self.broadcasting.load(Ordering::SeqCst)
        }

        async fn reset_radio(&self) -> anyhow::Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn associate_network(&self, _device: &Device) -> anyhow::Result<()> {
            self.associations.fetch_add(1, Ordering::SeqCst);
            self.associated.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Camera reachable either always or once the gateway has associated.
    struct ProbeCamera {
        always: bool,
        associated: Arc<AtomicBool>,
        probes: AtomicU32,
    }

    impl ProbeCamera {
        fn new(always: bool, associated: Arc<AtomicBool>) -> Self {
            Self {
                always,
                associated,
                probes: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl CameraApi for ProbeCamera {
        async fn probe(&self, _device: &Device, _timeout: Duration) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.always || self.associated.load(Ordering::SeqCst)
        }

        async fn set_shutter(&self, _device: &Device, _recording: bool) -> Result<(), CameraError> {
            Ok(())
        }

        async fn latest_media(&self, _device: &Device) -> Result<Option<RemoteMedia>, CameraError> {
            Ok(None)
        }

        async fn download(
            &self,
            _device: &Device,
            _media: &RemoteMedia,
            _destination: &Path,
        ) -> Result<u64, CameraError> {
            Ok(0)
        }

        async fn delete(&self, _device: &Device, _media: &RemoteMedia) -> Result<(), CameraError> {
            Ok(())
        }
    }

    fn device(id: &str, interface: &str) -> Device {
        Device {
            id: id.into(),
            display_name: id.to_uppercase(),
            radio_address: "D0:21:F8:9C:FF:80".into(),
            network_name: format!("{id} net"),
            network_secret: "pw".into(),
            ip_address: IpAddr::V4(Ipv4Addr::new(10, 5, 5, 9)),
            interface: interface.into(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::from(&ConnectionConfig::default())
    }

    fn manager(gateway: Arc<ScriptedGateway>, camera_always: bool) -> (ConnectionManager, Arc<ProbeCamera>) {
        let camera = Arc::new(ProbeCamera::new(camera_always, gateway.associated.clone()));
        let radio = Arc::new(RadioAdapter::new(gateway.clone(), 2, Duration::from_secs(2)));
        let manager = ConnectionManager::new(
            gateway,
            camera.clone(),
            radio,
            ConnectionTracker::new(),
            policy(),
        );
        (manager, camera)
    }

    #[test]
    fn backoff_is_monotonic_up_to_cap() {
        let policy = policy();
        let delays: Vec<Duration> = (1..12).map(|a| policy.backoff_delay(a)).collect();

        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= policy.backoff_cap));
        assert_eq!(*delays.last().unwrap(), policy.backoff_cap);
        // 3 * 1.5 + 0.5
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(5));
    }

    #[test]
    fn first_attempt_waits_for_settle() {
        let policy = policy();
        assert_eq!(policy.wait_before(0), Duration::from_secs(8));
        assert_eq!(policy.wait_before(2), policy.backoff_delay(2));
    }

    #[test]
    fn activation_timeout_grows_with_attempt() {
        let policy = policy();
        assert_eq!(policy.activation_timeout(0), Duration::from_secs(20));
        assert_eq!(policy.activation_timeout(3), Duration::from_secs(35));
    }

    #[tokio::test(start_paused = true)]
    async fn reachable_device_takes_fast_path() {
        let gateway = Arc::new(ScriptedGateway::default());
        let (manager, camera) = manager(gateway.clone(), true);
        let devices = [device("a", "wlan0"), device("b", "wlan1")];

        for d in &devices {
            assert_eq!(manager.ensure_connected(d).await, Ok(true));
        }

        assert_eq!(gateway.radio_commands(), 0);
        assert_eq!(camera.probes.load(Ordering::SeqCst), 2);
        assert!(manager.tracker().all_verified(["a", "b"]).await);
    }

    #[tokio::test(start_paused = true)]
    async fn activation_succeeds_on_second_attempt() {
        let gateway = Arc::new(ScriptedGateway::with_activations(vec![
            Err(ActivationFailure::Timeout),
            Ok(()),
        ]));
        let (manager, _camera) = manager(gateway.clone(), false);
        let d = device("a", "wlan0");

        assert_eq!(manager.ensure_connected(&d).await, Ok(true));
        assert_eq!(gateway.activation_calls.load(Ordering::SeqCst), 2);
        assert_eq!(gateway.fallback_calls.load(Ordering::SeqCst), 0);
        // A first timeout is not worth a reset.
        assert_eq!(gateway.resets.load(Ordering::SeqCst), 0);
        assert_eq!(gateway.associations.load(Ordering::SeqCst), 1);
        assert_eq!(manager.tracker().get("a").await, ConnectionState::Verified);
    }

    #[tokio::test(start_paused = true)]
    async fn resets_never_exceed_cap() {
        let gateway = Arc::new(ScriptedGateway::with_activations(vec![
            Err(ActivationFailure::Refused);
            5
        ]));
        let (manager, _camera) = manager(gateway.clone(), false);

        assert_eq!(manager.ensure_connected(&device("a", "wlan0")).await, Ok(false));
        assert_eq!(gateway.activation_calls.load(Ordering::SeqCst), 5);
        assert_eq!(gateway.resets.load(Ordering::SeqCst), 2);
        assert_eq!(gateway.fallback_calls.load(Ordering::SeqCst), 2);
        assert_eq!(gateway.associations.load(Ordering::SeqCst), 0);
        assert_eq!(manager.tracker().get("a").await, ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_budget_is_per_cycle() {
        let gateway = Arc::new(ScriptedGateway::with_activations(vec![
            Err(ActivationFailure::NotFound);
            10
        ]));
        let (manager, _camera) = manager(gateway.clone(), false);
        let d = device("a", "wlan0");

        manager.ensure_connected(&d).await.unwrap();
        manager.ensure_connected(&d).await.unwrap();
        assert_eq!(gateway.resets.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn soft_success_keeps_retrying() {
        struct SilentGateway(ScriptedGateway);

        #[async_trait]
        impl DeviceGateway for SilentGateway {
            async fn interface_exists(&self, i: &str) -> bool {
                self.0.interface_exists(i).await
            }
            async fn activate_wireless(
                &self,
                d: &Device,
                t: Duration,
                m: ActivationMode,
            ) -> Result<(), ActivationFailure> {
                let r = self.0.activate_wireless(d, t, m).await;
                self.0.broadcasting.store(false, Ordering::SeqCst);
                r
            }
            async fn network_visible(&self, _d: &Device) -> bool {
                false
            }
            async fn reset_radio(&self) -> anyhow::Result<()> {
                self.0.reset_radio().await
            }
            async fn associate_network(&self, d: &Device) -> anyhow::Result<()> {
                self.0.associate_network(d).await
            }
        }

        let inner = ScriptedGateway::with_activations(vec![Ok(()); 5]);
        let gateway = Arc::new(SilentGateway(inner));
        let camera = Arc::new(ProbeCamera::new(false, Arc::new(AtomicBool::new(false))));
        let radio = Arc::new(RadioAdapter::new(gateway.clone(), 2, Duration::ZERO));
        let manager =
            ConnectionManager::new(gateway.clone(), camera, radio, ConnectionTracker::new(), policy());

        assert_eq!(manager.ensure_connected(&device("a", "wlan0")).await, Ok(false));
        assert_eq!(gateway.0.activation_calls.load(Ordering::SeqCst), 5);
        assert_eq!(gateway.0.associations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_interface_is_fatal_for_that_device() {
        let gateway = Arc::new(ScriptedGateway {
            missing_interface: true,
            ..Default::default()
        });
        let (manager, camera) = manager(gateway.clone(), true);

        let err = manager.ensure_connected(&device("a", "wlan9")).await.unwrap_err();
        assert_eq!(
            err,
            ConnectionError::MissingInterface {
                device: "a".into(),
                interface: "wlan9".into()
            }
        );
        assert_eq!(camera.probes.load(Ordering::SeqCst), 0);
        assert_eq!(gateway.radio_commands(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_all_is_sequential_and_counts() {
        let gateway = Arc::new(ScriptedGateway::default());
        let (manager, _camera) = manager(gateway, true);
        let devices = vec![device("a", "wlan0"), device("b", "wlan1")];

        let start = tokio::time::Instant::now();
        assert_eq!(manager.connect_all(&devices).await, 2);
        assert!(start.elapsed() >= manager.policy().inter_device);
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_all_is_a_probe_when_everything_answers() {
        let gateway = Arc::new(ScriptedGateway::default());
        let (manager, _camera) = manager(gateway.clone(), true);
        let devices = vec![device("a", "wlan0"), device("b", "wlan1")];

        assert!(manager.ensure_all(&devices).await);
        assert_eq!(gateway.radio_commands(), 0);
    }
}
