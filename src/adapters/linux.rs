use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::adapters::command::{self, CommandError};
use crate::adapters::wpa;
use crate::config::{NetworkConfig, RadioConfig, secs};
use crate::core::gateway::{ActivationFailure, ActivationMode, DeviceGateway};
use crate::core::models::Device;

const SHORT: Duration = Duration::from_secs(5);
const SERVICE: Duration = Duration::from_secs(10);

/// Drives the host's BLE tool, Bluetooth adapter and WiFi interfaces.
/// Expects to run as root.
pub struct LinuxGateway {
    radio: RadioConfig,
    network: NetworkConfig,
    /// Device interfaces in configuration order.
    interfaces: Vec<String>,
}

impl LinuxGateway {
    pub fn new(radio: RadioConfig, network: NetworkConfig, devices: &[Device]) -> Self {
        Self {
            radio,
            network,
            interfaces: devices.iter().map(|d| d.interface.clone()).collect(),
        }
    }

    fn activation_argv(&self, device: &Device, mode: ActivationMode) -> Vec<String> {
        let mut argv = self.radio.activation_command.clone();
        if mode == ActivationMode::Interactive {
            argv.extend(self.radio.interactive_flag.iter().cloned());
        }
        argv.extend([
            "--address".to_string(),
            device.radio_address.clone(),
            "--command".to_string(),
            "wifi on".to_string(),
        ]);
        argv
    }

    /// Static address used when DHCP hands out nothing usable. The host part
    /// is the base plus the interface's position among the configured
    /// devices, so interface naming never matters.
    fn static_address(&self, interface: &str) -> Option<String> {
        let position = self.interfaces.iter().position(|i| i == interface)?;
        let host = u8::try_from(usize::from(self.network.static_host_base) + position).ok()?;
        Some(format!(
            "{}{host}/{}",
            self.network.subnet_prefix, self.network.subnet_bits
        ))
    }

    async fn teardown_interface(&self, interface: &str) {
        let wpa_pattern = format!("wpa_supplicant.*{interface}");
        let dhcp_pattern = format!("dhclient.*{interface}");
        command::succeeds("pkill", &["-9", "-f", &wpa_pattern], SHORT).await;
        command::succeeds("pkill", &["-9", "-f", &dhcp_pattern], SHORT).await;
        let _ = tokio::fs::remove_file(format!("/var/run/wpa_supplicant/{interface}")).await;

        command::succeeds("ip", &["link", "set", interface, "down"], SHORT).await;
        command::succeeds("ip", &["addr", "flush", "dev", interface], SHORT).await;
        sleep(Duration::from_secs(2)).await;
        command::succeeds("ip", &["link", "set", interface, "up"], SHORT).await;
        sleep(secs(self.network.interface_settle_secs)).await;
    }
}

#[async_trait]
impl DeviceGateway for LinuxGateway {
    async fn interface_exists(&self, interface: &str) -> bool {
        command::succeeds("ip", &["link", "show", interface], SHORT).await
    }

    async fn activate_wireless(
        &self,
        device: &Device,
        timeout: Duration,
        mode: ActivationMode,
    ) -> Result<(), ActivationFailure> {
        let argv = self.activation_argv(device, mode);
        match command::run_argv(&argv, timeout).await {
            Ok(out) if out.success => Ok(()),
            Ok(out) => {
                let text = out.text();
                debug!(device = %device.id, output = %text.trim(), "Activation tool failed");
                Err(ActivationFailure::classify(&text))
            }
            Err(CommandError::Timeout { .. }) => Err(ActivationFailure::Timeout),
            Err(e) => {
                warn!(device = %device.id, error = %e, "Activation tool did not run");
                Err(ActivationFailure::Unknown)
            }
        }
    }

    async fn network_visible(&self, device: &Device) -> bool {
        let timeout = secs(self.network.scan_timeout_secs);
        match command::run("iwlist", &[&device.interface, "scan"], timeout).await {
            Ok(out) => out.stdout.contains(&device.network_name),
            Err(e) => {
                debug!(device = %device.id, error = %e, "Scan failed");
                false
            }
        }
    }

    async fn reset_radio(&self) -> Result<()> {
        let adapter = self.radio.adapter.as_str();

        command::succeeds("systemctl", &["stop", "bluetooth"], SERVICE).await;
        sleep(Duration::from_secs(1)).await;
        command::succeeds("hciconfig", &[adapter, "down"], SHORT).await;
        sleep(Duration::from_secs(1)).await;
        command::succeeds("hciconfig", &[adapter, "up"], SHORT).await;
        sleep(Duration::from_secs(1)).await;
        command::succeeds("systemctl", &["start", "bluetooth"], SERVICE).await;
        sleep(Duration::from_secs(2)).await;

        let out = command::run("hciconfig", &[adapter], SHORT)
            .await
            .context("Failed to query Bluetooth adapter")?;
        if !out.success || !out.stdout.contains("UP RUNNING") {
            bail!("{adapter} is not UP RUNNING after reset");
        }
        info!(adapter, "Bluetooth adapter reset");
        Ok(())
    }

    async fn associate_network(&self, device: &Device) -> Result<()> {
        let iface = device.interface.as_str();
        self.teardown_interface(iface).await;

        let profile = wpa::ensure_profile(
            &self.network.profile_dir,
            iface,
            &self.network.country,
            &device.network_name,
            &device.network_secret,
        )
        .await?;
        let profile = profile.to_string_lossy().into_owned();

        let out = command::run("wpa_supplicant", &["-B", "-i", iface, "-c", &profile], SERVICE)
            .await
            .context("Failed to start wpa_supplicant")?;
        if !out.success {
            bail!("wpa_supplicant failed on {iface}: {}", out.stderr.trim());
        }
        sleep(secs(self.network.association_wait_secs)).await;

        // A missing lease is handled below with a static address.
        let dhcp = secs(self.network.dhcp_timeout_secs);
        if let Err(e) = command::run("dhclient", &[iface], dhcp).await {
            debug!(interface = iface, error = %e, "dhclient gave up");
        }

        let addr = command::run("ip", &["addr", "show", iface], SHORT)
            .await
            .context("Failed to read interface addresses")?;
        let expected = format!("inet {}", self.network.subnet_prefix);
        if !addr.stdout.contains(&expected) {
            let static_addr = self
                .static_address(iface)
                .with_context(|| format!("{iface} has no static address slot"))?;
            warn!(interface = iface, address = %static_addr, "No lease, assigning static address");
            command::run("ip", &["addr", "add", &static_addr, "dev", iface], SHORT)
                .await
                .context("Failed to assign static address")?;
        }

        let host_route = format!("{}/32", device.ip_address);
        let route = command::run("ip", &["route", "replace", &host_route, "dev", iface], SHORT)
            .await
            .context("Failed to install host route")?;
        if !route.success {
            bail!("route to {host_route} via {iface} failed: {}", route.stderr.trim());
        }

        info!(device = %device.id, interface = iface, "Network associated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn device_on(interface: &str) -> Device {
        Device {
            id: "gopro1".into(),
            display_name: "GoPro1".into(),
            radio_address: "D0:21:F8:9C:FF:80".into(),
            network_name: "GP25".into(),
            network_secret: "pw".into(),
            ip_address: IpAddr::V4(Ipv4Addr::new(10, 5, 5, 9)),
            interface: interface.into(),
        }
    }

    fn device() -> Device {
        device_on("wlan1")
    }

    fn gateway_for(interfaces: &[&str]) -> LinuxGateway {
        let devices: Vec<Device> = interfaces.iter().map(|i| device_on(i)).collect();
        LinuxGateway::new(RadioConfig::default(), NetworkConfig::default(), &devices)
    }

    fn gateway() -> LinuxGateway {
        gateway_for(&["wlan0", "wlan1"])
    }

    #[test]
    fn static_address_follows_device_order() {
        let g = gateway_for(&["wlan1", "wlan0"]);
        assert_eq!(g.static_address("wlan1").as_deref(), Some("10.5.5.100/24"));
        assert_eq!(g.static_address("wlan0").as_deref(), Some("10.5.5.101/24"));
    }

    #[test]
    fn mac_named_interfaces_get_distinct_addresses() {
        let g = gateway_for(&["wlx001122aabbcc", "wlx334455ddeeff"]);
        assert_eq!(
            g.static_address("wlx001122aabbcc").as_deref(),
            Some("10.5.5.100/24")
        );
        assert_eq!(
            g.static_address("wlx334455ddeeff").as_deref(),
            Some("10.5.5.101/24")
        );
        assert_eq!(g.static_address("wlan9"), None);
    }

    #[test]
    fn fallback_drops_interactive_flag() {
        let g = gateway();
        let interactive = g.activation_argv(&device(), ActivationMode::Interactive);
        let plain = g.activation_argv(&device(), ActivationMode::NonInteractive);

        assert!(interactive.contains(&"--interactive".to_string()));
        assert!(!plain.contains(&"--interactive".to_string()));
        assert_eq!(
            &plain[plain.len() - 4..],
            ["--address", "D0:21:F8:9C:FF:80", "--command", "wifi on"]
        );
    }

    #[tokio::test]
    async fn unknown_interface_does_not_exist() {
        assert!(!gateway().interface_exists("twincam-test-none0").await);
    }
}
