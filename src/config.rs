use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::merge_engine::MergeEngineType;
use crate::core::models::Device;

const SYSTEM_CONFIG: &str = "/etc/twincam/config.toml";
const LOCAL_CONFIG: &str = "twincam.toml";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("expected {expected} devices, {found} configured")]
    DeviceCount { expected: usize, found: usize },
    #[error("device id '{0}' is configured twice")]
    DuplicateId(String),
    #[error("display name '{0}' is used by two devices; it names their clip directories")]
    DuplicateDisplayName(String),
    #[error("static host base {base} leaves no address for device {index}")]
    StaticAddressRange { base: u8, index: usize },
    #[error("devices '{first}' and '{second}' are both bound to interface {interface}")]
    SharedInterface {
        interface: String,
        first: String,
        second: String,
    },
    #[error("device '{device}' has an empty {field}")]
    EmptyField { device: String, field: &'static str },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub storage: StorageConfig,
    pub capture: CaptureConfig,
    pub connection: ConnectionConfig,
    pub radio: RadioConfig,
    pub network: NetworkConfig,
    pub camera: CameraConfig,
    pub combination: CombinationConfig,
    pub trigger: TriggerConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub primary_dir: PathBuf,
    pub fallback_dir: PathBuf,
    pub combined_subdir: String,
    /// Downloads abort below this much free space.
    pub min_free_mb: u64,
    /// Anything smaller is treated as a corrupt transfer.
    pub min_clip_kb: u64,
    /// Free space needed for a merge, as a multiple of the largest clip.
    pub combine_headroom: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub record_secs: f64,
    pub finalize_secs: f64,
    pub expected_devices: usize,
}

/// Bounds for the per-device connection state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_attempts: u32,
    /// Radio advertisement warm-up before the first activation.
    pub settle_secs: f64,
    pub backoff_base_secs: f64,
    pub backoff_factor: f64,
    pub backoff_cap_secs: f64,
    /// Linear term added per attempt on top of the exponential delay.
    pub backoff_step_secs: f64,
    pub activation_timeout_secs: f64,
    pub activation_timeout_step_secs: f64,
    pub broadcast_checks: u32,
    pub broadcast_interval_secs: f64,
    /// Number of trailing attempts that also try the non-interactive variant.
    pub fallback_attempts: u32,
    pub fallback_settle_secs: f64,
    pub fast_probe_timeout_secs: f64,
    pub probe_attempts: u32,
    pub probe_interval_secs: f64,
    pub probe_timeout_secs: f64,
    /// Pause between devices when connecting them one after the other.
    pub inter_device_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// argv prefix of the activation tool; address and command are appended.
    pub activation_command: Vec<String>,
    pub interactive_flag: Vec<String>,
    pub adapter: String,
    pub max_resets_per_cycle: u32,
    pub reset_cooldown_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub profile_dir: PathBuf,
    pub country: String,
    /// Leading octets every camera network hands out, e.g. `10.5.5.`.
    pub subnet_prefix: String,
    pub subnet_bits: u8,
    pub static_host_base: u8,
    pub dhcp_timeout_secs: f64,
    pub association_wait_secs: f64,
    pub interface_settle_secs: f64,
    pub scan_timeout_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutterMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub control_port: u16,
    pub media_port: u16,
    pub status_path: String,
    pub shutter_path: String,
    pub shutter_method: ShutterMethod,
    pub media_list_path: String,
    pub delete_path: String,
    /// Prefix under which the media port serves DCIM folders.
    pub media_root: String,
    pub request_timeout_secs: f64,
    pub download_timeout_secs: f64,
    pub connect_timeout_secs: f64,
    /// Bind sockets to each device's interface (SO_BINDTODEVICE, needs CAP_NET_RAW).
    pub bind_interface: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CombinationConfig {
    pub engine: MergeEngineType,
    pub ffmpeg: PathBuf,
    pub queue_poll_ms: u64,
    pub drain_timeout_secs: f64,
    pub join_timeout_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub poll_interval_ms: u64,
    pub debounce_ms: u64,
    pub gpio_chip: String,
    pub input_line: u32,
    pub output_line: u32,
    /// Trigger line reads low while asserted.
    pub input_active_low: bool,
    /// Busy line is driven low while a capture runs.
    pub output_active_low: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub display_name: String,
    pub radio_address: String,
    pub network_name: String,
    pub network_secret: String,
    pub ip_address: IpAddr,
    pub interface: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            simulation: false,
            verbose: false,
            json_logs: false,
            storage: StorageConfig::default(),
            capture: CaptureConfig::default(),
            connection: ConnectionConfig::default(),
            radio: RadioConfig::default(),
            network: NetworkConfig::default(),
            camera: CameraConfig::default(),
            combination: CombinationConfig::default(),
            trigger: TriggerConfig::default(),
            devices: vec![
                DeviceConfig::placeholder("cam-a", "CamA", "wlan0"),
                DeviceConfig::placeholder("cam-b", "CamB", "wlan1"),
            ],
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            primary_dir: PathBuf::from("/home/pi/Clips"),
            fallback_dir: PathBuf::from("/var/lib/twincam/clips"),
            combined_subdir: "Combined".to_string(),
            min_free_mb: 500,
            min_clip_kb: 100,
            combine_headroom: 2.0,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            record_secs: 38.0,
            finalize_secs: 2.0,
            expected_devices: 2,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            settle_secs: 8.0,
            backoff_base_secs: 3.0,
            backoff_factor: 1.5,
            backoff_cap_secs: 15.0,
            backoff_step_secs: 0.5,
            activation_timeout_secs: 20.0,
            activation_timeout_step_secs: 5.0,
            broadcast_checks: 3,
            broadcast_interval_secs: 3.0,
            fallback_attempts: 2,
            fallback_settle_secs: 5.0,
            fast_probe_timeout_secs: 2.0,
            probe_attempts: 5,
            probe_interval_secs: 3.0,
            probe_timeout_secs: 5.0,
            inter_device_secs: 3.0,
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            activation_command: vec![
                "/home/pi/gopro-ble-py/venv/bin/python".to_string(),
                "/home/pi/gopro-ble-py/main.py".to_string(),
            ],
            interactive_flag: vec!["--interactive".to_string(), "true".to_string()],
            adapter: "hci0".to_string(),
            max_resets_per_cycle: 2,
            reset_cooldown_secs: 2.0,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            profile_dir: PathBuf::from("/etc/wpa_supplicant"),
            country: "DE".to_string(),
            subnet_prefix: "10.5.5.".to_string(),
            subnet_bits: 24,
            static_host_base: 100,
            dhcp_timeout_secs: 15.0,
            association_wait_secs: 5.0,
            interface_settle_secs: 3.0,
            scan_timeout_secs: 10.0,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            control_port: 80,
            media_port: 8080,
            status_path: "/gp/gpControl/status".to_string(),
            shutter_path: "/gp/gpControl/command/shutter".to_string(),
            shutter_method: ShutterMethod::Get,
            media_list_path: "/gp/gpMediaList".to_string(),
            delete_path: "/gp/gpControl/command/storage/delete".to_string(),
            media_root: "/videos/DCIM".to_string(),
            request_timeout_secs: 5.0,
            download_timeout_secs: 600.0,
            connect_timeout_secs: 30.0,
            bind_interface: true,
        }
    }
}

impl Default for CombinationConfig {
    fn default() -> Self {
        Self {
            engine: MergeEngineType::Ffmpeg,
            ffmpeg: PathBuf::from("ffmpeg"),
            queue_poll_ms: 1000,
            drain_timeout_secs: 60.0,
            join_timeout_secs: 5.0,
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            debounce_ms: 200,
            gpio_chip: "gpiochip0".to_string(),
            input_line: 17,
            output_line: 27,
            input_active_low: true,
            output_active_low: true,
        }
    }
}

impl DeviceConfig {
    fn placeholder(id: &str, name: &str, interface: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: name.to_string(),
            radio_address: "00:00:00:00:00:00".to_string(),
            network_name: format!("{name} WiFi"),
            network_secret: "changeme".to_string(),
            ip_address: IpAddr::V4(Ipv4Addr::new(10, 5, 5, 9)),
            interface: interface.to_string(),
        }
    }
}

impl AppConfig {
    /// Build the layered configuration.
    ///
    /// Later sources win: defaults, `/etc/twincam/config.toml`, the explicit
    /// `config_path` (or `./twincam.toml`), `TWINCAM_*` variables, then CLI
    /// overrides.
    pub fn new<T: Serialize>(
        config_path: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, figment::Error> {
        let local = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(LOCAL_CONFIG));

        let mut figment = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG))
            .merge(Toml::file(local))
            .merge(Env::prefixed("TWINCAM_").split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract()
    }

    pub fn from_toml_str(content: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(content))
            .extract()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.len() != self.capture.expected_devices {
            return Err(ConfigError::DeviceCount {
                expected: self.capture.expected_devices,
                found: self.devices.len(),
            });
        }
        if self.connection.max_attempts == 0 {
            return Err(ConfigError::Zero("connection.max_attempts"));
        }
        if self.connection.probe_attempts == 0 {
            return Err(ConfigError::Zero("connection.probe_attempts"));
        }

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for device in &self.devices {
            for (field, value) in [
                ("id", &device.id),
                ("display_name", &device.display_name),
                ("radio_address", &device.radio_address),
                ("network_name", &device.network_name),
                ("interface", &device.interface),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigError::EmptyField {
                        device: device.id.clone(),
                        field,
                    });
                }
            }
            if !ids.insert(device.id.as_str()) {
                return Err(ConfigError::DuplicateId(device.id.clone()));
            }
            // Clip directories may land on a case-insensitive filesystem.
            if !names.insert(device.display_name.to_lowercase()) {
                return Err(ConfigError::DuplicateDisplayName(
                    device.display_name.clone(),
                ));
            }
        }

        let last = self.devices.len().saturating_sub(1);
        if usize::from(self.network.static_host_base) + last > 254 {
            return Err(ConfigError::StaticAddressRange {
                base: self.network.static_host_base,
                index: last,
            });
        }

        for (i, first) in self.devices.iter().enumerate() {
            if let Some(second) = self.devices[i + 1..]
                .iter()
                .find(|d| d.interface == first.interface)
            {
                return Err(ConfigError::SharedInterface {
                    interface: first.interface.clone(),
                    first: first.id.clone(),
                    second: second.id.clone(),
                });
            }
        }

        Ok(())
    }

    /// Devices in configuration order. The first is clip A of every merge.
    pub fn devices(&self) -> Vec<Device> {
        self.devices.iter().map(Device::from).collect()
    }

    pub fn device(&self, id: &str) -> Option<Device> {
        self.devices.iter().find(|d| d.id == id).map(Device::from)
    }
}

pub(crate) fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}
