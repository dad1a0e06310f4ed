use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use uuid::Uuid;

use crate::config::DeviceConfig;

/// Format shared by every artifact of one trigger.
pub const LABEL_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// One action camera, bound to its own network interface for the life of
/// the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub display_name: String,
    pub radio_address: String,
    pub network_name: String,
    pub network_secret: String,
    pub ip_address: IpAddr,
    pub interface: String,
}

impl From<&DeviceConfig> for Device {
    fn from(c: &DeviceConfig) -> Self {
        Self {
            id: c.id.clone(),
            display_name: c.display_name.clone(),
            radio_address: c.radio_address.clone(),
            network_name: c.network_name.clone(),
            network_secret: c.network_secret.clone(),
            ip_address: c.ip_address,
            interface: c.interface.clone(),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.interface)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Unverified,
    RadioActivating,
    NetworkAssociating,
    Verified,
    Failed,
}

impl ConnectionState {
    pub fn is_verified(self) -> bool {
        self == Self::Verified
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unverified => "unverified",
            Self::RadioActivating => "radio-activating",
            Self::NetworkAssociating => "network-associating",
            Self::Verified => "verified",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordResult {
    pub succeeded: bool,
    pub error: Option<String>,
}

impl RecordResult {
    pub fn ok() -> Self {
        Self {
            succeeded: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadResult {
    pub succeeded: bool,
    pub local_path: Option<PathBuf>,
    pub size_bytes: u64,
    pub elapsed_seconds: f64,
    pub error: Option<String>,
}

impl DownloadResult {
    pub fn ok(local_path: PathBuf, size_bytes: u64, elapsed: Duration) -> Self {
        Self {
            succeeded: true,
            local_path: Some(local_path),
            size_bytes,
            elapsed_seconds: elapsed.as_secs_f64(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            succeeded: false,
            local_path: None,
            size_bytes: 0,
            elapsed_seconds: elapsed.as_secs_f64(),
            error: Some(error.into()),
        }
    }
}

/// One trigger's record-and-download cycle.
///
/// Result maps are keyed by device id and each entry is written once.
#[derive(Debug, Clone)]
pub struct CaptureJob {
    pub id: Uuid,
    pub trigger_timestamp: DateTime<Local>,
    pub duration: Duration,
    pub records: BTreeMap<String, RecordResult>,
    pub downloads: BTreeMap<String, DownloadResult>,
    pub combination: Option<CombinationJob>,
}

impl CaptureJob {
    pub fn new(trigger_timestamp: DateTime<Local>, duration: Duration) -> Self {
        Self {
            id: Uuid::now_v7(),
            trigger_timestamp,
            duration,
            records: BTreeMap::new(),
            downloads: BTreeMap::new(),
            combination: None,
        }
    }

    pub fn label(&self) -> String {
        self.trigger_timestamp.format(LABEL_FORMAT).to_string()
    }

    pub fn set_record(&mut self, device_id: &str, result: RecordResult) {
        self.records.entry(device_id.to_string()).or_insert(result);
    }

    pub fn set_download(&mut self, device_id: &str, result: DownloadResult) {
        self.downloads.entry(device_id.to_string()).or_insert(result);
    }

    pub fn records_ok(&self) -> usize {
        self.records.values().filter(|r| r.succeeded).count()
    }

    pub fn downloads_ok(&self) -> usize {
        self.downloads.values().filter(|r| r.succeeded).count()
    }

    pub fn recorded(&self, device_id: &str) -> bool {
        self.records.get(device_id).is_some_and(|r| r.succeeded)
    }

    /// Local clip for a device, if its download verified.
    pub fn clip(&self, device_id: &str) -> Option<&PathBuf> {
        self.downloads
            .get(device_id)
            .filter(|d| d.succeeded)
            .and_then(|d| d.local_path.as_ref())
    }
}

/// A queued request to append clip B to clip A.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinationJob {
    pub clip_a: PathBuf,
    pub clip_b: PathBuf,
    pub output: PathBuf,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job() -> CaptureJob {
        let ts = Local.with_ymd_and_hms(2025, 6, 1, 14, 3, 9).unwrap();
        CaptureJob::new(ts, Duration::from_secs(38))
    }

    #[test]
    fn label_uses_trigger_time() {
        assert_eq!(job().label(), "2025-06-01_14-03-09");
    }

    #[test]
    fn results_are_write_once() {
        let mut job = job();
        job.set_record("a", RecordResult::ok());
        job.set_record("a", RecordResult::failed("late overwrite"));
        assert!(job.recorded("a"));

        job.set_download("a", DownloadResult::failed("disk full", Duration::ZERO));
        job.set_download(
            "a",
            DownloadResult::ok(PathBuf::from("/x.mp4"), 10, Duration::ZERO),
        );
        assert_eq!(job.downloads_ok(), 0);
        assert!(job.clip("a").is_none());
    }

    #[test]
    fn counts_only_successes() {
        let mut job = job();
        job.set_record("a", RecordResult::ok());
        job.set_record("b", RecordResult::failed("shutter refused"));
        job.set_download(
            "a",
            DownloadResult::ok(PathBuf::from("/a.mp4"), 1 << 20, Duration::from_secs(4)),
        );

        assert_eq!(job.records_ok(), 1);
        assert_eq!(job.downloads_ok(), 1);
        assert_eq!(job.clip("a"), Some(&PathBuf::from("/a.mp4")));
    }
}
