//! On-disk layout for downloaded and combined clips.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use nix::sys::statvfs::statvfs;
use tracing::{info, warn};

use crate::core::models::Device;

const PROBE_FILE: &str = ".twincam_write_probe";
const PART_SUFFIX: &str = "part";

#[derive(Debug, Clone)]
pub struct StorageLayout {
    base: PathBuf,
    combined: PathBuf,
    fallback: bool,
}

impl StorageLayout {
    /// Pick the base directory once: the primary if a write probe succeeds,
    /// otherwise the fallback. Fails only if neither is writable.
    pub fn resolve(primary: &Path, fallback: &Path, combined_subdir: &str) -> Result<Self> {
        let (base, is_fallback) = if is_writable(primary) {
            (primary.to_path_buf(), false)
        } else if is_writable(fallback) {
            warn!(
                primary = %primary.display(),
                fallback = %fallback.display(),
                "Primary storage not writable, using fallback"
            );
            (fallback.to_path_buf(), true)
        } else {
            bail!(
                "neither {} nor {} is writable",
                primary.display(),
                fallback.display()
            );
        };

        let combined = base.join(combined_subdir);
        fs::create_dir_all(&combined)
            .with_context(|| format!("Failed to create {}", combined.display()))?;

        info!(base = %base.display(), "Storage ready");
        Ok(Self {
            base,
            combined,
            fallback: is_fallback,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    pub fn combined_dir(&self) -> &Path {
        &self.combined
    }

    /// Display names are unique per configuration, so each device owns its
    /// directory.
    pub fn device_dir(&self, device: &Device) -> PathBuf {
        self.base.join(&device.display_name)
    }

    pub fn ensure_device_dirs(&self, devices: &[Device]) -> Result<()> {
        for device in devices {
            let dir = self.device_dir(device);
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// `<device dir>/<label>_<display name>_<remote name>`; two cameras that
    /// hand out the same file name never collide.
    pub fn clip_path(&self, device: &Device, label: &str, remote_name: &str) -> PathBuf {
        self.device_dir(device)
            .join(format!("{label}_{}_{remote_name}", device.display_name))
    }

    pub fn combined_path(&self, label: &str, a: &Device, b: &Device) -> PathBuf {
        self.combined.join(format!(
            "{label}_Combined_{}+{}.mp4",
            a.display_name, b.display_name
        ))
    }
}

fn is_writable(dir: &Path) -> bool {
    if fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(PROBE_FILE);
    let ok = fs::write(&probe, b"ok").is_ok();
    let _ = fs::remove_file(&probe);
    ok
}

/// Sibling path a transfer or merge writes to before it is verified.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(PART_SUFFIX);
    path.with_file_name(name)
}

/// Bytes available to unprivileged writers on the filesystem holding `path`.
pub fn available_bytes(path: &Path) -> io::Result<u64> {
    let stat = statvfs(path).map_err(io::Error::from)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceCheck {
    Ok,
    /// Under twice the floor; worth a warning.
    Low,
    Insufficient,
}

pub fn classify_space(available: u64, floor: u64) -> SpaceCheck {
    if available < floor {
        SpaceCheck::Insufficient
    } else if available < floor.saturating_mul(2) {
        SpaceCheck::Low
    } else {
        SpaceCheck::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::tempdir;

    fn device(name: &str) -> Device {
        Device {
            id: name.to_lowercase(),
            display_name: name.into(),
            radio_address: "AA:BB:CC:DD:EE:FF".into(),
            network_name: format!("{name} WiFi"),
            network_secret: "pw".into(),
            ip_address: IpAddr::V4(Ipv4Addr::new(10, 5, 5, 9)),
            interface: "wlan0".into(),
        }
    }

    #[test]
    fn primary_wins_when_writable() {
        let root = tempdir().unwrap();
        let primary = root.path().join("clips");
        let fallback = root.path().join("fallback");

        let layout = StorageLayout::resolve(&primary, &fallback, "Combined").unwrap();
        assert_eq!(layout.base(), primary);
        assert!(!layout.is_fallback());
        assert!(layout.combined_dir().is_dir());
        assert!(!primary.join(PROBE_FILE).exists());
    }

    #[test]
    fn falls_back_when_primary_unusable() {
        let root = tempdir().unwrap();
        let blocker = root.path().join("not-a-dir");
        fs::write(&blocker, b"file").unwrap();
        let fallback = root.path().join("fallback");

        let layout =
            StorageLayout::resolve(&blocker.join("clips"), &fallback, "Combined").unwrap();
        assert!(layout.is_fallback());
        assert_eq!(layout.combined_dir(), fallback.join("Combined"));
    }

    #[test]
    fn fails_when_nothing_is_writable() {
        let root = tempdir().unwrap();
        let blocker = root.path().join("file");
        fs::write(&blocker, b"file").unwrap();

        assert!(StorageLayout::resolve(&blocker.join("a"), &blocker.join("b"), "C").is_err());
    }

    #[test]
    fn same_remote_name_never_collides() {
        let root = tempdir().unwrap();
        let layout = StorageLayout::resolve(root.path(), root.path(), "Combined").unwrap();
        let (a, b) = (device("GoPro1"), device("GoPro3"));

        let pa = layout.clip_path(&a, "2025-06-01_14-03-09", "GH010042.MP4");
        let pb = layout.clip_path(&b, "2025-06-01_14-03-09", "GH010042.MP4");
        assert_ne!(pa, pb);
        assert!(pa.ends_with("GoPro1/2025-06-01_14-03-09_GoPro1_GH010042.MP4"));

        let combined = layout.combined_path("2025-06-01_14-03-09", &a, &b);
        assert!(combined.ends_with("Combined/2025-06-01_14-03-09_Combined_GoPro1+GoPro3.mp4"));
    }

    #[test]
    fn partial_path_is_a_sibling() {
        let p = partial_path(Path::new("/clips/GoPro1/x.MP4"));
        assert_eq!(p, Path::new("/clips/GoPro1/x.MP4.part"));
    }

    #[test]
    fn space_thresholds() {
        let floor = 500;
        assert_eq!(classify_space(499, floor), SpaceCheck::Insufficient);
        assert_eq!(classify_space(500, floor), SpaceCheck::Low);
        assert_eq!(classify_space(999, floor), SpaceCheck::Low);
        assert_eq!(classify_space(1000, floor), SpaceCheck::Ok);
    }

    #[test]
    fn available_bytes_reads_real_filesystem() {
        let root = tempdir().unwrap();
        assert!(available_bytes(root.path()).unwrap() > 0);
    }
}
