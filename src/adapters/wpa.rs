//! Per-interface wpa_supplicant credential profiles.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub fn profile_path(dir: &Path, interface: &str) -> PathBuf {
    dir.join(format!("wpa_supplicant_{interface}.conf"))
}

fn header(country: &str) -> String {
    format!("ctrl_interface=DIR=/var/run/wpa_supplicant GROUP=netdev\nupdate_config=1\ncountry={country}\n")
}

fn network_block(ssid: &str, psk: &str) -> String {
    format!("\nnetwork={{\n    ssid=\"{ssid}\"\n    psk=\"{psk}\"\n    key_mgmt=WPA-PSK\n}}\n")
}

/// Make sure the profile for `interface` exists and knows `ssid`. Creates the
/// file if needed and appends a network block only when none names `ssid`,
/// so repeated calls never duplicate entries.
pub async fn ensure_profile(
    dir: &Path,
    interface: &str,
    country: &str,
    ssid: &str,
    psk: &str,
) -> Result<PathBuf> {
    let path = profile_path(dir, interface);

    let existing = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let content = header(country);
            tokio::fs::write(&path, &content)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            info!(profile = %path.display(), "Created supplicant profile");
            content
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    if existing.contains(&format!("ssid=\"{ssid}\"")) {
        debug!(profile = %path.display(), ssid, "Network already in profile");
        return Ok(path);
    }

    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(network_block(ssid, psk).as_bytes()).await?;
    file.flush().await?;
    info!(profile = %path.display(), ssid, "Added network to profile");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn creates_profile_with_header_and_network() {
        let dir = tempdir().unwrap();
        let path = ensure_profile(dir.path(), "wlan0", "DE", "GP25", "secret").await.unwrap();

        assert_eq!(path, dir.path().join("wpa_supplicant_wlan0.conf"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("ctrl_interface=DIR=/var/run/wpa_supplicant GROUP=netdev\n"));
        assert!(content.contains("country=DE\n"));
        assert!(content.contains("ssid=\"GP25\""));
        assert!(content.contains("psk=\"secret\""));
    }

    #[tokio::test]
    async fn repeated_calls_do_not_duplicate() {
        let dir = tempdir().unwrap();
        for _ in 0..3 {
            ensure_profile(dir.path(), "wlan1", "DE", "GP25", "secret").await.unwrap();
        }
        let content = std::fs::read_to_string(profile_path(dir.path(), "wlan1")).unwrap();
        assert_eq!(content.matches("network={").count(), 1);
    }

    #[tokio::test]
    async fn new_network_is_appended_to_existing_profile() {
        let dir = tempdir().unwrap();
        let path = profile_path(dir.path(), "wlan0");
        std::fs::write(&path, "country=US\nnetwork={\n    ssid=\"Home\"\n}\n").unwrap();

        ensure_profile(dir.path(), "wlan0", "DE", "GP25", "pw").await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("country=US"));
        assert!(content.contains("ssid=\"Home\""));
        assert!(content.contains("ssid=\"GP25\""));
        assert_eq!(content.matches("network={").count(), 2);
    }
}
