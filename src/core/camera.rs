//! The camera's HTTP control surface, as seen by the core.
//!
//! Status, shutter, media listing and delete live on the control port; clip
//! bytes are fetched from a separate media port. The core treats the camera
//! as a black box behind [`CameraApi`].

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::models::Device;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera unreachable: {0}")]
    Unreachable(String),
    #[error("camera answered HTTP {0}")]
    Status(u16),
    #[error("camera request timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected media listing: {0}")]
    Malformed(String),
    #[error("downloaded {written} bytes, camera reported {expected}")]
    SizeMismatch { written: u64, expected: u64 },
    #[error("local write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A clip stored on the camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMedia {
    pub folder: String,
    pub name: String,
    pub captured_at: DateTime<Utc>,
    pub size: Option<u64>,
}

impl RemoteMedia {
    /// Path of the clip relative to the camera's storage root.
    pub fn remote_path(&self) -> String {
        format!("/{}/{}", self.folder, self.name)
    }
}

#[async_trait]
pub trait CameraApi: Send + Sync {
    /// `true` only on a 2xx answer from the status endpoint.
    async fn probe(&self, device: &Device, timeout: Duration) -> bool;

    async fn set_shutter(&self, device: &Device, recording: bool) -> Result<(), CameraError>;

    async fn latest_media(&self, device: &Device) -> Result<Option<RemoteMedia>, CameraError>;

    /// Stream a clip to `destination`, returning the bytes written.
    async fn download(
        &self,
        device: &Device,
        media: &RemoteMedia,
        destination: &Path,
    ) -> Result<u64, CameraError>;

    async fn delete(&self, device: &Device, media: &RemoteMedia) -> Result<(), CameraError>;
}

/// Media listing as served by the camera.
#[derive(Debug, Deserialize)]
pub struct MediaListing {
    #[serde(default)]
    pub media: Vec<MediaFolder>,
}

#[derive(Debug, Deserialize)]
pub struct MediaFolder {
    #[serde(rename = "d")]
    pub directory: String,
    #[serde(rename = "fs", default)]
    pub files: Vec<MediaEntry>,
}

#[derive(Debug, Deserialize)]
pub struct MediaEntry {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "mod", default)]
    pub modified: Option<Value>,
    #[serde(rename = "cre", default)]
    pub created: Option<Value>,
    #[serde(rename = "s", default)]
    pub size: Option<Value>,
}

impl MediaListing {
    /// The newest video, i.e. the last `.mp4` in listing order.
    pub fn latest_video(&self) -> Option<RemoteMedia> {
        self.media
            .iter()
            .flat_map(|folder| folder.files.iter().map(move |f| (folder, f)))
            .filter(|(_, f)| f.name.to_ascii_lowercase().ends_with(".mp4"))
            .last()
            .map(|(folder, f)| {
                let raw = f
                    .modified
                    .as_ref()
                    .or(f.created.as_ref())
                    .map(value_text)
                    .unwrap_or_default();
                RemoteMedia {
                    folder: folder.directory.clone(),
                    name: f.name.clone(),
                    captured_at: media_timestamp(&raw),
                    size: f.size.as_ref().and_then(|v| value_text(v).parse().ok()),
                }
            })
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

const COMPACT_FORMATS: &[&str] = &[
    "%Y%m%dT%H%M%S",
    "%Y%m%d%H%M%S",
    "%Y-%m-%dT%H%M%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// Parse a listing timestamp: ISO-8601, compact date-time or epoch seconds.
pub fn parse_media_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if raw.bytes().all(|b| b.is_ascii_digit()) && raw.len() <= 11 {
        return raw
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y%m%dT%H%M%S%z", "%Y-%m-%dT%H%M%S%z"] {
        if let Ok(dt) = DateTime::parse_from_str(raw, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    let naive = raw.strip_suffix('Z').unwrap_or(raw);
    COMPACT_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(naive, f).ok())
        .map(|dt| dt.and_utc())
}

/// Like [`parse_media_timestamp`] but falls back to now.
pub fn media_timestamp(raw: &str) -> DateTime<Utc> {
    parse_media_timestamp(raw).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn expected() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 10, 30, 15).unwrap()
    }

    #[test]
    fn parses_iso8601() {
        assert_eq!(
            parse_media_timestamp("2024-03-05T10:30:15Z"),
            Some(expected())
        );
        assert_eq!(
            parse_media_timestamp("2024-03-05T12:30:15+02:00"),
            Some(expected())
        );
        assert_eq!(
            parse_media_timestamp("2024-03-05T10:30:15"),
            Some(expected())
        );
    }

    #[test]
    fn parses_compact() {
        assert_eq!(parse_media_timestamp("20240305T103015"), Some(expected()));
        assert_eq!(parse_media_timestamp("20240305T103015Z"), Some(expected()));
        assert_eq!(
            parse_media_timestamp("20240305T113015+0100"),
            Some(expected())
        );
    }

    #[test]
    fn parses_epoch_seconds() {
        let secs = expected().timestamp().to_string();
        assert_eq!(parse_media_timestamp(&secs), Some(expected()));
    }

    #[test]
    fn garbage_falls_back_to_now() {
        assert_eq!(parse_media_timestamp("yesterday-ish"), None);
        assert_eq!(parse_media_timestamp(""), None);

        let before = Utc::now();
        let ts = media_timestamp("not a time");
        assert!(ts >= before);
    }

    #[test]
    fn latest_video_is_last_mp4() {
        let listing: MediaListing = serde_json::from_str(
            r#"{
                "id": "1",
                "media": [{
                    "d": "100GOPRO",
                    "fs": [
                        {"n": "GH010001.MP4", "mod": "1709634615", "s": "1000"},
                        {"n": "GH010002.MP4", "mod": "1709634700", "s": "2048"},
                        {"n": "GOPR0003.JPG", "mod": "1709634800"}
                    ]
                }]
            }"#,
        )
        .unwrap();

        let latest = listing.latest_video().unwrap();
        assert_eq!(latest.name, "GH010002.MP4");
        assert_eq!(latest.folder, "100GOPRO");
        assert_eq!(latest.size, Some(2048));
        assert_eq!(latest.remote_path(), "/100GOPRO/GH010002.MP4");
        assert_eq!(latest.captured_at.timestamp(), 1709634700);
    }

    #[test]
    fn numeric_fields_are_accepted() {
        let listing: MediaListing = serde_json::from_str(
            r#"{"media": [{"d": "101GOPRO", "fs": [{"n": "a.mp4", "cre": 1709634615, "s": 5}]}]}"#,
        )
        .unwrap();

        let latest = listing.latest_video().unwrap();
        assert_eq!(latest.captured_at.timestamp(), 1709634615);
        assert_eq!(latest.size, Some(5));
    }

    #[test]
    fn empty_listing_has_no_video() {
        let listing: MediaListing = serde_json::from_str(r#"{"media": []}"#).unwrap();
        assert!(listing.latest_video().is_none());

        let listing: MediaListing = serde_json::from_str("{}").unwrap();
        assert!(listing.latest_video().is_none());
    }
}
