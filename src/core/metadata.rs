//! Plain-text sidecar files describing downloaded and combined clips.

use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};

use crate::core::merge_engine::MergeMethod;
use crate::core::models::Device;

const RULE: &str = "==================================================";
const MB: f64 = 1024.0 * 1024.0;

/// `clip.mp4` -> `clip_metadata.txt`, next to the clip.
pub fn sidecar_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}_metadata.txt"))
}

fn mm_ss(d: Duration) -> String {
    let total = d.as_secs_f64();
    let minutes = (total / 60.0).floor() as u64;
    let seconds = total - minutes as f64 * 60.0;
    format!("{minutes:02}:{seconds:05.2} ({total:.2} seconds)")
}

pub struct ClipInfo<'a> {
    pub clip: &'a Path,
    pub device: &'a Device,
    pub trigger_timestamp: DateTime<Local>,
    pub captured_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub download_time: Duration,
}

pub fn render_clip(info: &ClipInfo<'_>) -> String {
    let size_mb = info.size_bytes as f64 / MB;
    let mut out = String::new();
    let _ = writeln!(out, "Video Metadata");
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "File: {}", file_name(info.clip));
    let _ = writeln!(out, "Camera: {}", info.device.display_name);
    let _ = writeln!(
        out,
        "Trigger Time: {}",
        info.trigger_timestamp.format("%Y-%m-%d %H:%M:%S")
    );
    let _ = writeln!(
        out,
        "Camera Timestamp: {}",
        info.captured_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(out, "Written: {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "File Size: {size_mb:.1} MB");
    let _ = writeln!(out, "Download Time: {}", mm_ss(info.download_time));

    let secs = info.download_time.as_secs_f64();
    if secs > 0.0 {
        let _ = writeln!(
            out,
            "Download Speed: {:.2} Mbps ({:.2} MB/s)",
            size_mb * 8.0 / secs,
            size_mb / secs
        );
    }
    out
}

pub struct CombinedInfo<'a> {
    pub output: &'a Path,
    pub clip_a: &'a Path,
    pub clip_b: &'a Path,
    pub method: MergeMethod,
    pub merge_time: Duration,
    pub size_bytes: u64,
}

pub fn render_combined(info: &CombinedInfo<'_>) -> String {
    let size_a = file_size(info.clip_a);
    let size_b = file_size(info.clip_b);

    let mut out = String::new();
    let _ = writeln!(out, "Combined Video Metadata");
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "Combined File: {}", file_name(info.output));
    let _ = writeln!(out, "Written: {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "Combined File Size: {:.1} MB", info.size_bytes as f64 / MB);
    let _ = writeln!(out, "Method: {}", info.method);
    let _ = writeln!(out, "Combination Time: {}", mm_ss(info.merge_time));
    let _ = writeln!(out);
    let _ = writeln!(out, "Source Videos:");
    let _ = writeln!(out, "{}", &RULE[..30]);
    let _ = writeln!(out, "Video 1: {} ({:.1} MB)", file_name(info.clip_a), size_a / MB);
    let _ = writeln!(out, "Video 2: {} ({:.1} MB)", file_name(info.clip_b), size_b / MB);
    let _ = writeln!(out);
    let _ = writeln!(out, "Total Source Size: {:.1} MB", (size_a + size_b) / MB);
    out
}

pub async fn write_clip(info: &ClipInfo<'_>) -> io::Result<PathBuf> {
    let path = sidecar_path(info.clip);
    tokio::fs::write(&path, render_clip(info)).await?;
    Ok(path)
}

pub async fn write_combined(info: &CombinedInfo<'_>) -> io::Result<PathBuf> {
    let path = sidecar_path(info.output);
    tokio::fs::write(&path, render_combined(info)).await?;
    Ok(path)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn file_size(path: &Path) -> f64 {
    std::fs::metadata(path).map(|m| m.len() as f64).unwrap_or(0.0)
}
