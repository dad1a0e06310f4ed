use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use anyhow::{Context, Result, anyhow, bail};
use tokio::process::Command;
use tracing::debug;

use crate::core::merge_engine::{MergeEngine, MergeMethod, MergeRequest};

const CONCAT_GRAPH: &str = "[0:v][0:a][1:v][1:a]concat=n=2:v=1:a=1[outv][outa]";

/// Merges with an external `ffmpeg` binary.
pub struct FfmpegEngine {
    binary: PathBuf,
}

impl FfmpegEngine {
    pub fn new(binary: &Path) -> Self {
        Self {
            binary: binary.to_path_buf(),
        }
    }
}

impl MergeEngine for FfmpegEngine {
    fn merge(&self, req: &MergeRequest) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        let req = req.clone();
        let binary = self.binary.clone();

        Box::pin(async move {
            // Held until ffmpeg exits; the list file is removed on drop.
            let mut list_file = None;

            let args = match req.method {
                MergeMethod::StreamCopy => {
                    let list = concat_list(&req.clip_a, &req.clip_b)?;
                    let args = stream_copy_args(list.path(), &req.output);
                    list_file = Some(list);
                    args
                }
                MergeMethod::FilteredCopy => filter_args(
                    &req,
                    &["-c:v", "libx264", "-preset", "ultrafast", "-c:a", "aac", "-b:a", "128k", "-movflags", "+faststart"],
                ),
                MergeMethod::Reencode => filter_args(
                    &req,
                    &["-c:v", "libx264", "-preset", "fast", "-crf", "23", "-c:a", "aac", "-b:a", "192k"],
                ),
            };

            debug!(method = %req.method, ?args, "Running ffmpeg");

            let output = Command::new(&binary)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await
                .with_context(|| format!("Failed to spawn {}", binary.display()))?;

            drop(list_file);

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let tail: String = stderr
                    .lines()
                    .rev()
                    .take(3)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect::<Vec<_>>()
                    .join(" | ");
                bail!("ffmpeg exited with {}: {}", output.status, tail);
            }
            Ok(())
        })
    }

    fn check_available(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send>> {
        let binary = self.binary.clone();
        Box::pin(async move {
            let output = Command::new(&binary)
                .arg("-version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .with_context(|| format!("{} not found", binary.display()))?;

            if !output.status.success() {
                return Err(anyhow!("{} -version exited with {}", binary.display(), output.status));
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(stdout.lines().next().unwrap_or_default().to_string())
        })
    }
}

/// Concat demuxer input listing both clips by absolute path.
fn concat_list(a: &Path, b: &Path) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("twincam-concat-")
        .suffix(".txt")
        .tempfile()
        .context("Failed to create concat list")?;
    for clip in [a, b] {
        let path = std::path::absolute(clip)
            .with_context(|| format!("Failed to resolve {}", clip.display()))?;
        writeln!(file, "file '{}'", escape_single_quotes(&path.to_string_lossy()))?;
    }
    file.flush()?;
    Ok(file)
}

fn escape_single_quotes(s: &str) -> String {
    s.replace('\'', r"'\''")
}

fn stream_copy_args(list: &Path, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = ["-y", "-f", "concat", "-safe", "0", "-i"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.push(list.display().to_string());
    args.extend(
        ["-c", "copy", "-avoid_negative_ts", "make_zero", "-f", "mp4"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.push(output.display().to_string());
    args
}

fn filter_args(req: &MergeRequest, codec: &[&str]) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-i".to_string(),
        req.clip_a.display().to_string(),
        "-i".to_string(),
        req.clip_b.display().to_string(),
        "-filter_complex".to_string(),
        CONCAT_GRAPH.to_string(),
        "-map".to_string(),
        "[outv]".to_string(),
        "-map".to_string(),
        "[outa]".to_string(),
    ];
    args.extend(codec.iter().map(|s| s.to_string()));
    // Attempts write to a `.part` path, so the container can't be inferred.
    args.extend(["-f".to_string(), "mp4".to_string()]);
    args.push(req.output.display().to_string());
    args
}
