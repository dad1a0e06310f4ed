//! Pluggable backends that append one clip to another.

pub mod ffmpeg;
pub mod simulated;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Merge strategies, fastest and least tolerant first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    /// Container-level concatenation, no re-encoding.
    StreamCopy,
    /// Concat filter graph with the fastest encoder preset.
    FilteredCopy,
    /// Concat filter graph with a balanced quality preset.
    Reencode,
}

impl MergeMethod {
    pub const TIERS: [MergeMethod; 3] = [Self::StreamCopy, Self::FilteredCopy, Self::Reencode];

    pub fn timeout(self) -> Duration {
        match self {
            Self::StreamCopy => Duration::from_secs(30),
            Self::FilteredCopy => Duration::from_secs(120),
            Self::Reencode => Duration::from_secs(300),
        }
    }
}

impl fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StreamCopy => "stream copy",
            Self::FilteredCopy => "filtered copy",
            Self::Reencode => "re-encode",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub clip_a: PathBuf,
    pub clip_b: PathBuf,
    /// Where this attempt writes. Never the final target.
    pub output: PathBuf,
    pub method: MergeMethod,
}

pub trait MergeEngine: Send + Sync {
    /// Run one merge attempt. Dropping the future must stop any work it
    /// started, so callers can bound it with a timeout.
    fn merge(&self, req: &MergeRequest) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;

    /// Confirm the backend can run at all; returns a version string.
    fn check_available(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send>>;
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum MergeEngineType {
    #[default]
    Ffmpeg,
    Simulated,
}

pub fn create_engine(engine_type: MergeEngineType, ffmpeg: &Path) -> Arc<dyn MergeEngine> {
    match engine_type {
        MergeEngineType::Ffmpeg => Arc::new(ffmpeg::FfmpegEngine::new(ffmpeg)),
        MergeEngineType::Simulated => Arc::new(simulated::SimulatedEngine::default()),
    }
}
