use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use tokio::io::AsyncWriteExt;
use tokio::time::{Duration, sleep};

use crate::core::merge_engine::{MergeEngine, MergeMethod, MergeRequest};

/// Byte-level concatenation with scriptable failures, for running without
/// ffmpeg.
#[derive(Default)]
pub struct SimulatedEngine {
    /// Pause per attempt, to mimic encoder latency.
    pub delay: Duration,
    /// Methods that write some junk and then fail.
    pub failing: Vec<MergeMethod>,
    attempts: Arc<Mutex<Vec<MergeRequest>>>,
}

impl SimulatedEngine {
    pub fn failing(methods: &[MergeMethod]) -> Self {
        Self {
            failing: methods.to_vec(),
            ..Default::default()
        }
    }

    /// Every request seen so far, in order.
    pub fn attempts(&self) -> Vec<MergeRequest> {
        self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl MergeEngine for SimulatedEngine {
    fn merge(&self, req: &MergeRequest) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        let req = req.clone();
        let delay = self.delay;
        let fail = self.failing.contains(&req.method);
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(req.clone());
        }

        Box::pin(async move {
            sleep(delay).await;

            let mut out = tokio::fs::File::create(&req.output).await?;
            if fail {
                out.write_all(b"half-written").await?;
                bail!("simulated {} failure", req.method);
            }

            for clip in [&req.clip_a, &req.clip_b] {
                let bytes = tokio::fs::read(clip).await?;
                out.write_all(&bytes).await?;
            }
            out.flush().await?;
            Ok(())
        })
    }

    fn check_available(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send>> {
        Box::pin(async { Ok("simulated merge engine".to_string()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn concatenates_bytes() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.mp4");
        let b = dir.path().join("b.mp4");
        std::fs::write(&a, b"AAA").unwrap();
        std::fs::write(&b, b"BB").unwrap();

        let engine = SimulatedEngine::default();
        let req = MergeRequest {
            clip_a: a,
            clip_b: b,
            output: dir.path().join("out.part"),
            method: MergeMethod::StreamCopy,
        };
        engine.merge(&req).await.unwrap();

        assert_eq!(std::fs::read(&req.output).unwrap(), b"AAABB");
        assert_eq!(engine.attempts(), vec![req]);
    }

    #[tokio::test]
    async fn scripted_failure() {
        let dir = tempdir().unwrap();
        let engine = SimulatedEngine::failing(&[MergeMethod::StreamCopy]);
        let req = MergeRequest {
            clip_a: dir.path().join("a"),
            clip_b: dir.path().join("b"),
            output: dir.path().join("out.part"),
            method: MergeMethod::StreamCopy,
        };
        assert!(engine.merge(&req).await.is_err());
    }
}
