//! Capture session coordinator: record on every device at once, download in
//! parallel, and hand the pair to the combination worker when both landed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use filetime::FileTime;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{AppConfig, secs};
use crate::core::camera::CameraApi;
use crate::core::combiner::CombinationQueue;
use crate::core::metadata::{self, ClipInfo};
use crate::core::models::{CaptureJob, CombinationJob, Device, DownloadResult, RecordResult};
use crate::core::state::ConnectionTracker;
use crate::core::storage::{self, SpaceCheck, StorageLayout, classify_space, partial_path};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("capture needs exactly {expected} devices, got {found}")]
    DeviceCountMismatch { expected: usize, found: usize },
    #[error("device '{0}' is not verified")]
    NotVerified(String),
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub record: Duration,
    pub finalize: Duration,
    pub expected_devices: usize,
    pub min_free_bytes: u64,
    pub min_clip_bytes: u64,
    pub combine_headroom: f64,
}

impl From<&AppConfig> for CaptureSettings {
    fn from(c: &AppConfig) -> Self {
        Self {
            record: secs(c.capture.record_secs),
            finalize: secs(c.capture.finalize_secs),
            expected_devices: c.capture.expected_devices,
            min_free_bytes: c.storage.min_free_mb * 1024 * 1024,
            min_clip_bytes: c.storage.min_clip_kb * 1024,
            combine_headroom: c.storage.combine_headroom,
        }
    }
}

pub struct CaptureCoordinator {
    camera: Arc<dyn CameraApi>,
    tracker: ConnectionTracker,
    storage: StorageLayout,
    queue: Option<CombinationQueue>,
    settings: CaptureSettings,
}

impl CaptureCoordinator {
    /// `queue` is `None` when no merge backend is available; captures still
    /// record and download.
    pub fn new(
        camera: Arc<dyn CameraApi>,
        tracker: ConnectionTracker,
        storage: StorageLayout,
        queue: Option<CombinationQueue>,
        settings: CaptureSettings,
    ) -> Self {
        Self {
            camera,
            tracker,
            storage,
            queue,
            settings,
        }
    }

    /// Run one capture cycle. Refuses to start unless every device is
    /// verified; after that, per-device failures only show up in the job.
    pub async fn run_capture_job(&self, devices: &[Device]) -> Result<CaptureJob, CaptureError> {
        if devices.len() != self.settings.expected_devices {
            return Err(CaptureError::DeviceCountMismatch {
                expected: self.settings.expected_devices,
                found: devices.len(),
            });
        }
        for device in devices {
            if !self.tracker.get(&device.id).await.is_verified() {
                return Err(CaptureError::NotVerified(device.id.clone()));
            }
        }

        // One timestamp labels every artifact of this trigger.
        let job = CaptureJob::new(Local::now(), self.settings.record);
        let span = info_span!("capture_job", job_id = %job.id, label = %job.label());
        Ok(self.run(job, devices).instrument(span).await)
    }

    async fn run(&self, mut job: CaptureJob, devices: &[Device]) -> CaptureJob {
        let n = devices.len();
        info!(devices = n, record_s = job.duration.as_secs_f64(), "Starting capture");

        for (id, result) in self.record_all(devices, job.duration).await {
            job.set_record(&id, result);
        }
        info!(records_ok = job.records_ok(), of = n, "Recording phase done");

        sleep(self.settings.finalize).await;

        let (recorded, skipped): (Vec<Device>, Vec<Device>) = devices
            .iter()
            .cloned()
            .partition(|d| job.recorded(&d.id));
        for device in &skipped {
            job.set_download(
                &device.id,
                DownloadResult::failed("not recorded, download skipped", Duration::ZERO),
            );
        }
        for (id, result) in self.download_all(&recorded, &job).await {
            job.set_download(&id, result);
        }

        info!(
            records_ok = job.records_ok(),
            downloads_ok = job.downloads_ok(),
            of = n,
            "Capture finished"
        );

        self.maybe_enqueue(&mut job, devices).await;
        job
    }

    async fn record_all(&self, devices: &[Device], hold: Duration) -> Vec<(String, RecordResult)> {
        let mut set = JoinSet::new();
        for device in devices {
            let camera = self.camera.clone();
            let device = device.clone();
            set.spawn(
                async move {
                    let result = record_one(camera.as_ref(), &device, hold).await;
                    (device.id, result)
                }
                .in_current_span(),
            );
        }
        join_results(set, devices, RecordResult::failed).await
    }

    async fn download_all(&self, devices: &[Device], job: &CaptureJob) -> Vec<(String, DownloadResult)> {
        let mut set = JoinSet::new();
        for device in devices {
            let ctx = DownloadContext {
                camera: self.camera.clone(),
                storage: self.storage.clone(),
                settings: self.settings.clone(),
                label: job.label(),
                trigger_timestamp: job.trigger_timestamp,
            };
            let device = device.clone();
            set.spawn(
                async move {
                    let result = ctx.download_one(&device).await;
                    (device.id, result)
                }
                .in_current_span(),
            );
        }
        join_results(set, devices, |e| DownloadResult::failed(e, Duration::ZERO)).await
    }

    async fn maybe_enqueue(&self, job: &mut CaptureJob, devices: &[Device]) {
        let [a, b] = devices else {
            info!(devices = devices.len(), "Combination needs exactly two clips, skipping");
            return;
        };
        let (Some(clip_a), Some(clip_b)) = (job.clip(&a.id).cloned(), job.clip(&b.id).cloned()) else {
            info!(
                downloads_ok = job.downloads_ok(),
                of = devices.len(),
                "Not every download succeeded, skipping combination"
            );
            return;
        };
        let Some(queue) = &self.queue else {
            warn!("Combination unavailable, keeping separate clips");
            return;
        };

        let largest = job
            .downloads
            .values()
            .map(|d| d.size_bytes)
            .max()
            .unwrap_or(0);
        let needed = (largest as f64 * self.settings.combine_headroom) as u64;
        match storage::available_bytes(self.storage.combined_dir()) {
            Ok(available) if available < needed => {
                warn!(
                    available_mb = available / (1024 * 1024),
                    needed_mb = needed / (1024 * 1024),
                    "Not enough space to combine, skipping"
                );
                return;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not read free space, combining anyway"),
        }

        let combination = CombinationJob {
            clip_a,
            clip_b,
            output: self.storage.combined_path(&job.label(), a, b),
            timestamp: job.label(),
        };
        if queue.enqueue(combination.clone()) {
            job.combination = Some(combination);
        }
    }
}

/// Collect one result per device. A panicked task counts as a failure for
/// the device it was working on, never for the others.
async fn join_results<T>(
    mut set: JoinSet<(String, T)>,
    devices: &[Device],
    on_panic: impl Fn(String) -> T,
) -> Vec<(String, T)>
where
    T: Send + 'static,
{
    let mut results = Vec::with_capacity(devices.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(pair) => results.push(pair),
            Err(e) => error!(error = %e, "Device task aborted"),
        }
    }
    for device in devices {
        if !results.iter().any(|(id, _)| id == &device.id) {
            results.push((device.id.clone(), on_panic("device task aborted".to_string())));
        }
    }
    results
}

async fn record_one(camera: &dyn CameraApi, device: &Device, hold: Duration) -> RecordResult {
    if let Err(e) = camera.set_shutter(device, true).await {
        error!(device = %device.id, error = %e, "Failed to start recording");
        return RecordResult::failed(format!("start: {e}"));
    }
    debug!(device = %device.id, "Recording");

    sleep(hold).await;

    match camera.set_shutter(device, false).await {
        Ok(()) => {
            info!(device = %device.id, "Recording stopped");
            RecordResult::ok()
        }
        Err(e) => {
            error!(device = %device.id, error = %e, "Failed to stop recording");
            RecordResult::failed(format!("stop: {e}"))
        }
    }
}

struct DownloadContext {
    camera: Arc<dyn CameraApi>,
    storage: StorageLayout,
    settings: CaptureSettings,
    label: String,
    trigger_timestamp: DateTime<Local>,
}

impl DownloadContext {
    async fn download_one(&self, device: &Device) -> DownloadResult {
        let started = Instant::now();
        match self.try_download(device, started).await {
            Ok(result) => result,
            Err(reason) => {
                error!(device = %device.id, %reason, "Download failed");
                DownloadResult::failed(reason, started.elapsed())
            }
        }
    }

    async fn try_download(&self, device: &Device, started: Instant) -> Result<DownloadResult, String> {
        let dir = self.storage.device_dir(device);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("cannot create {}: {e}", dir.display()))?;

        match storage::available_bytes(&dir) {
            Ok(available) => match classify_space(available, self.settings.min_free_bytes) {
                SpaceCheck::Insufficient => {
                    return Err(format!(
                        "only {} MB free, need at least {} MB",
                        available / (1024 * 1024),
                        self.settings.min_free_bytes / (1024 * 1024)
                    ));
                }
                SpaceCheck::Low => {
                    warn!(device = %device.id, available_mb = available / (1024 * 1024), "Disk space low")
                }
                SpaceCheck::Ok => {}
            },
            Err(e) => warn!(device = %device.id, error = %e, "Could not read free space"),
        }

        let media = self
            .camera
            .latest_media(device)
            .await
            .map_err(|e| format!("media list: {e}"))?
            .ok_or_else(|| "no video on camera".to_string())?;

        let local = self.storage.clip_path(device, &self.label, &media.name);
        let part = partial_path(&local);
        info!(device = %device.id, remote = %media.remote_path(), local = %local.display(), "Downloading");

        if let Err(e) = self.camera.download(device, &media, &part).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(format!("transfer: {e}"));
        }

        let size = match tokio::fs::metadata(&part).await {
            Ok(meta) => meta.len(),
            Err(e) => return Err(format!("downloaded file missing: {e}")),
        };
        if size < self.settings.min_clip_bytes {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(format!(
                "downloaded {size} bytes, below the {} byte minimum; discarded as corrupt",
                self.settings.min_clip_bytes
            ));
        }

        tokio::fs::rename(&part, &local)
            .await
            .map_err(|e| format!("rename {}: {e}", part.display()))?;
        let elapsed = started.elapsed();

        let mtime = FileTime::from_unix_time(media.captured_at.timestamp(), 0);
        if let Err(e) = filetime::set_file_mtime(&local, mtime) {
            debug!(device = %device.id, error = %e, "Could not set modification time");
        }

        // The local copy is verified; only now is the camera copy expendable.
        match self.camera.delete(device, &media).await {
            Ok(()) => debug!(device = %device.id, remote = %media.name, "Deleted from camera"),
            Err(e) => warn!(device = %device.id, error = %e, "Failed to delete from camera"),
        }

        let info = ClipInfo {
            clip: &local,
            device,
            trigger_timestamp: self.trigger_timestamp,
            captured_at: media.captured_at,
            size_bytes: size,
            download_time: elapsed,
        };
        if let Err(e) = metadata::write_clip(&info).await {
            warn!(device = %device.id, error = %e, "Failed to write clip metadata");
        }

        info!(
            device = %device.id,
            size_mb = format!("{:.1}", size as f64 / (1024.0 * 1024.0)),
            elapsed_ms = elapsed.as_millis() as u64,
            "Download verified"
        );
        Ok(DownloadResult::ok(local, size, elapsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::camera::{CameraError, RemoteMedia};
    use crate::core::combiner;
    use crate::core::merge_engine::MergeMethod;
    use crate::core::merge_engine::simulated::SimulatedEngine;
    use crate::core::models::ConnectionState;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::{HashMap, HashSet};
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeCamera {
        clips: HashMap<String, (String, Vec<u8>)>,
        fail_shutter: HashSet<String>,
        fail_download: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeCamera {
        fn log(&self, entry: String) {
            self.calls.lock().unwrap().push(entry);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CameraApi for FakeCamera {
        async fn probe(&self, _device: &Device, _timeout: Duration) -> bool {
            true
        }

        async fn set_shutter(&self, device: &Device, recording: bool) -> Result<(), CameraError> {
            self.log(format!("shutter {} {recording}", device.id));
            if self.fail_shutter.contains(&device.id) {
                return Err(CameraError::Status(500));
            }
            Ok(())
        }

        async fn latest_media(&self, device: &Device) -> Result<Option<RemoteMedia>, CameraError> {
            Ok(self.clips.get(&device.id).map(|(name, _)| RemoteMedia {
                folder: "100GOPRO".into(),
                name: name.clone(),
                captured_at: Utc::now(),
                size: None,
            }))
        }

        async fn download(
            &self,
            device: &Device,
            _media: &RemoteMedia,
            destination: &Path,
        ) -> Result<u64, CameraError> {
            self.log(format!("download {}", device.id));
            if self.fail_download.contains(&device.id) {
                tokio::fs::write(destination, b"trunc").await?;
                return Err(CameraError::Unreachable("connection reset".into()));
            }
            let bytes = &self.clips[&device.id].1;
            tokio::fs::write(destination, bytes).await?;
            Ok(bytes.len() as u64)
        }

        async fn delete(&self, device: &Device, media: &RemoteMedia) -> Result<(), CameraError> {
            self.log(format!("delete {} {}", device.id, media.name));
            Ok(())
        }
    }

    fn device(id: &str, name: &str, interface: &str) -> Device {
        Device {
            id: id.into(),
            display_name: name.into(),
            radio_address: "AA:BB:CC:DD:EE:FF".into(),
            network_name: format!("{name} WiFi"),
            network_secret: "pw".into(),
            ip_address: IpAddr::V4(Ipv4Addr::new(10, 5, 5, 9)),
            interface: interface.into(),
        }
    }

    fn devices() -> Vec<Device> {
        vec![device("a", "GoPro1", "wlan0"), device("b", "GoPro3", "wlan1")]
    }

    fn settings() -> CaptureSettings {
        CaptureSettings {
            record: Duration::from_millis(30),
            finalize: Duration::from_millis(5),
            expected_devices: 2,
            min_free_bytes: 0,
            min_clip_bytes: 16,
            combine_headroom: 0.0,
        }
    }

    fn camera_with_clips() -> FakeCamera {
        let mut camera = FakeCamera::default();
        camera.clips.insert("a".into(), ("A.mp4".into(), vec![b'a'; 64]));
        camera.clips.insert("b".into(), ("B.mp4".into(), vec![b'b'; 64]));
        camera
    }

    async fn verified_tracker() -> ConnectionTracker {
        let tracker = ConnectionTracker::new();
        for d in devices() {
            tracker.set(&d.id, ConnectionState::Verified).await;
        }
        tracker
    }

    #[tokio::test]
    async fn both_downloads_enqueue_one_combination() {
        let dir = tempdir().unwrap();
        let storage = StorageLayout::resolve(dir.path(), dir.path(), "Combined").unwrap();
        let camera = Arc::new(camera_with_clips());
        let engine = Arc::new(SimulatedEngine::default());
        let (queue, worker) = combiner::channel(engine.clone(), Duration::from_millis(10));
        let handle = worker.spawn();

        let coordinator = CaptureCoordinator::new(
            camera.clone(),
            verified_tracker().await,
            storage,
            Some(queue.clone()),
            settings(),
        );
        let job = coordinator.run_capture_job(&devices()).await.unwrap();

        assert_eq!(job.records_ok(), 2);
        assert_eq!(job.downloads_ok(), 2);
        let label = job.label();
        let combination = job.combination.clone().unwrap();
        assert_eq!(combination.timestamp, label);
        assert!(
            combination
                .output
                .ends_with(format!("Combined/{label}_Combined_GoPro1+GoPro3.mp4"))
        );
        assert!(combination.clip_a.ends_with(format!("GoPro1/{label}_GoPro1_A.mp4")));
        assert!(combination.clip_b.ends_with(format!("GoPro3/{label}_GoPro3_B.mp4")));

        assert!(queue.wait_idle(Duration::from_secs(5)).await);
        queue.shutdown();
        handle.await.unwrap();

        let attempts = engine.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].method, MergeMethod::StreamCopy);
        assert_eq!(attempts[0].clip_a, combination.clip_a);
        assert!(combination.output.exists());

        // Remote copies are deleted only after verification.
        let calls = camera.calls();
        assert!(calls.contains(&"delete a A.mp4".to_string()));
        assert!(calls.contains(&"delete b B.mp4".to_string()));
        assert!(metadata::sidecar_path(&combination.clip_a).exists());
    }

    #[tokio::test]
    async fn identical_remote_names_land_in_separate_files() {
        let dir = tempdir().unwrap();
        let storage = StorageLayout::resolve(dir.path(), dir.path(), "Combined").unwrap();
        let mut camera = FakeCamera::default();
        camera.clips.insert("a".into(), ("GH010001.MP4".into(), vec![b'a'; 64]));
        camera.clips.insert("b".into(), ("GH010001.MP4".into(), vec![b'b'; 96]));
        let camera = Arc::new(camera);
        let engine = Arc::new(SimulatedEngine::default());
        let (queue, worker) = combiner::channel(engine.clone(), Duration::from_millis(10));
        let handle = worker.spawn();

        let coordinator = CaptureCoordinator::new(
            camera,
            verified_tracker().await,
            storage,
            Some(queue.clone()),
            settings(),
        );
        let job = coordinator.run_capture_job(&devices()).await.unwrap();

        let a = job.clip("a").unwrap().clone();
        let b = job.clip("b").unwrap().clone();
        assert_ne!(a, b);
        assert_eq!(std::fs::read(&a).unwrap(), vec![b'a'; 64]);
        assert_eq!(std::fs::read(&b).unwrap(), vec![b'b'; 96]);

        let combination = job.combination.clone().unwrap();
        assert_eq!((&combination.clip_a, &combination.clip_b), (&a, &b));

        assert!(queue.wait_idle(Duration::from_secs(5)).await);
        queue.shutdown();
        handle.await.unwrap();
        assert_eq!(engine.attempts().len(), 1);
        assert_eq!(std::fs::metadata(&combination.output).unwrap().len(), 160);
    }

    #[tokio::test]
    async fn one_failed_download_enqueues_nothing() {
        let dir = tempdir().unwrap();
        let storage = StorageLayout::resolve(dir.path(), dir.path(), "Combined").unwrap();
        let mut camera = camera_with_clips();
        camera.fail_download.insert("b".into());
        let camera = Arc::new(camera);
        // Worker never runs: anything enqueued would stay pending.
        let (queue, _worker) =
            combiner::channel(Arc::new(SimulatedEngine::default()), Duration::from_millis(10));

        let coordinator = CaptureCoordinator::new(
            camera.clone(),
            verified_tracker().await,
            storage.clone(),
            Some(queue.clone()),
            settings(),
        );
        let job = coordinator.run_capture_job(&devices()).await.unwrap();

        assert_eq!(job.records_ok(), 2);
        assert_eq!(job.downloads_ok(), 1);
        assert!(job.combination.is_none());
        assert_eq!(queue.pending(), 0);

        // The failed side leaves no partial file and keeps its remote copy.
        let b_dir = storage.device_dir(&devices()[1]);
        assert_eq!(std::fs::read_dir(b_dir).unwrap().count(), 0);
        assert!(!camera.calls().iter().any(|c| c.starts_with("delete b")));
    }

    #[tokio::test]
    async fn failed_record_skips_that_download_only() {
        let dir = tempdir().unwrap();
        let storage = StorageLayout::resolve(dir.path(), dir.path(), "Combined").unwrap();
        let mut camera = camera_with_clips();
        camera.fail_shutter.insert("b".into());
        let camera = Arc::new(camera);

        let coordinator =
            CaptureCoordinator::new(camera.clone(), verified_tracker().await, storage, None, settings());
        let job = coordinator.run_capture_job(&devices()).await.unwrap();

        assert_eq!(job.records_ok(), 1);
        assert_eq!(job.downloads_ok(), 1);
        assert!(job.downloads_ok() <= job.records_ok());
        assert!(job.clip("a").is_some());
        assert!(!camera.calls().contains(&"download b".to_string()));
        // Start failed, so stop is never sent to b.
        assert!(!camera.calls().contains(&"shutter b false".to_string()));
    }

    #[tokio::test]
    async fn undersized_clip_is_discarded() {
        let dir = tempdir().unwrap();
        let storage = StorageLayout::resolve(dir.path(), dir.path(), "Combined").unwrap();
        let mut camera = camera_with_clips();
        camera.clips.insert("b".into(), ("B.mp4".into(), vec![b'b'; 4]));
        let camera = Arc::new(camera);

        let coordinator = CaptureCoordinator::new(
            camera.clone(),
            verified_tracker().await,
            storage.clone(),
            None,
            settings(),
        );
        let job = coordinator.run_capture_job(&devices()).await.unwrap();

        let b = &job.downloads["b"];
        assert!(!b.succeeded);
        assert!(b.error.as_deref().unwrap().contains("corrupt"));
        assert_eq!(std::fs::read_dir(storage.device_dir(&devices()[1])).unwrap().count(), 0);
        assert!(!camera.calls().iter().any(|c| c.starts_with("delete b")));
    }

    #[tokio::test]
    async fn unverified_device_aborts_before_any_command() {
        let dir = tempdir().unwrap();
        let storage = StorageLayout::resolve(dir.path(), dir.path(), "Combined").unwrap();
        let camera = Arc::new(camera_with_clips());
        let tracker = ConnectionTracker::new();
        tracker.set("a", ConnectionState::Verified).await;
        tracker.set("b", ConnectionState::Failed).await;

        let coordinator = CaptureCoordinator::new(camera.clone(), tracker, storage, None, settings());
        assert_eq!(
            coordinator.run_capture_job(&devices()).await.unwrap_err(),
            CaptureError::NotVerified("b".into())
        );
        assert!(camera.calls().is_empty());
    }

    #[tokio::test]
    async fn wrong_device_count_is_rejected() {
        let dir = tempdir().unwrap();
        let storage = StorageLayout::resolve(dir.path(), dir.path(), "Combined").unwrap();
        let coordinator = CaptureCoordinator::new(
            Arc::new(camera_with_clips()),
            verified_tracker().await,
            storage,
            None,
            settings(),
        );

        let one = &devices()[..1];
        assert_eq!(
            coordinator.run_capture_job(one).await.unwrap_err(),
            CaptureError::DeviceCountMismatch {
                expected: 2,
                found: 1
            }
        );
    }

    #[tokio::test]
    async fn free_space_floor_aborts_downloads() {
        let dir = tempdir().unwrap();
        let storage = StorageLayout::resolve(dir.path(), dir.path(), "Combined").unwrap();
        let camera = Arc::new(camera_with_clips());
        let mut settings = settings();
        settings.min_free_bytes = u64::MAX;

        let coordinator =
            CaptureCoordinator::new(camera.clone(), verified_tracker().await, storage, None, settings);
        let job = coordinator.run_capture_job(&devices()).await.unwrap();

        assert_eq!(job.records_ok(), 2);
        assert_eq!(job.downloads_ok(), 0);
        assert!(!camera.calls().iter().any(|c| c.starts_with("download")));
    }
}
