//! In-process stand-ins for the radio, the network, the cameras and the
//! trigger line, so the whole pipeline runs on a laptop.
//!
//! All parts share one [`World`]. A [`Simulator`] handle changes it from the
//! outside (stdin commands, tests) through a bridge task.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::core::camera::{CameraApi, CameraError, RemoteMedia};
use crate::core::gateway::{ActivationFailure, ActivationMode, DeviceGateway};
use crate::core::hardware::DigitalIo;
use crate::core::models::Device;

const FOLDER: &str = "100GOPRO";

#[derive(Default)]
struct WorldState {
    reachable: HashSet<String>,
    broadcasting: HashSet<String>,
    media: HashMap<String, Vec<RemoteMedia>>,
    next_clip: u32,
    presses: u32,
}

#[derive(Clone, Default)]
pub struct World {
    state: Arc<Mutex<WorldState>>,
}

enum SimulatedCommand {
    Press,
    Drop(String),
    Restore(String),
}

/// Outside control over the simulated world.
#[derive(Clone)]
pub struct Simulator {
    tx: mpsc::UnboundedSender<SimulatedCommand>,
}

impl Simulator {
    pub fn press(&self) {
        let _ = self.tx.send(SimulatedCommand::Press);
    }

    /// Make a camera unreachable, as if it went to sleep.
    pub fn drop_device(&self, id: &str) {
        let _ = self.tx.send(SimulatedCommand::Drop(id.to_string()));
    }

    pub fn restore_device(&self, id: &str) {
        let _ = self.tx.send(SimulatedCommand::Restore(id.to_string()));
    }
}

impl World {
    /// Create a world and spawn the task that applies [`Simulator`] commands.
    pub fn start() -> (Self, Simulator) {
        let world = World::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let state = world.state.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                let mut s = state.lock().await;
                match cmd {
                    SimulatedCommand::Press => s.presses += 1,
                    SimulatedCommand::Drop(id) => {
                        info!(device = %id, "(Simulator) Device dropped");
                        s.reachable.remove(&id);
                        s.broadcasting.remove(&id);
                    }
                    SimulatedCommand::Restore(id) => {
                        info!(device = %id, "(Simulator) Device restored");
                        s.reachable.insert(id);
                    }
                }
            }
        });

        (world, Simulator { tx })
    }
}

pub struct SimulatedGateway {
    world: World,
    latency: Duration,
}

impl SimulatedGateway {
    pub fn new(world: World) -> Self {
        Self {
            world,
            latency: Duration::from_millis(300),
        }
    }
}

#[async_trait]
impl DeviceGateway for SimulatedGateway {
    async fn interface_exists(&self, _interface: &str) -> bool {
        true
    }

    async fn activate_wireless(
        &self,
        device: &Device,
        _timeout: Duration,
        mode: ActivationMode,
    ) -> Result<(), ActivationFailure> {
        sleep(self.latency).await;
        debug!(device = %device.id, ?mode, "(Simulator) Radio activation");
        self.world
            .state
            .lock()
            .await
            .broadcasting
            .insert(device.id.clone());
        Ok(())
    }

    async fn network_visible(&self, device: &Device) -> bool {
        self.world.state.lock().await.broadcasting.contains(&device.id)
    }

    async fn reset_radio(&self) -> Result<()> {
        sleep(self.latency).await;
        Ok(())
    }

    async fn associate_network(&self, device: &Device) -> Result<()> {
        sleep(self.latency).await;
        self.world
            .state
            .lock()
            .await
            .reachable
            .insert(device.id.clone());
        Ok(())
    }
}

pub struct SimulatedCamera {
    world: World,
    clip_bytes: usize,
}

impl SimulatedCamera {
    pub fn new(world: World, clip_bytes: usize) -> Self {
        Self { world, clip_bytes }
    }

    async fn require_reachable(&self, device: &Device) -> Result<(), CameraError> {
        if self.world.state.lock().await.reachable.contains(&device.id) {
            Ok(())
        } else {
            Err(CameraError::Unreachable(format!("{} is asleep", device.id)))
        }
    }
}

#[async_trait]
impl CameraApi for SimulatedCamera {
    async fn probe(&self, device: &Device, _timeout: Duration) -> bool {
        self.require_reachable(device).await.is_ok()
    }

    async fn set_shutter(&self, device: &Device, recording: bool) -> Result<(), CameraError> {
        self.require_reachable(device).await?;
        if recording {
            return Ok(());
        }

        let mut s = self.world.state.lock().await;
        s.next_clip += 1;
        let media = RemoteMedia {
            folder: FOLDER.to_string(),
            name: format!("GH01{:04}.MP4", s.next_clip),
            captured_at: Utc::now(),
            size: Some(self.clip_bytes as u64),
        };
        s.media.entry(device.id.clone()).or_default().push(media);
        Ok(())
    }

    async fn latest_media(&self, device: &Device) -> Result<Option<RemoteMedia>, CameraError> {
        self.require_reachable(device).await?;
        let s = self.world.state.lock().await;
        Ok(s.media.get(&device.id).and_then(|m| m.last().cloned()))
    }

    async fn download(
        &self,
        device: &Device,
        media: &RemoteMedia,
        destination: &Path,
    ) -> Result<u64, CameraError> {
        self.require_reachable(device).await?;
        debug!(device = %device.id, clip = %media.name, "(Simulator) Serving clip");
        let mut file = tokio::fs::File::create(destination).await?;
        let chunk = vec![0x47u8; 64 * 1024];
        let mut written = 0;
        while written < self.clip_bytes {
            let n = chunk.len().min(self.clip_bytes - written);
            file.write_all(&chunk[..n]).await?;
            written += n;
        }
        file.flush().await?;
        Ok(written as u64)
    }

    async fn delete(&self, device: &Device, media: &RemoteMedia) -> Result<(), CameraError> {
        self.require_reachable(device).await?;
        let mut s = self.world.state.lock().await;
        if let Some(list) = s.media.get_mut(&device.id) {
            list.retain(|m| m.name != media.name);
        }
        Ok(())
    }
}

/// Trigger line that reads asserted once per [`Simulator::press`].
pub struct SimulatedIo {
    world: World,
    asserted_level: bool,
}

impl SimulatedIo {
    /// `asserted_level` is the raw level the real line would show when pressed.
    pub fn new(world: World, asserted_level: bool) -> Self {
        Self {
            world,
            asserted_level,
        }
    }
}

#[async_trait]
impl DigitalIo for SimulatedIo {
    async fn read_input(&self) -> Result<bool> {
        let mut s = self.world.state.lock().await;
        if s.presses > 0 {
            s.presses -= 1;
            Ok(self.asserted_level)
        } else {
            Ok(!self.asserted_level)
        }
    }

    async fn write_output(&self, level: bool) -> Result<()> {
        debug!(level, "(Simulator) Busy line");
        Ok(())
    }
}
