use std::sync::Arc;

use anyhow::{Context, Result};

use crate::adapters::Adapters;
use crate::adapters::simulated::Simulator;
use crate::config::{AppConfig, secs};
use crate::core::camera::CameraApi;
use crate::core::capture::{CaptureCoordinator, CaptureSettings};
use crate::core::combiner::CombinationQueue;
use crate::core::connection::{ConnectionManager, RetryPolicy};
use crate::core::gateway::DeviceGateway;
use crate::core::hardware::DigitalIo;
use crate::core::merge_engine::{MergeEngine, MergeEngineType, create_engine};
use crate::core::models::Device;
use crate::core::radio::RadioAdapter;
use crate::core::state::ConnectionTracker;
use crate::core::storage::StorageLayout;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub devices: Vec<Device>,
    pub tracker: ConnectionTracker,
    pub gateway: Arc<dyn DeviceGateway>,
    pub camera: Arc<dyn CameraApi>,
    pub io: Arc<dyn DigitalIo>,
    pub radio: Arc<RadioAdapter>,
    pub merge_engine: Arc<dyn MergeEngine>,
    pub simulator: Option<Simulator>,
}

impl AppContext {
    pub fn new(config: AppConfig, adapters: Adapters) -> Self {
        let engine_type = if config.simulation {
            MergeEngineType::Simulated
        } else {
            config.combination.engine
        };
        let radio = RadioAdapter::new(
            adapters.gateway.clone(),
            config.radio.max_resets_per_cycle,
            secs(config.radio.reset_cooldown_secs),
        );

        Self {
            devices: config.devices(),
            tracker: ConnectionTracker::new(),
            gateway: adapters.gateway,
            camera: adapters.camera,
            io: adapters.io,
            radio: Arc::new(radio),
            merge_engine: create_engine(engine_type, &config.combination.ffmpeg),
            simulator: adapters.simulator,
            config: Arc::new(config),
        }
    }

    pub fn connection_manager(&self) -> ConnectionManager {
        ConnectionManager::new(
            self.gateway.clone(),
            self.camera.clone(),
            self.radio.clone(),
            self.tracker.clone(),
            RetryPolicy::from(&self.config.connection),
        )
    }

    /// Pick the storage base and create the per-device directories.
    pub fn storage(&self) -> Result<StorageLayout> {
        let s = &self.config.storage;
        let layout = StorageLayout::resolve(&s.primary_dir, &s.fallback_dir, &s.combined_subdir)?;
        layout
            .ensure_device_dirs(&self.devices)
            .context("Failed to create device directories")?;
        Ok(layout)
    }

    pub fn capture_coordinator(
        &self,
        storage: StorageLayout,
        queue: Option<CombinationQueue>,
    ) -> CaptureCoordinator {
        CaptureCoordinator::new(
            self.camera.clone(),
            self.tracker.clone(),
            storage,
            queue,
            CaptureSettings::from(self.config.as_ref()),
        )
    }
}
