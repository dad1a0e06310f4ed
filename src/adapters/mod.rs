use std::sync::Arc;

use anyhow::Result;

use crate::config::AppConfig;
use crate::core::camera::CameraApi;
use crate::core::gateway::DeviceGateway;
use crate::core::hardware::{DigitalIo, Polarity};
use crate::core::models::Device;

pub mod command;
pub mod gpio;
pub mod http_camera;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod simulated;
pub mod wpa;

/// Synthetic clip size in simulation; above the default corruption floor.
const SIMULATED_CLIP_BYTES: usize = 2 * 1024 * 1024;

/// The concrete collaborators the core runs against.
pub struct Adapters {
    pub gateway: Arc<dyn DeviceGateway>,
    pub camera: Arc<dyn CameraApi>,
    pub io: Arc<dyn DigitalIo>,
    pub simulator: Option<simulated::Simulator>,
}

pub fn get_adapters(config: &AppConfig, devices: &[Device]) -> Result<Adapters> {
    if config.simulation {
        let (world, simulator) = simulated::World::start();
        let asserted = Polarity {
            active_low: config.trigger.input_active_low,
        }
        .level_for(true);

        return Ok(Adapters {
            gateway: Arc::new(simulated::SimulatedGateway::new(world.clone())),
            camera: Arc::new(simulated::SimulatedCamera::new(
                world.clone(),
                SIMULATED_CLIP_BYTES,
            )),
            io: Arc::new(simulated::SimulatedIo::new(world, asserted)),
            simulator: Some(simulator),
        });
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Adapters {
            gateway: Arc::new(linux::LinuxGateway::new(
                config.radio.clone(),
                config.network.clone(),
                devices,
            )),
            camera: Arc::new(http_camera::HttpCamera::new(&config.camera, devices)?),
            io: Arc::new(gpio::GpioLines::new(&config.trigger)),
            simulator: None,
        })
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = devices;
        anyhow::bail!("hardware mode needs Linux; run with --simulation")
    }
}

/// Read simulator commands from stdin on a plain thread.
pub fn spawn_stdin_controller(simulator: simulated::Simulator) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lines().map_while(Result::ok) {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                ["trigger" | "t"] => simulator.press(),
                ["drop", id] => simulator.drop_device(id),
                ["restore", id] => simulator.restore_device(id),
                [] => {}
                _ => println!("(Simulator) Use: 't' | 'trigger', 'drop <id>', 'restore <id>'"),
            }
        }
    });
}
