//! HTTP client for the cameras' control and media ports.
//!
//! Each device gets its own `reqwest::Client`. On Linux the client can be
//! bound to the device's interface, because both cameras answer on the same
//! address and only the interface tells them apart.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{CameraConfig, ShutterMethod, secs};
use crate::core::camera::{CameraApi, CameraError, MediaListing, RemoteMedia};
use crate::core::models::Device;
use crate::logging::LogThrottle;

pub struct HttpCamera {
    config: CameraConfig,
    clients: HashMap<String, Client>,
}

impl HttpCamera {
    pub fn new(config: &CameraConfig, devices: &[Device]) -> Result<Self> {
        let mut clients = HashMap::new();
        for device in devices {
            let builder = Client::builder()
                .connect_timeout(secs(config.connect_timeout_secs))
                .no_proxy();
            #[cfg(target_os = "linux")]
            let builder = if config.bind_interface {
                builder.interface(&device.interface)
            } else {
                builder
            };
            let client = builder
                .build()
                .with_context(|| format!("Failed to build HTTP client for {}", device.id))?;
            clients.insert(device.id.clone(), client);
        }
        Ok(Self {
            config: config.clone(),
            clients,
        })
    }

    fn client(&self, device: &Device) -> Result<&Client, CameraError> {
        self.clients
            .get(&device.id)
            .ok_or_else(|| CameraError::Unreachable(format!("no client for device {}", device.id)))
    }

    fn control_url(&self, device: &Device, path: &str) -> String {
        format!("http://{}:{}{}", device.ip_address, self.config.control_port, path)
    }

    fn media_url(&self, device: &Device, media: &RemoteMedia) -> String {
        format!(
            "http://{}:{}{}{}",
            device.ip_address,
            self.config.media_port,
            self.config.media_root,
            media.remote_path()
        )
    }

    fn request_timeout(&self) -> Duration {
        secs(self.config.request_timeout_secs)
    }

    async fn send(
        &self,
        device: &Device,
        method: Method,
        url: String,
        timeout: Duration,
    ) -> Result<reqwest::Response, CameraError> {
        debug!(device = %device.id, %method, %url, "camera request");
        let response = self
            .client(device)?
            .request(method, url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| request_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CameraError::Status(status.as_u16()));
        }
        Ok(response)
    }
}

fn request_error(e: reqwest::Error, timeout: Duration) -> CameraError {
    if e.is_timeout() {
        CameraError::Timeout(timeout)
    } else {
        CameraError::Unreachable(e.to_string())
    }
}

#[async_trait]
impl CameraApi for HttpCamera {
    async fn probe(&self, device: &Device, timeout: Duration) -> bool {
        let url = self.control_url(device, &self.config.status_path);
        match self.send(device, Method::GET, url, timeout).await {
            Ok(_) => true,
            Err(e) => {
                debug!(device = %device.id, error = %e, "Status probe failed");
                false
            }
        }
    }

    async fn set_shutter(&self, device: &Device, recording: bool) -> Result<(), CameraError> {
        let method = match self.config.shutter_method {
            ShutterMethod::Get => Method::GET,
            ShutterMethod::Post => Method::POST,
        };
        let p = if recording { 1 } else { 0 };
        let url = self.control_url(device, &format!("{}?p={p}", self.config.shutter_path));
        self.send(device, method, url, self.request_timeout()).await?;
        Ok(())
    }

    async fn latest_media(&self, device: &Device) -> Result<Option<RemoteMedia>, CameraError> {
        let url = self.control_url(device, &self.config.media_list_path);
        let timeout = self.request_timeout();
        let body = self
            .send(device, Method::GET, url, timeout)
            .await?
            .bytes()
            .await
            .map_err(|e| request_error(e, timeout))?;

        let listing: MediaListing =
            serde_json::from_slice(&body).map_err(|e| CameraError::Malformed(e.to_string()))?;
        Ok(listing.latest_video())
    }

    async fn download(
        &self,
        device: &Device,
        media: &RemoteMedia,
        destination: &Path,
    ) -> Result<u64, CameraError> {
        let url = self.media_url(device, media);
        let timeout = secs(self.config.download_timeout_secs);
        let mut response = self.send(device, Method::GET, url, timeout).await?;

        let header_len = response.content_length();
        let total = header_len.or(media.size);
        let mut file = tokio::fs::File::create(destination).await?;
        let progress = LogThrottle::new(Duration::from_secs(5));
        let started = Instant::now();
        let mut written: u64 = 0;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| request_error(e, timeout))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;

            if progress.admit().is_some() {
                let elapsed = started.elapsed().as_secs_f64().max(0.001);
                info!(
                    device = %device.id,
                    written_mb = written / (1024 * 1024),
                    total_mb = total.map(|t| t / (1024 * 1024)),
                    mb_per_s = format!("{:.1}", written as f64 / (1024.0 * 1024.0) / elapsed),
                    "Downloading"
                );
            }
        }
        file.flush().await?;
        file.sync_all().await?;

        // Both the response header and the media listing must agree with
        // what landed on disk.
        for expected in [header_len, media.size].into_iter().flatten() {
            if written != expected {
                warn!(device = %device.id, written, expected, "Download size mismatch");
                return Err(CameraError::SizeMismatch { written, expected });
            }
        }
        Ok(written)
    }

    async fn delete(&self, device: &Device, media: &RemoteMedia) -> Result<(), CameraError> {
        // The camera expects the path unescaped.
        let path = format!("{}?p={}", self.config.delete_path, media.remote_path());
        let url = self.control_url(device, &path);
        self.send(device, Method::GET, url, self.request_timeout()).await?;
        Ok(())
    }
}
