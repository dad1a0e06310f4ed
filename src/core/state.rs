//! In-memory connection state per device.
//!
//! States are never persisted: every connectivity check re-derives them, and
//! the capture coordinator reads them as its precondition.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::models::ConnectionState;

/// Shared table of [`ConnectionState`] keyed by device id.
///
/// Cloning is cheap; all clones see the same table.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<RwLock<HashMap<String, ConnectionState>>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, device_id: &str, state: ConnectionState) {
        let mut map = self.inner.write().await;
        let previous = map.insert(device_id.to_string(), state);
        if previous != Some(state) {
            debug!(device = %device_id, from = ?previous, to = %state, "Connection state changed");
        }
    }

    /// Unknown devices read as `Unverified`.
    pub async fn get(&self, device_id: &str) -> ConnectionState {
        let map = self.inner.read().await;
        map.get(device_id)
            .copied()
            .unwrap_or(ConnectionState::Unverified)
    }

    pub async fn all_verified<'a>(&self, device_ids: impl IntoIterator<Item = &'a str>) -> bool {
        let map = self.inner.read().await;
        device_ids
            .into_iter()
            .all(|id| map.get(id).is_some_and(|s| s.is_verified()))
    }

    pub async fn snapshot(&self) -> HashMap<String, ConnectionState> {
        self.inner.read().await.clone()
    }

    pub async fn verified_count(&self) -> usize {
        let map = self.inner.read().await;
        map.values().filter(|s| s.is_verified()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_device_is_unverified() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.get("cam-a").await, ConnectionState::Unverified);
        assert!(!tracker.all_verified(["cam-a"]).await);
    }

    #[tokio::test]
    async fn all_verified_needs_every_device() {
        let tracker = ConnectionTracker::new();
        tracker.set("cam-a", ConnectionState::Verified).await;
        tracker.set("cam-b", ConnectionState::NetworkAssociating).await;

        assert!(tracker.all_verified(["cam-a"]).await);
        assert!(!tracker.all_verified(["cam-a", "cam-b"]).await);
        assert_eq!(tracker.verified_count().await, 1);

        tracker.set("cam-b", ConnectionState::Verified).await;
        assert!(tracker.all_verified(["cam-a", "cam-b"]).await);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let tracker = ConnectionTracker::new();
        let other = tracker.clone();
        other.set("cam-a", ConnectionState::Failed).await;

        assert_eq!(tracker.get("cam-a").await, ConnectionState::Failed);
        assert_eq!(tracker.snapshot().await.len(), 1);
    }
}
