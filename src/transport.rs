//! External collaborator interfaces
//!
//! The engine never talks to hardware, storage, or the network directly;
//! everything behind a radio, a disk, or a socket sits behind one of these
//! traits. The vendor SDK bridge implements `RingTransport`; the embedding
//! app supplies the rest. Default no-op implementations are provided for the
//! collaborators an app may not care about.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::{ErrorClass, SyncError};
use crate::types::{DiscoveredDevice, NormalizedHealthData, RawHealthPayload, SyncSource, Vendor};

/// Low-level wireless transport and vendor protocol driver.
///
/// Implementations wrap the per-vendor SDKs. Every call may suspend for as
/// long as the hardware takes; timeouts are the caller's concern.
#[async_trait]
pub trait RingTransport: Send + Sync {
    /// Discovery sweep, optionally restricted to one vendor's advertisements
    async fn scan_for_devices(
        &self,
        vendor: Option<Vendor>,
    ) -> Result<Vec<DiscoveredDevice>, SyncError>;

    /// Connect to a peripheral. `Ok(false)` means the stack refused cleanly.
    async fn connect(&self, uuid: &str) -> Result<bool, SyncError>;

    async fn disconnect(&self, uuid: &str) -> Result<bool, SyncError>;

    /// One connectivity probe. The coordinator deduplicates and caches these.
    async fn probe_connection(&self, uuid: &str, vendor: Vendor) -> Result<bool, SyncError>;

    /// Pull the device's complete raw health payload
    async fn fetch_raw_health_data(&self, uuid: &str) -> Result<RawHealthPayload, SyncError>;

    async fn battery_level(&self, uuid: &str) -> Result<Option<i64>, SyncError>;

    /// Radio power state; `false` when Bluetooth is off or unauthorized
    async fn is_radio_on(&self) -> bool;
}

/// Storage key of the connected-device descriptor (JSON `DeviceIdentity`)
pub const CONNECTED_DEVICE_KEY: &str = "ringkit.connected_device";

/// Storage key of the most recent canonical health record
pub const LAST_RECORD_KEY: &str = "ringkit.last_health_data";

/// Persistent key-value storage for the connected-device descriptor and
/// feature flags
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get_string(&self, key: &str) -> Option<String>;
    async fn set_string(&self, key: &str, value: &str);
    async fn remove(&self, key: &str);
}

/// Backend synchronization, best-effort: a failure here never blocks local
/// persistence of the record
#[async_trait]
pub trait BackendSync: Send + Sync {
    async fn perform_all_syncs(
        &self,
        record: &NormalizedHealthData,
        device_id: Option<&str>,
        uuid: &str,
    ) -> Result<(), SyncError>;
}

/// UI-facing events, fire-and-forget; ignored if nobody listens
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ConnectStart { uuid: String },
    ConnectSuccess { uuid: String },
    ConnectFailure { uuid: String, reason: String },
    /// Stop any connect/sync spinner the UI is showing
    AnimationStop,
    /// A failure class crossed its ceiling and the scheduler backed off
    SyncFailed { class: ErrorClass, message: String },
    SyncCompleted { source: SyncSource },
}

/// Notification delivery collaborator
pub trait Notifier: Send + Sync {
    fn notify(&self, event: SyncEvent);
}

/// Day summary from the host OS health platform (HealthKit, Health Connect)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OsHealthSummary {
    pub steps: Option<f64>,
    pub calories: Option<f64>,
    pub distance: Option<f64>,
}

impl OsHealthSummary {
    pub fn is_empty(&self) -> bool {
        self.steps.is_none() && self.calories.is_none() && self.distance.is_none()
    }
}

/// OS-source health data provider feeding the second sync lane
#[async_trait]
pub trait OsHealthProvider: Send + Sync {
    async fn fetch_today_summary(&self) -> Result<Option<OsHealthSummary>, SyncError>;
}

/// In-memory `DeviceStore`, the default when the app supplies none.
/// Contents do not survive a restart; real apps plug in their own storage.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn get_string(&self, key: &str) -> Option<String> {
        self.entries.lock().await.get(key).cloned()
    }

    async fn set_string(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
    }

    async fn remove(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }
}

/// Backend stand-in that records nothing
#[derive(Default)]
pub struct NoopBackend;

#[async_trait]
impl BackendSync for NoopBackend {
    async fn perform_all_syncs(
        &self,
        _record: &NormalizedHealthData,
        _device_id: Option<&str>,
        uuid: &str,
    ) -> Result<(), SyncError> {
        log::debug!("backend sync skipped (no backend configured) for {uuid}");
        Ok(())
    }
}

/// Notifier stand-in that only logs
#[derive(Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, event: SyncEvent) {
        log::debug!("sync event: {event:?}");
    }
}

/// OS health stand-in reporting no data
#[derive(Default)]
pub struct NoopOsHealth;

#[async_trait]
impl OsHealthProvider for NoopOsHealth {
    async fn fetch_today_summary(&self) -> Result<Option<OsHealthSummary>, SyncError> {
        Ok(None)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.get_string("device").await.is_none());

        store.set_string("device", "{\"uuid\":\"AA\"}").await;
        assert_eq!(
            store.get_string("device").await.as_deref(),
            Some("{\"uuid\":\"AA\"}")
        );

        store.remove("device").await;
        assert!(store.get_string("device").await.is_none());
    }

    #[test]
    fn test_os_summary_emptiness() {
        assert!(OsHealthSummary::default().is_empty());
        let with_steps = OsHealthSummary {
            steps: Some(4000.0),
            ..Default::default()
        };
        assert!(!with_steps.is_empty());
    }
}
