//! Engine composition root
//!
//! `RingEngine` wires the coordinator, retriever, and orchestrator together
//! with the app-supplied collaborators and exposes the public surface:
//! scheduler controls, connect/disconnect, scan, and on-demand health
//! retrieval. It is the only place state is composed; there are no hidden
//! process-wide singletons.

use std::sync::Arc;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::coordinator::ConnectionCoordinator;
use crate::error::SyncError;
use crate::orchestrator::SyncOrchestrator;
use crate::retrieval::{HealthRetriever, RetrievedHealth};
use crate::transport::{
    BackendSync, DeviceStore, MemoryStore, NoopBackend, NoopNotifier, NoopOsHealth, Notifier,
    OsHealthProvider, RingTransport, SyncEvent, CONNECTED_DEVICE_KEY, LAST_RECORD_KEY,
};
use crate::types::{DeviceIdentity, DiscoveredDevice, SyncStatus, Vendor};

/// Builder for `RingEngine`; collaborators not supplied fall back to no-op
/// implementations (and an in-memory store)
pub struct RingEngineBuilder {
    transport: Arc<dyn RingTransport>,
    config: SyncConfig,
    store: Option<Arc<dyn DeviceStore>>,
    backend: Option<Arc<dyn BackendSync>>,
    notifier: Option<Arc<dyn Notifier>>,
    os_health: Option<Arc<dyn OsHealthProvider>>,
}

impl RingEngineBuilder {
    pub fn new(transport: Arc<dyn RingTransport>) -> Self {
        Self {
            transport,
            config: SyncConfig::default(),
            store: None,
            backend: None,
            notifier: None,
            os_health: None,
        }
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn DeviceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn BackendSync>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn os_health(mut self, os_health: Arc<dyn OsHealthProvider>) -> Self {
        self.os_health = Some(os_health);
        self
    }

    pub fn build(self) -> RingEngine {
        let config = Arc::new(self.config);
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let backend = self.backend.unwrap_or_else(|| Arc::new(NoopBackend));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(NoopNotifier));
        let os_health = self.os_health.unwrap_or_else(|| Arc::new(NoopOsHealth));

        let coordinator =
            ConnectionCoordinator::new(Arc::clone(&self.transport), Arc::clone(&config));
        let retriever = Arc::new(HealthRetriever::new(
            Arc::clone(&self.transport),
            coordinator.clone(),
            Arc::clone(&config),
            Arc::clone(&notifier),
        ));
        let orchestrator = SyncOrchestrator::new(
            Arc::clone(&config),
            Arc::clone(&self.transport),
            coordinator.clone(),
            Arc::clone(&retriever),
            Arc::clone(&store),
            backend,
            Arc::clone(&notifier),
            os_health,
        );

        let instance_id = Uuid::new_v4();
        log::info!("ring engine {instance_id} built for {}", config.platform.as_str());

        RingEngine {
            config,
            instance_id,
            transport: self.transport,
            store,
            notifier,
            coordinator,
            retriever,
            orchestrator,
        }
    }
}

/// The sync engine: one instance per app process
pub struct RingEngine {
    config: Arc<SyncConfig>,
    /// Distinguishes engine instances in log output
    instance_id: Uuid,
    transport: Arc<dyn RingTransport>,
    store: Arc<dyn DeviceStore>,
    notifier: Arc<dyn Notifier>,
    coordinator: ConnectionCoordinator,
    retriever: Arc<HealthRetriever>,
    orchestrator: SyncOrchestrator,
}

impl RingEngine {
    pub fn builder(transport: Arc<dyn RingTransport>) -> RingEngineBuilder {
        RingEngineBuilder::new(transport)
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Mark the session authenticated; the scheduler refuses to start
    /// without this
    pub fn set_authorized(&self, authorized: bool) {
        self.orchestrator.set_authorized(authorized);
    }

    /// Start the periodic sync scheduler
    pub async fn start_scheduler(&self) -> Result<(), SyncError> {
        self.orchestrator.start(false).await
    }

    /// Stop the scheduler and abort in-flight sync work
    pub async fn stop_scheduler(&self) {
        self.orchestrator.stop().await;
    }

    pub async fn pause(&self) {
        self.orchestrator.pause().await;
    }

    pub async fn resume(&self, trigger_immediately: bool) {
        self.orchestrator.resume(trigger_immediately).await;
    }

    /// User-initiated sync. Starts the scheduler when it is not running;
    /// otherwise performs an immediate tick without touching the schedule.
    pub async fn perform_manual_sync(&self) -> Result<(), SyncError> {
        self.orchestrator.start(true).await
    }

    /// Scheduler status snapshot
    pub async fn status(&self) -> SyncStatus {
        self.orchestrator.status().await
    }

    /// Enter or leave the exclusion window (e.g. a device-detail screen
    /// that must not be disturbed by background syncs)
    pub async fn set_exclusion(&self, active: bool) {
        self.orchestrator.set_exclusion(active).await;
    }

    /// Stop everything and clear all locks, counters, and cached state
    pub async fn force_reset(&self) {
        self.orchestrator.force_reset().await;
    }

    /// Discovery sweep, optionally filtered by vendor
    pub async fn scan(
        &self,
        vendor: Option<Vendor>,
        bypass_locks: bool,
    ) -> Vec<DiscoveredDevice> {
        self.coordinator.scan(vendor, bypass_locks).await
    }

    /// Connect to a ring and persist it as the connected device.
    ///
    /// Holds the exclusive connect lock for the duration; a concurrent
    /// connect or sync makes this fail with `Locked`.
    pub async fn connect_device(
        &self,
        uuid: &str,
        vendor: Vendor,
        display_name: &str,
    ) -> Result<DeviceIdentity, SyncError> {
        let identity = DeviceIdentity::new(uuid, vendor, display_name);
        identity.validate()?;
        self.coordinator.try_acquire_connect(uuid).await?;
        let result = self.connect_inner(&identity).await;
        self.coordinator.release_connect(uuid).await;
        self.notifier.notify(SyncEvent::AnimationStop);
        result
    }

    async fn connect_inner(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<DeviceIdentity, SyncError> {
        self.notifier.notify(SyncEvent::ConnectStart {
            uuid: identity.uuid.clone(),
        });
        let connect_timeout = self.config.connect_timeout();
        let outcome =
            tokio::time::timeout(connect_timeout, self.transport.connect(&identity.uuid)).await;
        let err = match outcome {
            Ok(Ok(true)) => {
                let json = serde_json::to_string(identity)?;
                self.store.set_string(CONNECTED_DEVICE_KEY, &json).await;
                self.notifier.notify(SyncEvent::ConnectSuccess {
                    uuid: identity.uuid.clone(),
                });
                log::info!("connected to {} ({})", identity.display_name, identity.uuid);
                return Ok(identity.clone());
            }
            Ok(Ok(false)) => {
                SyncError::ConnectionFailed("transport refused the connection".into())
            }
            Ok(Err(err)) => err,
            Err(_) => SyncError::Timeout(format!("connect exceeded {connect_timeout:?}")),
        };
        self.notifier.notify(SyncEvent::ConnectFailure {
            uuid: identity.uuid.clone(),
            reason: err.to_string(),
        });
        log::warn!("connect to {} failed: {err}", identity.uuid);
        Err(err)
    }

    /// Disconnect and forget the persisted device
    pub async fn disconnect_device(&self) -> Result<(), SyncError> {
        let Some(identity) = self.connected_device().await else {
            return Ok(());
        };
        if let Err(err) = self.transport.disconnect(&identity.uuid).await {
            log::warn!("transport disconnect failed, forgetting device anyway: {err}");
        }
        self.store.remove(CONNECTED_DEVICE_KEY).await;
        self.store.remove(LAST_RECORD_KEY).await;
        self.coordinator.reset_locks().await;
        log::info!("disconnected from {}", identity.uuid);
        Ok(())
    }

    /// The persisted connected device, if any
    pub async fn connected_device(&self) -> Option<DeviceIdentity> {
        let raw = self.store.get_string(CONNECTED_DEVICE_KEY).await?;
        serde_json::from_str(&raw).ok()
    }

    /// On-demand health retrieval for one device, raw and canonical forms
    pub async fn get_health_data(
        &self,
        vendor: Vendor,
        uuid: &str,
    ) -> Result<RetrievedHealth, SyncError> {
        let display_name = self
            .connected_device()
            .await
            .filter(|device| device.uuid == uuid)
            .map(|device| device.display_name)
            .unwrap_or_default();
        let identity = DeviceIdentity::new(uuid, vendor, display_name);
        self.retriever.retrieve(&identity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{MockTransport, RecordingBackend, RecordingNotifier};
    use crate::types::SyncSource;
    use std::sync::atomic::Ordering;

    struct Harness {
        transport: Arc<MockTransport>,
        backend: Arc<RecordingBackend>,
        notifier: Arc<RecordingNotifier>,
        engine: RingEngine,
    }

    fn harness() -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let transport = Arc::new(MockTransport::connected());
        let backend = Arc::new(RecordingBackend::default());
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = RingEngine::builder(Arc::clone(&transport) as Arc<dyn RingTransport>)
            .config(SyncConfig {
                authorized: true,
                ..SyncConfig::default()
            })
            .backend(Arc::clone(&backend) as Arc<dyn BackendSync>)
            .notifier(Arc::clone(&notifier) as Arc<dyn Notifier>)
            .build();
        Harness {
            transport,
            backend,
            notifier,
            engine,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_persists_device_and_emits_events() {
        let h = harness();

        let identity = h
            .engine
            .connect_device("AA:BB:CC:DD:EE:FF", Vendor::Yc, "Ring R02")
            .await
            .unwrap();

        assert_eq!(identity.uuid, "AA:BB:CC:DD:EE:FF");
        let persisted = h.engine.connected_device().await.unwrap();
        assert_eq!(persisted, identity);

        let events = h.notifier.events();
        assert!(matches!(events[0], SyncEvent::ConnectStart { .. }));
        assert!(matches!(events[1], SyncEvent::ConnectSuccess { .. }));
        assert!(matches!(events[2], SyncEvent::AnimationStop));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_releases_lock() {
        let h = harness();
        h.transport.push_connect(Ok(false));

        let result = h
            .engine
            .connect_device("AA:BB:CC:DD:EE:FF", Vendor::Yc, "Ring R02")
            .await;
        assert!(matches!(result, Err(SyncError::ConnectionFailed(_))));
        assert!(h.engine.connected_device().await.is_none());
        assert!(h
            .notifier
            .events()
            .iter()
            .any(|e| matches!(e, SyncEvent::ConnectFailure { .. })));

        // The lock is free for the next attempt
        h.engine
            .connect_device("AA:BB:CC:DD:EE:FF", Vendor::Yc, "Ring R02")
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_rejects_placeholder_uuid() {
        let h = harness();

        let result = h.engine.connect_device("unknown", Vendor::Qc, "Ring").await;
        assert!(matches!(result, Err(SyncError::InvalidDevice(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_forgets_device() {
        let h = harness();
        h.engine
            .connect_device("AA:BB:CC:DD:EE:FF", Vendor::Yc, "Ring R02")
            .await
            .unwrap();

        h.engine.disconnect_device().await.unwrap();

        assert!(h.engine.connected_device().await.is_none());
        assert_eq!(h.transport.disconnect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_health_data_returns_both_forms() {
        let h = harness();

        let retrieved = h
            .engine
            .get_health_data(Vendor::Yc, "AA:BB:CC:DD:EE:FF")
            .await
            .unwrap();

        assert!(retrieved.normalized.heart_rate.is_some());
        assert!(!retrieved
            .raw
            .metric_array("heartList")
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_sync_end_to_end() {
        let h = harness();
        h.engine
            .connect_device("AA:BB:CC:DD:EE:FF", Vendor::Yc, "Ring R02")
            .await
            .unwrap();

        h.engine.perform_manual_sync().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;

        assert_eq!(h.backend.sync_calls.load(Ordering::SeqCst), 1);
        let status = h.engine.status().await;
        assert_eq!(status.last_sync_source, Some(SyncSource::Device));
        assert!(status.is_running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_passthrough() {
        let h = harness();
        h.transport.set_scan_results(vec![DiscoveredDevice {
            id: "AA:BB:CC:DD:EE:FF".into(),
            name: "Ring R02".into(),
            rssi: -55,
            vendor: Some(Vendor::Yc),
        }]);

        let devices = h.engine.scan(Some(Vendor::Yc), false).await;
        assert_eq!(devices.len(), 1);
    }

    #[tokio::test]
    async fn test_scheduler_requires_authorization() {
        let transport = Arc::new(MockTransport::connected());
        let engine = RingEngine::builder(transport as Arc<dyn RingTransport>).build();

        let result = engine.start_scheduler().await;
        assert!(matches!(result, Err(SyncError::NotAuthorized)));
    }
}
