//! Connection and scan coordination
//!
//! All hardware connect and discovery operations pass through the
//! `ConnectionCoordinator`, which serializes them process-wide:
//! - one connect sequence at a time, with per-device attempt admission
//! - connectivity probes deduplicated behind a short-lived cache and a
//!   single-flight in-flight map (concurrent callers share one probe)
//! - discovery sweeps are single-flight and wait out a held connect lock
//!   a bounded number of times before giving up
//!
//! Expected hardware conditions (no devices, radio off, probe timeout)
//! degrade to an empty result or `false`; only contract violations such as
//! an empty identifier surface as errors.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::transport::RingTransport;
use crate::types::{DiscoveredDevice, Vendor};

type SharedProbe = Shared<BoxFuture<'static, bool>>;
type SharedScan = Shared<BoxFuture<'static, Vec<DiscoveredDevice>>>;

struct CoordinatorState {
    /// The process-wide exclusive flag; held by connect sequences and by
    /// health retrieval for the duration of a sync
    connect_in_progress: bool,
    /// Devices with an admitted, unreleased connect attempt
    attempted: HashSet<String>,
    /// Probe answers keyed by `(uuid, vendor)`, valid for the cache TTL
    probe_cache: HashMap<String, (bool, Instant)>,
    /// In-flight probes; concurrent callers await the same future
    inflight_probes: HashMap<String, SharedProbe>,
    /// In-flight discovery sweep, if any
    inflight_scan: Option<SharedScan>,
    /// Cancellation context for auxiliary queries
    cancel_token: CancellationToken,
}

/// Process-wide coordinator for connect, probe, and scan operations
#[derive(Clone)]
pub struct ConnectionCoordinator {
    transport: Arc<dyn RingTransport>,
    config: Arc<SyncConfig>,
    state: Arc<Mutex<CoordinatorState>>,
}

impl ConnectionCoordinator {
    pub fn new(transport: Arc<dyn RingTransport>, config: Arc<SyncConfig>) -> Self {
        Self {
            transport,
            config,
            state: Arc::new(Mutex::new(CoordinatorState {
                connect_in_progress: false,
                attempted: HashSet::new(),
                probe_cache: HashMap::new(),
                inflight_probes: HashMap::new(),
                inflight_scan: None,
                cancel_token: CancellationToken::new(),
            })),
        }
    }

    /// Admit one connect sequence.
    ///
    /// Fails with `Locked` when any connect sequence is already in progress
    /// or when this device already has an admitted attempt. The caller must
    /// pair this with `release_connect`.
    pub async fn try_acquire_connect(&self, uuid: &str) -> Result<(), SyncError> {
        if uuid.trim().is_empty() {
            return Err(SyncError::InvalidDevice("connect requires a device uuid".into()));
        }
        let mut state = self.state.lock().await;
        if state.connect_in_progress {
            return Err(SyncError::Locked(
                "another connect sequence is in progress".into(),
            ));
        }
        if state.attempted.contains(uuid) {
            return Err(SyncError::Locked(format!(
                "connect already attempted for {uuid}"
            )));
        }
        state.connect_in_progress = true;
        state.attempted.insert(uuid.to_string());
        log::debug!("connect lock acquired for {uuid}");
        Ok(())
    }

    /// Release the connect lock and this device's attempt admission
    pub async fn release_connect(&self, uuid: &str) {
        let mut state = self.state.lock().await;
        state.connect_in_progress = false;
        state.attempted.remove(uuid);
        log::debug!("connect lock released for {uuid}");
    }

    /// Whether the exclusive connect lock is currently held
    pub async fn is_busy(&self) -> bool {
        self.state.lock().await.connect_in_progress
    }

    /// Clear every lock, admission, cache entry, and in-flight handle.
    /// Pending auxiliary queries are cancelled.
    pub async fn reset_locks(&self) {
        let mut state = self.state.lock().await;
        state.connect_in_progress = false;
        state.attempted.clear();
        state.probe_cache.clear();
        state.inflight_probes.clear();
        state.inflight_scan = None;
        state.cancel_token.cancel();
        state.cancel_token = CancellationToken::new();
        log::info!("all connection locks reset");
    }

    /// Cached, deduplicated connectivity answer.
    ///
    /// A fresh cache entry is returned directly unless `skip_cache` is set.
    /// Otherwise exactly one probe runs per `(uuid, vendor)` key; concurrent
    /// callers await the same in-flight probe. A probe that exceeds the probe
    /// timeout reads as `false` without failing the caller.
    pub async fn is_connected(&self, uuid: &str, vendor: Vendor, skip_cache: bool) -> bool {
        let key = probe_key(uuid, vendor);
        let shared = {
            let mut state = self.state.lock().await;
            if !skip_cache {
                if let Some((value, stored_at)) = state.probe_cache.get(&key) {
                    if stored_at.elapsed() < self.config.connection_cache_ttl {
                        return *value;
                    }
                }
            }
            if let Some(inflight) = state.inflight_probes.get(&key) {
                inflight.clone()
            } else {
                let future = self.spawn_probe(key.clone(), uuid.to_string(), vendor);
                state.inflight_probes.insert(key, future.clone());
                future
            }
        };
        shared.await
    }

    fn spawn_probe(&self, key: String, uuid: String, vendor: Vendor) -> SharedProbe {
        let transport = Arc::clone(&self.transport);
        let state_handle = Arc::clone(&self.state);
        let probe_timeout = self.config.probe_timeout;
        async move {
            let result = match tokio::time::timeout(
                probe_timeout,
                transport.probe_connection(&uuid, vendor),
            )
            .await
            {
                Ok(Ok(connected)) => connected,
                Ok(Err(err)) => {
                    log::warn!("connectivity probe for {uuid} failed: {err}");
                    false
                }
                Err(_) => {
                    log::warn!(
                        "connectivity probe for {uuid} exceeded {probe_timeout:?}, treating as disconnected"
                    );
                    false
                }
            };
            let mut state = state_handle.lock().await;
            state.probe_cache.insert(key.clone(), (result, Instant::now()));
            state.inflight_probes.remove(&key);
            result
        }
        .boxed()
        .shared()
    }

    /// Cancel in-flight auxiliary queries.
    ///
    /// Cancellation is cooperative: a query already inside a native call runs
    /// to completion and its result is discarded, not awaited.
    pub async fn cancel_pending(&self) {
        let mut state = self.state.lock().await;
        state.cancel_token.cancel();
        state.cancel_token = CancellationToken::new();
    }

    /// Auxiliary device-info query (battery level), registered with the
    /// cancellation context so `cancel_pending` covers it
    pub async fn fetch_device_info(&self, uuid: &str) -> Option<i64> {
        let token = self.state.lock().await.cancel_token.clone();
        tokio::select! {
            _ = token.cancelled() => {
                log::debug!("device info query for {uuid} cancelled");
                None
            }
            result = self.transport.battery_level(uuid) => match result {
                Ok(level) => level,
                Err(err) => {
                    log::debug!("device info query for {uuid} failed: {err}");
                    None
                }
            }
        }
    }

    /// Discovery sweep.
    ///
    /// Single-flight: a sweep already in progress is joined by every caller.
    /// While the connect lock is held and `bypass_locks` is false, the call
    /// waits a fixed delay and retries, bounded to the configured attempt
    /// count, then returns an empty result. Each sweep races the transport
    /// against the scan timeout and retries when zero devices are found.
    pub async fn scan(
        &self,
        vendor: Option<Vendor>,
        bypass_locks: bool,
    ) -> Vec<DiscoveredDevice> {
        for attempt in 0..self.config.scan_lock_attempts {
            let shared = {
                let mut state = self.state.lock().await;
                if let Some(inflight) = &state.inflight_scan {
                    Some(inflight.clone())
                } else if state.connect_in_progress && !bypass_locks {
                    None
                } else {
                    let future = self.spawn_scan(vendor);
                    state.inflight_scan = Some(future.clone());
                    Some(future)
                }
            };
            match shared {
                Some(future) => return future.await,
                None => {
                    log::debug!(
                        "scan waiting for connect lock (attempt {}/{})",
                        attempt + 1,
                        self.config.scan_lock_attempts
                    );
                    tokio::time::sleep(self.config.scan_lock_wait).await;
                }
            }
        }
        log::warn!("scan gave up waiting for the connect lock, returning no devices");
        Vec::new()
    }

    fn spawn_scan(&self, vendor: Option<Vendor>) -> SharedScan {
        let transport = Arc::clone(&self.transport);
        let state_handle = Arc::clone(&self.state);
        let scan_timeout = self.config.scan_timeout;
        let retries = self.config.scan_retries;
        async move {
            let mut devices = Vec::new();
            for sweep in 0..=retries {
                match tokio::time::timeout(scan_timeout, transport.scan_for_devices(vendor)).await
                {
                    Ok(Ok(found)) if !found.is_empty() => {
                        devices = found;
                        break;
                    }
                    Ok(Ok(_)) => {
                        log::debug!("discovery sweep {} found no devices", sweep + 1);
                    }
                    Ok(Err(err)) => {
                        log::warn!("discovery sweep {} failed: {err}", sweep + 1);
                    }
                    Err(_) => {
                        log::warn!(
                            "discovery sweep {} timed out after {scan_timeout:?}",
                            sweep + 1
                        );
                    }
                }
            }
            let deduped = dedupe_devices(devices);
            state_handle.lock().await.inflight_scan = None;
            deduped
        }
        .boxed()
        .shared()
    }
}

fn probe_key(uuid: &str, vendor: Vendor) -> String {
    format!("{}:{}", uuid, vendor.as_str())
}

/// Alias alternate identifier spellings (separator and case differences) to
/// one canonical key
fn canonical_device_key(id: &str) -> String {
    id.chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect::<String>()
        .to_uppercase()
}

/// Drop devices whose canonical identifier was already seen, keeping the
/// first occurrence
fn dedupe_devices(devices: Vec<DiscoveredDevice>) -> Vec<DiscoveredDevice> {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|device| seen.insert(canonical_device_key(&device.id)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockTransport;
    use futures::future::join_all;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn coordinator(transport: Arc<MockTransport>) -> ConnectionCoordinator {
        ConnectionCoordinator::new(transport, Arc::new(SyncConfig::default()))
    }

    fn device(id: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            id: id.to_string(),
            name: "Ring".to_string(),
            rssi: -60,
            vendor: Some(Vendor::Yc),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_probes_share_one_underlying_call() {
        let transport = Arc::new(MockTransport::connected());
        transport.set_probe_delay(Duration::from_millis(100));
        let coordinator = coordinator(Arc::clone(&transport));

        let callers = (0..5).map(|_| {
            let c = coordinator.clone();
            async move { c.is_connected("AA:BB", Vendor::Yc, false).await }
        });
        let results = join_all(callers).await;

        assert_eq!(transport.probe_calls.load(Ordering::SeqCst), 1);
        assert!(results.into_iter().all(|connected| connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_serves_fresh_answers_and_expires() {
        let transport = Arc::new(MockTransport::connected());
        let coordinator = coordinator(Arc::clone(&transport));

        assert!(coordinator.is_connected("AA:BB", Vendor::Yc, false).await);
        assert!(coordinator.is_connected("AA:BB", Vendor::Yc, false).await);
        assert_eq!(transport.probe_calls.load(Ordering::SeqCst), 1);

        // Past the TTL a fresh probe is issued
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(coordinator.is_connected("AA:BB", Vendor::Yc, false).await);
        assert_eq!(transport.probe_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_cache_forces_a_probe() {
        let transport = Arc::new(MockTransport::connected());
        let coordinator = coordinator(Arc::clone(&transport));

        assert!(coordinator.is_connected("AA:BB", Vendor::Yc, false).await);
        assert!(coordinator.is_connected("AA:BB", Vendor::Yc, true).await);
        assert_eq!(transport.probe_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_degrades_to_disconnected() {
        let transport = Arc::new(MockTransport::connected());
        transport.set_probe_delay(Duration::from_secs(20));
        let coordinator = coordinator(Arc::clone(&transport));

        assert!(!coordinator.is_connected("AA:BB", Vendor::Yc, false).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_devices_probe_independently() {
        let transport = Arc::new(MockTransport::connected());
        let coordinator = coordinator(Arc::clone(&transport));

        coordinator.is_connected("AA:BB", Vendor::Yc, false).await;
        coordinator.is_connected("CC:DD", Vendor::Qc, false).await;
        assert_eq!(transport.probe_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_lock_admission() {
        let transport = Arc::new(MockTransport::new());
        let coordinator = coordinator(transport);

        coordinator.try_acquire_connect("AA:BB").await.unwrap();
        let second = coordinator.try_acquire_connect("CC:DD").await;
        assert!(matches!(second, Err(SyncError::Locked(_))));

        coordinator.release_connect("AA:BB").await;
        coordinator.try_acquire_connect("CC:DD").await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_uuid_is_a_contract_violation() {
        let transport = Arc::new(MockTransport::new());
        let coordinator = coordinator(transport);

        let result = coordinator.try_acquire_connect("  ").await;
        assert!(matches!(result, Err(SyncError::InvalidDevice(_))));
    }

    #[tokio::test]
    async fn test_reset_locks_clears_admissions() {
        let transport = Arc::new(MockTransport::new());
        let coordinator = coordinator(transport);

        coordinator.try_acquire_connect("AA:BB").await.unwrap();
        coordinator.reset_locks().await;
        coordinator.try_acquire_connect("AA:BB").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_scans_share_one_sweep() {
        let transport = Arc::new(MockTransport::new());
        transport.set_scan_delay(Duration::from_millis(200));
        transport.set_scan_results(vec![device("AA:BB:CC:DD:EE:FF")]);
        let coordinator = coordinator(Arc::clone(&transport));

        let callers = (0..3).map(|_| {
            let c = coordinator.clone();
            async move { c.scan(None, false).await }
        });
        let results = join_all(callers).await;

        assert_eq!(transport.scan_calls.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(results[0].len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_waits_out_connect_lock_then_gives_up() {
        let transport = Arc::new(MockTransport::new());
        transport.set_scan_results(vec![device("AA:BB:CC:DD:EE:FF")]);
        let coordinator = coordinator(Arc::clone(&transport));

        coordinator.try_acquire_connect("AA:BB").await.unwrap();
        let devices = coordinator.scan(None, false).await;

        assert!(devices.is_empty());
        assert_eq!(transport.scan_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_proceeds_once_lock_releases() {
        let transport = Arc::new(MockTransport::new());
        transport.set_scan_results(vec![device("AA:BB:CC:DD:EE:FF")]);
        let coordinator = coordinator(Arc::clone(&transport));

        coordinator.try_acquire_connect("AA:BB").await.unwrap();
        let scanner = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.scan(None, false).await })
        };
        // Release while the scan is in its second lock wait
        tokio::time::sleep(Duration::from_secs(2)).await;
        coordinator.release_connect("AA:BB").await;

        let devices = scanner.await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(transport.scan_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_bypasses_lock_when_asked() {
        let transport = Arc::new(MockTransport::new());
        transport.set_scan_results(vec![device("AA:BB:CC:DD:EE:FF")]);
        let coordinator = coordinator(Arc::clone(&transport));

        coordinator.try_acquire_connect("AA:BB").await.unwrap();
        let devices = coordinator.scan(None, true).await;

        assert_eq!(devices.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_retries_when_nothing_found() {
        let transport = Arc::new(MockTransport::new());
        let coordinator = coordinator(Arc::clone(&transport));

        let devices = coordinator.scan(None, false).await;

        assert!(devices.is_empty());
        // One sweep plus the configured retries
        assert_eq!(transport.scan_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_dedupes_aliased_identifiers() {
        let transport = Arc::new(MockTransport::new());
        transport.set_scan_results(vec![
            device("AA:BB:CC:DD:EE:FF"),
            device("aabbccddeeff"),
            device("AA-BB-CC-DD-EE-FF"),
            device("11:22:33:44:55:66"),
        ]);
        let coordinator = coordinator(Arc::clone(&transport));

        let devices = coordinator.scan(None, false).await;

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, "AA:BB:CC:DD:EE:FF");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_discards_device_info() {
        let transport = Arc::new(MockTransport::connected());
        *transport.battery_delay.lock().unwrap() = Duration::from_secs(5);
        let coordinator = coordinator(Arc::clone(&transport));

        let query = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.fetch_device_info("AA:BB").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.cancel_pending().await;

        assert_eq!(query.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_device_info_after_cancel_uses_fresh_token() {
        let transport = Arc::new(MockTransport::connected());
        let coordinator = coordinator(Arc::clone(&transport));

        coordinator.cancel_pending().await;
        assert_eq!(coordinator.fetch_device_info("AA:BB").await, Some(80));
    }
}
