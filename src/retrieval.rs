//! Health data retrieval protocol
//!
//! Obtains one complete raw payload from one ring with bounded retries.
//! Each attempt ensures the connection, cancels stale auxiliary queries,
//! fetches under an overall timeout, and validates that the payload is
//! meaningful. Failures other than `Locked` and `EmptyData` trigger a
//! disconnect/reconnect recovery sequence before the next attempt.

use std::sync::Arc;

use crate::config::SyncConfig;
use crate::coordinator::ConnectionCoordinator;
use crate::error::{ErrorClass, SyncError};
use crate::mapping::mapping_for;
use crate::normalizer::Normalizer;
use crate::transport::{Notifier, RingTransport, SyncEvent};
use crate::types::{DeviceIdentity, NormalizedHealthData, RawHealthPayload};

/// One successful retrieval: the vendor-native payload and its canonical form
#[derive(Debug, Clone)]
pub struct RetrievedHealth {
    pub raw: RawHealthPayload,
    pub normalized: NormalizedHealthData,
}

/// Bounded-retry retrieval wrapper around a single device sync attempt
pub struct HealthRetriever {
    transport: Arc<dyn RingTransport>,
    coordinator: ConnectionCoordinator,
    config: Arc<SyncConfig>,
    notifier: Arc<dyn Notifier>,
}

impl HealthRetriever {
    pub fn new(
        transport: Arc<dyn RingTransport>,
        coordinator: ConnectionCoordinator,
        config: Arc<SyncConfig>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            transport,
            coordinator,
            config,
            notifier,
        }
    }

    /// Retrieve and normalize one health payload.
    ///
    /// Holds the exclusive connect lock for the whole run so scans and other
    /// connect sequences queue behind it. `Locked` and `EmptyData` terminate
    /// immediately; other failures are retried up to the configured attempt
    /// count with recovery in between.
    pub async fn retrieve(&self, identity: &DeviceIdentity) -> Result<RetrievedHealth, SyncError> {
        identity.validate()?;
        self.coordinator.try_acquire_connect(&identity.uuid).await?;
        let result = self.run_attempts(identity).await;
        self.coordinator.release_connect(&identity.uuid).await;
        result
    }

    async fn run_attempts(&self, identity: &DeviceIdentity) -> Result<RetrievedHealth, SyncError> {
        let mut last_error: Option<SyncError> = None;
        for attempt in 1..=self.config.fetch_attempts {
            match self.attempt_once(identity, attempt).await {
                Ok(retrieved) => {
                    log::info!(
                        "health retrieval for {} succeeded on attempt {attempt}",
                        identity.uuid
                    );
                    return Ok(retrieved);
                }
                Err(err) => {
                    if !ErrorClass::classify(&err).retryable() {
                        log::warn!(
                            "health retrieval for {} aborted on attempt {attempt}: {err}",
                            identity.uuid
                        );
                        return Err(err);
                    }
                    log::warn!(
                        "health retrieval attempt {attempt}/{} for {} failed: {err}",
                        self.config.fetch_attempts,
                        identity.uuid
                    );
                    last_error = Some(err);
                    if attempt < self.config.fetch_attempts {
                        self.recover(identity, attempt).await;
                    }
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| SyncError::Unknown("health retrieval produced no result".into())))
    }

    async fn attempt_once(
        &self,
        identity: &DeviceIdentity,
        attempt: u32,
    ) -> Result<RetrievedHealth, SyncError> {
        self.ensure_connected(identity, attempt).await?;

        // Stale device-info queries must not interleave with the fetch
        self.coordinator.cancel_pending().await;

        let payload = match tokio::time::timeout(
            self.config.fetch_timeout,
            self.transport.fetch_raw_health_data(&identity.uuid),
        )
        .await
        {
            Ok(Ok(payload)) => payload,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(SyncError::Timeout(format!(
                    "health fetch exceeded {:?}",
                    self.config.fetch_timeout
                )))
            }
        };

        let mapping = mapping_for(identity.vendor, self.config.platform);
        if !payload.has_meaningful_data(&mapping) {
            return Err(SyncError::EmptyData);
        }

        let mut normalized =
            Normalizer::normalize(&payload, identity.vendor, self.config.platform);
        if normalized.battery.is_none() {
            normalized.battery = self.coordinator.fetch_device_info(&identity.uuid).await;
        }

        Ok(RetrievedHealth {
            raw: payload,
            normalized,
        })
    }

    /// Reuse an existing connection when the probe confirms one, otherwise
    /// connect under the platform-appropriate timeout. Retries skip the
    /// probe cache; a stale positive answer would mask a dropped link.
    async fn ensure_connected(
        &self,
        identity: &DeviceIdentity,
        attempt: u32,
    ) -> Result<(), SyncError> {
        let skip_cache = attempt > 1;
        if self
            .coordinator
            .is_connected(&identity.uuid, identity.vendor, skip_cache)
            .await
        {
            return Ok(());
        }

        self.notifier.notify(SyncEvent::ConnectStart {
            uuid: identity.uuid.clone(),
        });
        let connect_timeout = self.config.connect_timeout();
        let outcome = tokio::time::timeout(connect_timeout, self.transport.connect(&identity.uuid))
            .await;
        match outcome {
            Ok(Ok(true)) => {
                self.notifier.notify(SyncEvent::ConnectSuccess {
                    uuid: identity.uuid.clone(),
                });
                Ok(())
            }
            Ok(Ok(false)) => {
                let err = SyncError::ConnectionFailed("transport refused the connection".into());
                self.notify_connect_failure(identity, &err);
                Err(err)
            }
            Ok(Err(err)) => {
                self.notify_connect_failure(identity, &err);
                Err(err)
            }
            Err(_) => {
                let err =
                    SyncError::Timeout(format!("connect exceeded {connect_timeout:?}"));
                self.notify_connect_failure(identity, &err);
                Err(err)
            }
        }
    }

    fn notify_connect_failure(&self, identity: &DeviceIdentity, err: &SyncError) {
        self.notifier.notify(SyncEvent::ConnectFailure {
            uuid: identity.uuid.clone(),
            reason: err.to_string(),
        });
    }

    /// Disconnect, settle, reconnect, then back off linearly with the
    /// attempt index before the next try
    async fn recover(&self, identity: &DeviceIdentity, attempt: u32) {
        log::info!("recovering connection to {} before retry", identity.uuid);
        if let Err(err) = self.transport.disconnect(&identity.uuid).await {
            log::debug!("recovery disconnect failed: {err}");
        }
        tokio::time::sleep(self.config.recovery_delay).await;
        if let Err(err) = self.transport.connect(&identity.uuid).await {
            log::debug!("recovery reconnect failed: {err}");
        }
        tokio::time::sleep(self.config.recovery_delay * attempt).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ConnectionCoordinator;
    use crate::transport::testing::{MockTransport, RecordingNotifier};
    use crate::types::Vendor;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("AA:BB:CC:DD:EE:FF", Vendor::Yc, "Ring R02")
    }

    fn retriever(
        transport: Arc<MockTransport>,
        notifier: Arc<RecordingNotifier>,
    ) -> HealthRetriever {
        let config = Arc::new(SyncConfig::default());
        let coordinator =
            ConnectionCoordinator::new(transport.clone() as Arc<dyn RingTransport>, config.clone());
        HealthRetriever::new(transport, coordinator, config, notifier)
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_retrieval_reuses_connection() {
        let transport = Arc::new(MockTransport::connected());
        let notifier = Arc::new(RecordingNotifier::new());
        let retriever = retriever(Arc::clone(&transport), Arc::clone(&notifier));

        let retrieved = retriever.retrieve(&identity()).await.unwrap();

        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 0);
        assert_eq!(transport.fetch_calls.load(Ordering::SeqCst), 1);
        assert!(retrieved.normalized.heart_rate.is_some());
        // No connect happened, so no connect events either
        assert!(notifier.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_when_probe_says_disconnected() {
        let transport = Arc::new(MockTransport::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let retriever = retriever(Arc::clone(&transport), Arc::clone(&notifier));

        retriever.retrieve(&identity()).await.unwrap();

        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 1);
        let events = notifier.events();
        assert!(matches!(events[0], SyncEvent::ConnectStart { .. }));
        assert!(matches!(events[1], SyncEvent::ConnectSuccess { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_data_terminates_without_retry() {
        let transport = Arc::new(MockTransport::connected());
        transport.push_fetch(Ok(MockTransport::empty_payload()));
        transport.push_fetch(Ok(MockTransport::meaningful_payload()));
        let notifier = Arc::new(RecordingNotifier::new());
        let retriever = retriever(Arc::clone(&transport), notifier);

        let result = retriever.retrieve(&identity()).await;

        assert!(matches!(result, Err(SyncError::EmptyData)));
        assert_eq!(transport.fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.disconnect_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_between_attempts() {
        let transport = Arc::new(MockTransport::connected());
        transport.push_fetch(Err(SyncError::ConnectionFailed("link dropped".into())));
        let notifier = Arc::new(RecordingNotifier::new());
        let retriever = retriever(Arc::clone(&transport), notifier);

        let retrieved = retriever.retrieve(&identity()).await.unwrap();

        assert_eq!(transport.fetch_calls.load(Ordering::SeqCst), 2);
        // Recovery disconnected and reconnected the link
        assert_eq!(transport.disconnect_calls.load(Ordering::SeqCst), 1);
        assert!(transport.connect_calls.load(Ordering::SeqCst) >= 1);
        assert!(retrieved.normalized.steps.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_attempts_exhausted_surfaces_last_error() {
        let transport = Arc::new(MockTransport::connected());
        for _ in 0..3 {
            transport.push_fetch(Err(SyncError::ConnectionFailed("link dropped".into())));
        }
        let notifier = Arc::new(RecordingNotifier::new());
        let retriever = retriever(Arc::clone(&transport), notifier);

        let result = retriever.retrieve(&identity()).await;

        assert!(matches!(result, Err(SyncError::ConnectionFailed(_))));
        assert_eq!(transport.fetch_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_is_classified_and_retried() {
        let transport = Arc::new(MockTransport::connected());
        transport.set_fetch_delay(Duration::from_secs(100));
        let notifier = Arc::new(RecordingNotifier::new());
        let retriever = retriever(Arc::clone(&transport), notifier);

        let result = retriever.retrieve(&identity()).await;

        assert!(matches!(result, Err(SyncError::Timeout(_))));
        assert_eq!(transport.fetch_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_coordinator_fails_immediately() {
        let transport = Arc::new(MockTransport::connected());
        let notifier = Arc::new(RecordingNotifier::new());
        let retriever = retriever(Arc::clone(&transport), notifier);

        retriever
            .coordinator
            .try_acquire_connect("11:22:33:44:55:66")
            .await
            .unwrap();
        let result = retriever.retrieve(&identity()).await;

        assert!(matches!(result, Err(SyncError::Locked(_))));
        assert_eq!(transport.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_identity_rejected_before_any_io() {
        let transport = Arc::new(MockTransport::connected());
        let notifier = Arc::new(RecordingNotifier::new());
        let retriever = retriever(Arc::clone(&transport), notifier);

        let bad = DeviceIdentity::new("unknown", Vendor::Yc, "Ring");
        let result = retriever.retrieve(&bad).await;

        assert!(matches!(result, Err(SyncError::InvalidDevice(_))));
        assert_eq!(transport.probe_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_only_payload_is_meaningful() {
        let transport = Arc::new(MockTransport::connected());
        transport.push_fetch(Ok(crate::types::RawHealthPayload::new(json!({
            "summary": {"totalStep": 3200, "totalCalorie": 150}
        }))));
        let notifier = Arc::new(RecordingNotifier::new());
        let retriever = retriever(Arc::clone(&transport), notifier);

        let retrieved = retriever.retrieve(&identity()).await.unwrap();

        assert_eq!(retrieved.normalized.steps.unwrap().current, 3200.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_merged_from_device_info() {
        let transport = Arc::new(MockTransport::connected());
        let notifier = Arc::new(RecordingNotifier::new());
        let retriever = retriever(Arc::clone(&transport), notifier);

        let retrieved = retriever.retrieve(&identity()).await.unwrap();

        // The payload has no battery array; the auxiliary query fills it
        assert_eq!(retrieved.normalized.battery, Some(80));
        assert_eq!(transport.battery_calls.load(Ordering::SeqCst), 1);
    }
}
