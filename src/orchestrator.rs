//! Sync orchestration
//!
//! The `SyncOrchestrator` owns the scheduling state machine
//! (`Idle → Initializing → Running ⇄ Paused → Stopped`) and runs periodic and
//! manual sync ticks. Each tick fans out a device-source and an OS-source
//! lane concurrently with settle-all semantics; failures are classified and
//! converted into scheduling decisions (retry next tick, back off, cool
//! down) instead of being re-raised.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::coordinator::ConnectionCoordinator;
use crate::error::{ErrorClass, SyncError};
use crate::retrieval::HealthRetriever;
use crate::transport::{
    BackendSync, DeviceStore, Notifier, OsHealthProvider, RingTransport, SyncEvent,
    CONNECTED_DEVICE_KEY, LAST_RECORD_KEY,
};
use crate::types::{
    DeviceIdentity, MetricValue, NormalizedHealthData, SyncSource, SyncStatus,
};

/// Scheduler run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Initializing,
    Running,
    Paused,
    Stopped,
}

struct OrchestratorState {
    run_state: RunState,
    device_sync_active: bool,
    os_sync_active: bool,
    consecutive_errors: u32,
    class_errors: HashMap<ErrorClass, u32>,
    cooldown_until: Option<Instant>,
    /// One notification per cooldown entry; cleared on success
    cooldown_notified: bool,
    last_error_at: Option<DateTime<Utc>>,
    last_sync_at: Option<DateTime<Utc>>,
    last_sync_source: Option<SyncSource>,
    exclusion_active: bool,
}

impl OrchestratorState {
    fn new() -> Self {
        Self {
            run_state: RunState::Idle,
            device_sync_active: false,
            os_sync_active: false,
            consecutive_errors: 0,
            class_errors: HashMap::new(),
            cooldown_until: None,
            cooldown_notified: false,
            last_error_at: None,
            last_sync_at: None,
            last_sync_source: None,
            exclusion_active: false,
        }
    }
}

/// Periodic and on-demand sync scheduler
#[derive(Clone)]
pub struct SyncOrchestrator {
    config: Arc<SyncConfig>,
    authorized: Arc<AtomicBool>,
    transport: Arc<dyn RingTransport>,
    coordinator: ConnectionCoordinator,
    retriever: Arc<HealthRetriever>,
    store: Arc<dyn DeviceStore>,
    backend: Arc<dyn BackendSync>,
    notifier: Arc<dyn Notifier>,
    os_health: Arc<dyn OsHealthProvider>,
    state: Arc<Mutex<OrchestratorState>>,
    ticker: Arc<Mutex<Option<(JoinHandle<()>, CancellationToken)>>>,
    init_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    lane_tasks: Arc<Mutex<Vec<AbortHandle>>>,
}

type LaneResult = Result<Option<SyncSource>, SyncError>;

impl SyncOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<SyncConfig>,
        transport: Arc<dyn RingTransport>,
        coordinator: ConnectionCoordinator,
        retriever: Arc<HealthRetriever>,
        store: Arc<dyn DeviceStore>,
        backend: Arc<dyn BackendSync>,
        notifier: Arc<dyn Notifier>,
        os_health: Arc<dyn OsHealthProvider>,
    ) -> Self {
        let authorized = Arc::new(AtomicBool::new(config.authorized));
        Self {
            config,
            authorized,
            transport,
            coordinator,
            retriever,
            store,
            backend,
            notifier,
            os_health,
            state: Arc::new(Mutex::new(OrchestratorState::new())),
            ticker: Arc::new(Mutex::new(None)),
            init_task: Arc::new(Mutex::new(None)),
            lane_tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Mark the session authenticated or not; the scheduler refuses to start
    /// without an authenticated session
    pub fn set_authorized(&self, authorized: bool) {
        self.authorized.store(authorized, Ordering::SeqCst);
    }

    /// Start the scheduler.
    ///
    /// Refuses when unauthenticated, initializing, or already running. A
    /// `manual` start while running performs an immediate tick without
    /// touching scheduling state. First start settles, probes radio
    /// readiness, arms the periodic timer, and runs an initial tick.
    pub async fn start(&self, manual: bool) -> Result<(), SyncError> {
        if !self.authorized.load(Ordering::SeqCst) {
            log::warn!("sync start refused: no authenticated session");
            return Err(SyncError::NotAuthorized);
        }

        let already_running = {
            let mut state = self.state.lock().await;
            match state.run_state {
                RunState::Initializing => {
                    return Err(SyncError::Locked("sync scheduler is initializing".into()))
                }
                RunState::Running | RunState::Paused => {
                    if manual {
                        true
                    } else {
                        return Err(SyncError::Locked(
                            "sync scheduler is already running".into(),
                        ));
                    }
                }
                RunState::Idle | RunState::Stopped => {
                    state.run_state = RunState::Initializing;
                    false
                }
            }
        };

        if already_running {
            self.tick(true).await;
            return Ok(());
        }

        let this = self.clone();
        let init = tokio::spawn(async move {
            tokio::time::sleep(this.config.settle_delay).await;
            if !this.transport.is_radio_on().await {
                log::warn!("bluetooth radio is off; device syncs will fail until it returns");
            }
            {
                this.state.lock().await.run_state = RunState::Running;
            }
            this.spawn_ticker().await;
            log::info!(
                "sync scheduler started, interval {:?}",
                this.config.sync_interval
            );
            this.tick(false).await;
        });
        *self.init_task.lock().await = Some(init);
        Ok(())
    }

    /// Stop the scheduler and abort any in-flight sync work
    pub async fn stop(&self) {
        self.abort_init().await;
        self.stop_ticker().await;
        self.abort_lanes().await;
        // Aborted lanes may still hold the connect admission
        self.coordinator.reset_locks().await;
        let mut state = self.state.lock().await;
        state.run_state = RunState::Stopped;
        state.device_sync_active = false;
        state.os_sync_active = false;
        log::info!("sync scheduler stopped");
    }

    /// Stop everything, reset counters and cooldown, and clear every
    /// coordinator lock. The scheduler returns to `Idle`.
    pub async fn force_reset(&self) {
        self.stop().await;
        {
            let mut state = self.state.lock().await;
            *state = OrchestratorState::new();
        }
        self.coordinator.reset_locks().await;
        log::info!("sync scheduler force-reset");
    }

    /// Halt the periodic timer without losing counters
    pub async fn pause(&self) {
        {
            let mut state = self.state.lock().await;
            if state.run_state != RunState::Running {
                return;
            }
            state.run_state = RunState::Paused;
        }
        self.stop_ticker().await;
        log::info!("sync scheduler paused");
    }

    /// Rearm the periodic timer, optionally performing an immediate tick
    pub async fn resume(&self, trigger_immediately: bool) {
        {
            let mut state = self.state.lock().await;
            if state.run_state != RunState::Paused {
                return;
            }
            state.run_state = RunState::Running;
        }
        self.spawn_ticker().await;
        log::info!("sync scheduler resumed");
        if trigger_immediately {
            self.tick(false).await;
        }
    }

    /// Enter or leave the exclusion window.
    ///
    /// Entering force-interrupts any active sync lanes and pauses the
    /// scheduler; leaving resumes it.
    pub async fn set_exclusion(&self, active: bool) {
        if active {
            self.abort_lanes().await;
            // Aborted lanes may still hold the connect admission
            self.coordinator.reset_locks().await;
            {
                let mut state = self.state.lock().await;
                state.exclusion_active = true;
                state.device_sync_active = false;
                state.os_sync_active = false;
                if state.run_state == RunState::Running {
                    state.run_state = RunState::Paused;
                }
            }
            self.stop_ticker().await;
            log::info!("exclusion window entered, scheduled syncs suspended");
        } else {
            let should_resume = {
                let mut state = self.state.lock().await;
                state.exclusion_active = false;
                state.run_state == RunState::Paused
            };
            log::info!("exclusion window left");
            if should_resume {
                self.resume(false).await;
            }
        }
    }

    /// Status snapshot for the embedding app
    pub async fn status(&self) -> SyncStatus {
        let state = self.state.lock().await;
        SyncStatus {
            is_running: state.run_state == RunState::Running,
            is_paused: state.run_state == RunState::Paused,
            is_initializing: state.run_state == RunState::Initializing,
            device_sync_active: state.device_sync_active,
            os_sync_active: state.os_sync_active,
            consecutive_errors: state.consecutive_errors,
            last_error_at: state.last_error_at,
            last_sync_at: state.last_sync_at,
            last_sync_source: state.last_sync_source,
            exclusion_active: state.exclusion_active,
            cooldown_remaining_ms: state.cooldown_until.and_then(|until| {
                let now = Instant::now();
                (until > now).then(|| (until - now).as_millis() as u64)
            }),
        }
    }

    /// One sync tick.
    ///
    /// Scheduled ticks honor pause, cooldown, the exclusion window, and the
    /// per-source busy flags. A manual tick bypasses the pause gate and
    /// resumes the scheduler as a side effect, but still honors the
    /// exclusion window and cooldown.
    pub async fn tick(&self, manual: bool) {
        let rearm = {
            let mut state = self.state.lock().await;
            if state.exclusion_active {
                log::info!("sync tick skipped: exclusion window active");
                return;
            }
            match state.run_state {
                RunState::Paused if !manual => return,
                RunState::Running | RunState::Paused => {}
                _ if manual => {}
                _ => return,
            }
            if let Some(until) = state.cooldown_until {
                if Instant::now() < until {
                    log::info!(
                        "sync tick skipped: cooling down for another {:?}",
                        until - Instant::now()
                    );
                    return;
                }
                state.cooldown_until = None;
            }
            if state.device_sync_active || state.os_sync_active {
                log::debug!("sync tick skipped: previous sync still active");
                return;
            }
            state.device_sync_active = true;
            state.os_sync_active = true;
            if manual && state.run_state == RunState::Paused {
                state.run_state = RunState::Running;
                true
            } else {
                false
            }
        };
        if rearm {
            self.spawn_ticker().await;
            log::info!("manual sync resumed the paused scheduler");
        }

        let device_task = {
            let this = self.clone();
            tokio::spawn(async move {
                let result = this.run_device_lane().await;
                this.state.lock().await.device_sync_active = false;
                result
            })
        };
        let os_task = {
            let this = self.clone();
            tokio::spawn(async move {
                let result = this.run_os_lane().await;
                this.state.lock().await.os_sync_active = false;
                result
            })
        };
        {
            let mut lanes = self.lane_tasks.lock().await;
            lanes.clear();
            lanes.push(device_task.abort_handle());
            lanes.push(os_task.abort_handle());
        }

        // Settle-all: one lane failing never cancels the other
        let (device_res, os_res) = tokio::join!(device_task, os_task);
        self.lane_tasks.lock().await.clear();
        {
            let mut state = self.state.lock().await;
            state.device_sync_active = false;
            state.os_sync_active = false;
        }

        self.note_outcomes([device_res, os_res]).await;
    }

    async fn note_outcomes(&self, results: [Result<LaneResult, tokio::task::JoinError>; 2]) {
        let mut successes: Vec<SyncSource> = Vec::new();
        let mut failures: Vec<SyncError> = Vec::new();
        for joined in results {
            match joined {
                Ok(Ok(Some(source))) => successes.push(source),
                Ok(Ok(None)) => {}
                Ok(Err(err)) => failures.push(err),
                Err(join_err) if join_err.is_cancelled() => {
                    log::debug!("sync lane interrupted");
                }
                Err(join_err) => {
                    log::error!("sync lane panicked: {join_err}");
                    failures.push(SyncError::Unknown(join_err.to_string()));
                }
            }
        }

        let mut state = self.state.lock().await;
        for err in &failures {
            self.record_failure(&mut state, err);
        }
        if let Some(source) = successes.last().copied() {
            state.consecutive_errors = 0;
            state.class_errors.clear();
            state.cooldown_until = None;
            state.cooldown_notified = false;
            state.last_sync_at = Some(Utc::now());
            state.last_sync_source = Some(source);
            self.notifier.notify(SyncEvent::SyncCompleted { source });
            log::info!("sync completed from source {source:?}");
        }
    }

    /// Classify one failure and convert it into a scheduling decision.
    ///
    /// Crossing a class ceiling or the global ceiling surfaces one
    /// notification and enters cooldown. `Locked` and `EmptyData` carry a
    /// ceiling of zero, so their first occurrence already surfaces.
    fn record_failure(&self, state: &mut OrchestratorState, err: &SyncError) {
        let class = ErrorClass::classify(err);
        state.consecutive_errors += 1;
        let count = state.class_errors.entry(class).or_insert(0);
        *count += 1;
        state.last_error_at = Some(Utc::now());
        log::warn!(
            "sync failure #{} (class {}, {} of this class): {err}",
            state.consecutive_errors,
            class.as_str(),
            count
        );

        let crossed_class = *count > self.config.class_ceiling(class);
        let crossed_global = state.consecutive_errors >= self.config.max_consecutive_errors;
        if crossed_class || crossed_global {
            if !state.cooldown_notified {
                self.notifier.notify(SyncEvent::SyncFailed {
                    class,
                    message: err.to_string(),
                });
                state.cooldown_notified = true;
            }
            state.cooldown_until = Some(Instant::now() + self.config.cooldown);
            log::warn!(
                "entering {:?} cooldown after repeated {} failures",
                self.config.cooldown,
                class.as_str()
            );
        }
    }

    /// Device-source lane: retrieve from the persisted ring, persist the
    /// canonical record locally, then push to the backend best-effort
    async fn run_device_lane(&self) -> LaneResult {
        let Some(identity) = self.load_identity().await else {
            log::debug!("device sync skipped: no connected device persisted");
            return Ok(None);
        };
        let retrieved = self.retriever.retrieve(&identity).await?;
        let json = serde_json::to_string(&retrieved.normalized)?;
        self.store.set_string(LAST_RECORD_KEY, &json).await;
        if let Err(err) = self
            .backend
            .perform_all_syncs(
                &retrieved.normalized,
                identity.server_id.as_deref(),
                &identity.uuid,
            )
            .await
        {
            log::warn!("backend sync failed, local record kept: {err}");
        }
        Ok(Some(SyncSource::Device))
    }

    /// OS-source lane: today's summary from the platform health store,
    /// pushed to the backend as a canonical record
    async fn run_os_lane(&self) -> LaneResult {
        let summary = self.os_health.fetch_today_summary().await?;
        let Some(summary) = summary.filter(|s| !s.is_empty()) else {
            return Ok(None);
        };

        let now = Utc::now();
        let mut record = NormalizedHealthData::empty(None, self.config.platform, now);
        let now_ms = now.timestamp_millis();
        record.steps = summary
            .steps
            .map(|steps| MetricValue::new(steps, now_ms, "steps"));
        // The zero-steps calorie guard applies to OS records too
        record.calories = match summary.steps {
            Some(steps) if steps == 0.0 => Some(0.0),
            _ => summary.calories,
        };
        record.distance = summary.distance;

        if let Err(err) = self.backend.perform_all_syncs(&record, None, "os").await {
            log::warn!("backend sync of OS health data failed: {err}");
        }
        Ok(Some(SyncSource::Os))
    }

    async fn load_identity(&self) -> Option<DeviceIdentity> {
        let raw = self.store.get_string(CONNECTED_DEVICE_KEY).await?;
        match serde_json::from_str(&raw) {
            Ok(identity) => Some(identity),
            Err(err) => {
                log::warn!("stored device descriptor is corrupt, ignoring it: {err}");
                None
            }
        }
    }

    // Explicitly boxed so that the recursive edge (tick → spawn_ticker →
    // spawned block → tick) crosses a `dyn Future + Send` boundary; this
    // breaks the auto-trait inference cycle that otherwise leaves the
    // spawned future non-`Send`.
    fn spawn_ticker(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let mut guard = self.ticker.lock().await;
            if let Some((_, token)) = guard.take() {
                token.cancel();
            }
            let this = self.clone();
            let token = CancellationToken::new();
            let loop_token = token.clone();
            let interval_duration = self.config.sync_interval;
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(interval_duration);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first interval tick completes immediately; the initial
                // sync is driven by start(), not the timer
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = loop_token.cancelled() => break,
                        _ = interval.tick() => this.tick(false).await,
                    }
                }
            });
            *guard = Some((handle, token));
        })
    }

    /// Cancellation rather than abort: an in-flight tick runs to completion
    /// so its outcome is still recorded
    async fn stop_ticker(&self) {
        if let Some((_, token)) = self.ticker.lock().await.take() {
            token.cancel();
        }
    }

    async fn abort_init(&self) {
        if let Some(handle) = self.init_task.lock().await.take() {
            handle.abort();
        }
    }

    async fn abort_lanes(&self) {
        let mut lanes = self.lane_tasks.lock().await;
        for handle in lanes.drain(..) {
            handle.abort();
        }
    }
}
