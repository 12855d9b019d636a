//! Upload coordinator: timers, circuit breaking, per-stream batching.
//!
//! The coordinator owns the upload side of the outbox. A periodic timer
//! (and any number of external triggers: manual, network reconnect,
//! power-save exit) drives [`UploadCoordinator::perform_upload`], which
//! dequeues a batch, groups it by stream, combines each group into one
//! wire payload, posts it, and routes the outcome back into the store,
//! the circuit breaker, and the network quality oracle.
//!
//! Overlapping cycles are tolerated, not prevented. The store's atomic
//! dequeue guarantees two concurrent cycles never claim the same
//! records, so overlap only produces benign no-op cycles.
//!
//! Cancellation stops new network calls but never rolls back records
//! already marked Uploading; stale reclaim is the sole recovery path
//! for interrupted uploads, because a cancelled-but-possibly-in-flight
//! HTTP call cannot be assumed to have failed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus};
use crate::combine::{CombineError, CombinerRegistry};
use crate::config::ConfigProvider;
use crate::oracle::NetworkQualityOracle;
use crate::store::{OutboxStore, QueueRecord, QueueStats, StoreError, now_secs};
use crate::transport::{Transport, TransportError};

/// Interval between periodic upload cycles.
pub const UPLOAD_INTERVAL: Duration = Duration::from_secs(300);
/// Interval between coalesced stats refreshes.
pub const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Timer and breaker settings for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub upload_interval: Duration,
    pub stats_interval: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            upload_interval: UPLOAD_INTERVAL,
            stats_interval: STATS_INTERVAL,
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Externally-observable coordinator state. An open breaker or a halted
/// timer reads as "sync paused" to users, never as an error.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub queue: QueueStats,
    pub breaker: CircuitBreakerStatus,
    pub power_save: bool,
    pub timer_halted: bool,
    /// Epoch seconds of the last cycle that attempted any upload.
    pub last_attempt_at: Option<i64>,
    /// Epoch seconds of the last cycle with at least one successful group.
    pub last_success_at: Option<i64>,
}

/// Outcome of one per-stream group upload.
enum GroupOutcome {
    Success,
    Failed,
    /// Authentication was rejected; the periodic timer must halt.
    AuthHalt,
}

/// Drives uploads from the outbox store to the ingestion endpoint.
///
/// All collaborators are constructor-injected; the coordinator holds no
/// process-wide global state. Timer tasks are explicit [`JoinHandle`]s
/// owned here and cancelled only by an explicit [`shutdown`] call.
///
/// [`shutdown`]: UploadCoordinator::shutdown
pub struct UploadCoordinator {
    store: Arc<OutboxStore>,
    transport: Arc<dyn Transport>,
    config: Arc<dyn ConfigProvider>,
    oracle: Arc<dyn NetworkQualityOracle>,
    combiners: CombinerRegistry,
    settings: CoordinatorSettings,
    breaker: Mutex<CircuitBreaker>,
    power_save: AtomicBool,
    timer_halted: AtomicBool,
    /// Soft delay requested by a 429 Retry-After; cycles starting
    /// before this instant skip without touching the network.
    retry_after_until: Mutex<Option<Instant>>,
    /// Epoch seconds; 0 means never.
    last_attempt_at: AtomicI64,
    last_success_at: AtomicI64,
    cancel: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UploadCoordinator {
    #[must_use]
    pub fn new(
        store: Arc<OutboxStore>,
        transport: Arc<dyn Transport>,
        config: Arc<dyn ConfigProvider>,
        oracle: Arc<dyn NetworkQualityOracle>,
        combiners: CombinerRegistry,
        settings: CoordinatorSettings,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        let breaker = CircuitBreaker::new(settings.breaker.clone());
        Self {
            store,
            transport,
            config,
            oracle,
            combiners,
            settings,
            breaker: Mutex::new(breaker),
            power_save: AtomicBool::new(false),
            timer_halted: AtomicBool::new(false),
            retry_after_until: Mutex::new(None),
            last_attempt_at: AtomicI64::new(0),
            last_success_at: AtomicI64::new(0),
            cancel,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the periodic upload and stats-refresh timers.
    ///
    /// Idempotent; a second call while tasks are live does nothing.
    /// Both timers run on the background runtime and are stopped by
    /// [`shutdown`](Self::shutdown).
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks_lock();
        if !tasks.is_empty() {
            return;
        }

        let coordinator = Arc::clone(self);
        let mut cancel_rx = self.cancel.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.settings.upload_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if coordinator.timer_halted.load(Ordering::Relaxed) {
                            debug!("periodic timer halted; skipping upload cycle");
                            continue;
                        }
                        coordinator.perform_upload().await;
                    }
                    _ = cancel_rx.changed() => break,
                }
            }
        }));

        let coordinator = Arc::clone(self);
        let mut cancel_rx = self.cancel.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.settings.stats_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => match coordinator.store.stats() {
                        Ok(stats) => debug!(
                            pending = stats.pending,
                            failed = stats.failed,
                            total_bytes = stats.total_bytes,
                            "queue stats"
                        ),
                        Err(err) => warn!(error = %err, "stats refresh failed"),
                    },
                    _ = cancel_rx.changed() => break,
                }
            }
        }));

        info!(
            upload_interval_secs = self.settings.upload_interval.as_secs(),
            "upload coordinator started"
        );
    }

    /// Signal cancellation and wait for the timer tasks to exit.
    ///
    /// In-flight HTTP calls are not awaited; their records stay
    /// Uploading and are reclaimed by the stale sweep.
    pub async fn shutdown(&self) {
        let _ = self.cancel.send(true);
        let handles: Vec<JoinHandle<()>> = self.tasks_lock().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    error!(error = %err, "coordinator task panicked during shutdown");
                }
            }
        }
    }

    /// Run one upload cycle. Returns true iff at least one stream group
    /// succeeded, or the queue was empty.
    ///
    /// A store failure aborts the cycle and reports false; records
    /// already claimed stay Uploading for the stale sweep.
    pub async fn perform_upload(&self) -> bool {
        match self.run_cycle().await {
            Ok(any_success) => any_success,
            Err(err) => {
                error!(error = %err, "upload cycle aborted by store failure");
                false
            }
        }
    }

    async fn run_cycle(&self) -> Result<bool, StoreError> {
        if self.breaker_lock().is_open() {
            debug!("circuit open; skipping upload cycle");
            return Ok(false);
        }
        if self.power_save.load(Ordering::Relaxed) {
            debug!("power-save mode active; skipping upload cycle");
            return Ok(false);
        }
        {
            let mut until = self.retry_after_lock();
            if let Some(t) = *until {
                if Instant::now() < t {
                    debug!("within rate-limit delay; skipping upload cycle");
                    return Ok(false);
                }
                *until = None;
            }
        }

        let reclaimed = self
            .store
            .reset_stale_uploads(self.store.limits().stale_timeout)?;
        if reclaimed > 0 {
            info!(reclaimed, "reclaimed stale uploads");
        }
        self.store.remove_invalid_streams()?;

        if !self.config.is_configured() {
            debug!("endpoint or credentials not configured; skipping upload cycle");
            return Ok(false);
        }
        let Some(endpoint) = self.config.ingest_url() else {
            return Ok(false);
        };
        let token = self.config.device_token();
        let device_id = self.config.device_id();

        let batch_size = self.oracle.recommended_batch_size();
        let records = self.store.dequeue_next(batch_size)?;
        if records.is_empty() {
            // An empty queue is success, not failure.
            return Ok(true);
        }

        let mut groups: BTreeMap<String, Vec<QueueRecord>> = BTreeMap::new();
        for record in records {
            groups.entry(record.stream_name.clone()).or_default().push(record);
        }
        let groups: Vec<(String, Vec<QueueRecord>)> = groups.into_iter().collect();

        let mut any_success = false;
        let cancel_rx = self.cancel.subscribe();
        let mut halted_after = None;
        for (index, (stream, group)) in groups.iter().enumerate() {
            if *cancel_rx.borrow() {
                info!("cancelled; remaining records left for stale reclaim");
                break;
            }
            match self
                .upload_group(&endpoint, &token, &device_id, stream, group)
                .await
            {
                GroupOutcome::Success => any_success = true,
                GroupOutcome::Failed => {}
                GroupOutcome::AuthHalt => {
                    halted_after = Some(index + 1);
                    break;
                }
            }
        }
        // Quiesce the groups never attempted after an auth halt instead
        // of leaving them Uploading for ten minutes.
        if let Some(rest) = halted_after {
            for (_, group) in &groups[rest..] {
                self.retry_group(group);
            }
        }

        let now = now_secs();
        self.last_attempt_at.store(now, Ordering::Relaxed);
        if any_success {
            self.last_success_at.store(now, Ordering::Relaxed);
        }

        self.store.cleanup_aged()?;
        Ok(any_success)
    }

    async fn upload_group(
        &self,
        endpoint: &str,
        token: &str,
        device_id: &str,
        stream: &str,
        records: &[QueueRecord],
    ) -> GroupOutcome {
        let body = match self.combine_group(stream, records, device_id) {
            Ok(body) => body,
            Err(err) => {
                warn!(stream, error = %err, "failed to combine group; will retry");
                self.retry_group(records);
                self.oracle.record_upload_result(false);
                return GroupOutcome::Failed;
            }
        };

        match self.transport.upload(endpoint, token, &body).await {
            Ok(ack) => {
                for record in records {
                    if let Err(err) = self.store.mark_complete(record.id) {
                        error!(id = record.id, error = %err, "failed to mark record complete");
                    }
                }
                self.breaker_lock().record_success();
                self.oracle.record_upload_result(true);
                info!(
                    stream,
                    records = records.len(),
                    bytes = ack.data_size_bytes,
                    "group uploaded"
                );
                GroupOutcome::Success
            }
            Err(err) => {
                self.oracle.record_upload_result(false);
                self.route_failure(stream, records, &err)
            }
        }
    }

    fn combine_group(
        &self,
        stream: &str,
        records: &[QueueRecord],
        device_id: &str,
    ) -> Result<serde_json::Value, CombineError> {
        let combiner = self.combiners.get(stream)?;
        let mut items = Vec::new();
        for record in records {
            items.extend(combiner.decode(&record.payload)?);
        }
        combiner.combine(items, device_id)
    }

    /// Route a classified transport failure per its two facets.
    fn route_failure(
        &self,
        stream: &str,
        records: &[QueueRecord],
        err: &TransportError,
    ) -> GroupOutcome {
        warn!(stream, records = records.len(), error = %err, "group upload failed");

        if err.counts_toward_circuit_breaker() {
            self.breaker_lock().record_failure();
        }
        if let Some(delay) = err.retry_after() {
            *self.retry_after_lock() = Some(Instant::now() + delay);
        }

        match err {
            TransportError::AuthInvalid => {
                // Quiesced, not permanent: the data becomes uploadable
                // again once credentials are fixed.
                self.retry_group(records);
                self.halt_timer();
                GroupOutcome::AuthHalt
            }
            e if e.is_retryable() => {
                self.retry_group(records);
                GroupOutcome::Failed
            }
            _ => {
                for record in records {
                    if let Err(store_err) = self.store.mark_permanent_failure(record.id) {
                        error!(id = record.id, error = %store_err, "failed to mark permanent failure");
                    }
                }
                GroupOutcome::Failed
            }
        }
    }

    fn retry_group(&self, records: &[QueueRecord]) {
        for record in records {
            if let Err(err) = self.store.increment_retry(record.id) {
                error!(id = record.id, error = %err, "failed to record retry");
            }
        }
    }

    fn halt_timer(&self) {
        self.timer_halted.store(true, Ordering::Relaxed);
        warn!("authentication rejected; periodic uploads halted until re-enabled");
    }

    /// Re-enable the periodic timer after an auth halt.
    pub fn resume_uploads(&self) {
        self.timer_halted.store(false, Ordering::Relaxed);
        info!("periodic uploads re-enabled");
    }

    #[must_use]
    pub fn is_timer_halted(&self) -> bool {
        self.timer_halted.load(Ordering::Relaxed)
    }

    /// Gate upload cycles while the device is in power-save mode.
    pub fn set_power_save(&self, enabled: bool) {
        self.power_save.store(enabled, Ordering::Relaxed);
    }

    /// External trigger: run a cycle now, outside the periodic cadence.
    pub async fn trigger_manual_upload(&self) -> bool {
        self.perform_upload().await
    }

    /// External event: connectivity came back.
    pub async fn notify_network_reconnected(&self) -> bool {
        self.perform_upload().await
    }

    /// External event: the device left power-save mode.
    pub async fn notify_power_save_disabled(&self) -> bool {
        self.set_power_save(false);
        self.perform_upload().await
    }

    /// Snapshot of queue and breaker state for status surfaces.
    pub fn status(&self) -> Result<CoordinatorStatus, StoreError> {
        let queue = self.store.stats()?;
        let epoch = |v: i64| (v > 0).then_some(v);
        Ok(CoordinatorStatus {
            queue,
            breaker: self.breaker_lock().status(),
            power_save: self.power_save.load(Ordering::Relaxed),
            timer_halted: self.timer_halted.load(Ordering::Relaxed),
            last_attempt_at: epoch(self.last_attempt_at.load(Ordering::Relaxed)),
            last_success_at: epoch(self.last_success_at.load(Ordering::Relaxed)),
        })
    }

    fn breaker_lock(&self) -> MutexGuard<'_, CircuitBreaker> {
        self.breaker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retry_after_lock(&self) -> MutexGuard<'_, Option<Instant>> {
        self.retry_after_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks_lock(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for UploadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadCoordinator")
            .field("settings", &self.settings)
            .field("power_save", &self.power_save.load(Ordering::Relaxed))
            .field("timer_halted", &self.timer_halted.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
