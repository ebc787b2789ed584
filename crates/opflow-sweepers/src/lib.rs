#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **opflow-sweepers** – Finalizer and Reaper background sweepers (§4.5,
//! §4.6 of the engine specification).
//!
//! Both sweepers follow the same shape: scan the Store for operations in a
//! particular condition, act on each, and sleep until the next tick.
//! Grounded on `toka-orchestration::monitor::ProgressMonitor`'s
//! periodic-sweep-over-shared-state construction and the
//! `tokio::select!`-driven graceful-shutdown idiom `opflow-runtime::Runtime`
//! (itself grounded on `toka-kernel/src/bin/monitor.rs`) already uses, so a
//! process embedding all three background loops shuts them down uniformly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use opflow_bus_core::{Bus, BusError};
use opflow_store_core::{Store, StoreError};
use opflow_types::{Envelope, OperationState, Outcome, WalState};

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors raised by a sweeper's infrastructure calls. Per §7, sweeper
/// failures are contained to the offending op id; the sweep continues with
/// the remaining batch and retries the failed one on its next tick.
#[derive(Debug, thiserror::Error)]
pub enum SweeperError {
    /// The Store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// The Bus failed.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

/// Convenience result alias for sweeper operations.
pub type SweeperResult<T> = Result<T, SweeperError>;

//─────────────────────────────
//  Finalizer (§4.5)
//─────────────────────────────

/// Default batch size a sweeper scan requests per tick.
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 50;
/// Default interval between Finalizer ticks, in milliseconds.
pub const DEFAULT_FINALIZER_INTERVAL_MILLIS: u64 = 3_000;
/// Default interval between Reaper ticks, in milliseconds.
pub const DEFAULT_REAPER_INTERVAL_MILLIS: u64 = 15_000;
/// Default threshold above which an `InProgress` operation is considered
/// stuck, in milliseconds (5 minutes; §4.6 suggests 5-60 minutes).
pub const DEFAULT_REAPER_THRESHOLD_MILLIS: i64 = 5 * 60 * 1_000;

/// Configuration for a [`Finalizer`].
#[derive(Debug, Clone, Copy)]
pub struct FinalizerConfig {
    /// How often the Finalizer scans `scan_wa(Pending, _)`.
    pub interval_millis: u64,
    /// Batch size requested per scan.
    pub batch_size: usize,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            interval_millis: DEFAULT_FINALIZER_INTERVAL_MILLIS,
            batch_size: DEFAULT_SWEEP_BATCH_SIZE,
        }
    }
}

/// Repairs operations whose `write_ahead` succeeded but whose `finalize`
/// did not (crash between the two). See §4.5.
pub struct Finalizer {
    store: Arc<dyn Store>,
    config: FinalizerConfig,
}

impl Finalizer {
    /// Construct a new [`Finalizer`] over `store`.
    pub fn new(store: Arc<dyn Store>, config: FinalizerConfig) -> Self {
        Self { store, config }
    }

    /// Run the sweep loop until `shutdown` reports `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_millis = self.config.interval_millis, "finalizer starting");
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.interval_millis));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    if let Err(error) = self.sweep_once().await {
                        warn!(%error, "finalizer sweep failed, will retry next tick");
                    }
                }
            }
        }
        info!("finalizer stopped");
    }

    /// Run exactly one scan-and-repair pass. Returns the number of WAL
    /// entries examined.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> SweeperResult<usize> {
        let op_ids = self.store.scan_wa(WalState::Pending, self.config.batch_size).await?;
        if op_ids.is_empty() {
            return Ok(0);
        }
        debug!(count = op_ids.len(), "finalizer scanned pending WAL entries");

        for op_id in &op_ids {
            if let Err(error) = self.repair_one(op_id).await {
                error!(%op_id, %error, "finalizer failed to repair operation");
            }
        }
        Ok(op_ids.len())
    }

    async fn repair_one(&self, op_id: &opflow_types::OpId) -> SweeperResult<()> {
        let outcome = self.store.get_write_ahead_outcome(op_id).await?;
        match outcome {
            Outcome::Ok { .. } => {
                self.store.finalize(op_id, OperationState::Completed).await?;
                info!(%op_id, "finalizer completed interrupted finalization (Ok)");
            }
            Outcome::Fail { .. } => {
                self.store.finalize(op_id, OperationState::Failed).await?;
                info!(%op_id, "finalizer completed interrupted finalization (Fail)");
            }
            Outcome::Retry { .. } => {
                // §4.5: a Retry WAL entry is owned by the pump loop's own
                // re-enqueue; the Finalizer leaves it Pending until either a
                // new outcome supersedes it or the retry budget is
                // exhausted by the Runtime.
                debug!(%op_id, "finalizer leaving Retry WAL entry pending for the pump loop");
            }
        }
        Ok(())
    }
}

//─────────────────────────────
//  Reaper (§4.6)
//─────────────────────────────

/// Configuration for a [`Reaper`].
#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    /// How often the Reaper scans `scan_in_progress`.
    pub interval_millis: u64,
    /// Batch size requested per scan.
    pub batch_size: usize,
    /// How long an operation may sit `InProgress` before being considered
    /// stuck (configurable per domain at the embedding-application layer;
    /// this sweeper applies one threshold per instance).
    pub stuck_threshold_millis: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_millis: DEFAULT_REAPER_INTERVAL_MILLIS,
            batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            stuck_threshold_millis: DEFAULT_REAPER_THRESHOLD_MILLIS,
        }
    }
}

/// Detects operations stuck `InProgress` past `stuck_threshold_millis` and
/// re-publishes their envelope so a pump loop picks them up again. See §4.6.
pub struct Reaper {
    store: Arc<dyn Store>,
    bus: Arc<dyn Bus>,
    config: ReaperConfig,
    reaped_count: std::sync::atomic::AtomicU64,
}

impl Reaper {
    /// Construct a new [`Reaper`] over `store` and `bus`.
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn Bus>, config: ReaperConfig) -> Self {
        Self {
            store,
            bus,
            config,
            reaped_count: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Total number of operations re-published since this Reaper was
    /// constructed. Observability counter, §4.6 step 2c.
    pub fn reaped_count(&self) -> u64 {
        self.reaped_count.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Run the sweep loop until `shutdown` reports `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_millis = self.config.interval_millis,
            threshold_millis = self.config.stuck_threshold_millis,
            "reaper starting"
        );
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.interval_millis));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    if let Err(error) = self.sweep_once().await {
                        warn!(%error, "reaper sweep failed, will retry next tick");
                    }
                }
            }
        }
        info!("reaper stopped");
    }

    /// Run exactly one scan-and-replay pass. Returns the number of stuck
    /// operations found.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> SweeperResult<usize> {
        let op_ids = self
            .store
            .scan_in_progress(self.config.stuck_threshold_millis, self.config.batch_size)
            .await?;
        if op_ids.is_empty() {
            return Ok(0);
        }
        warn!(count = op_ids.len(), "reaper found stuck in-progress operations");

        for op_id in &op_ids {
            if let Err(error) = self.replay_one(op_id).await {
                error!(%op_id, %error, "reaper failed to replay operation");
            }
        }
        Ok(op_ids.len())
    }

    async fn replay_one(&self, op_id: &opflow_types::OpId) -> SweeperResult<()> {
        let record = self.store.get_envelope(op_id).await?;
        let envelope = Envelope {
            op_id: record.op_id,
            command: record.command,
            accepted_at: record.accepted_at,
        };
        self.bus.publish(envelope, 0).await?;
        self.reaped_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!(%op_id, "reaper republished stuck envelope");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use opflow_bus_memory::MemoryBus;
    use opflow_idempotency::{IdempotencyManager, MemoryIdempotencyManager};
    use opflow_store_memory::MemoryStore;
    use opflow_types::{BizKey, Command, Domain, EventType, IdemKey, OpId};

    use super::*;

    async fn seed_pending_operation(store: &Arc<MemoryStore>, accepted_at: i64) -> OpId {
        let cmd = Command::new(
            Domain::parse("ORDER").unwrap(),
            EventType::parse("CREATE").unwrap(),
            BizKey::parse("o-1").unwrap(),
            IdemKey::parse("k-1").unwrap(),
            None,
        );
        let idempotency = MemoryIdempotencyManager::new();
        let op_id = idempotency.get_or_create(&cmd.idempotency_key()).await.unwrap();
        let envelope = Envelope::new(op_id.clone(), cmd.clone(), accepted_at).unwrap();
        store
            .create_if_absent(&op_id, &cmd.idempotency_key(), &envelope)
            .await
            .unwrap();
        op_id
    }

    #[tokio::test]
    async fn finalizer_completes_interrupted_ok_outcome() {
        let store = Arc::new(MemoryStore::new());
        let op_id = seed_pending_operation(&store, 0).await;
        store.mark_in_progress(&op_id).await.unwrap();
        // Simulate a crash between write_ahead and finalize.
        store.write_ahead(&op_id, Outcome::ok(op_id.clone())).await.unwrap();

        let finalizer = Finalizer::new(store.clone(), FinalizerConfig::default());
        let examined = finalizer.sweep_once().await.unwrap();

        assert_eq!(examined, 1);
        assert_eq!(store.get_state(&op_id).await.unwrap(), OperationState::Completed);
        let wal_entry = store.get_wal_entry(&op_id).await.unwrap().unwrap();
        assert_eq!(wal_entry.wal_state, WalState::Completed);
    }

    #[tokio::test]
    async fn finalizer_completes_interrupted_fail_outcome() {
        let store = Arc::new(MemoryStore::new());
        let op_id = seed_pending_operation(&store, 0).await;
        store.mark_in_progress(&op_id).await.unwrap();
        store
            .write_ahead(&op_id, Outcome::fail("VALIDATION", "bad amount"))
            .await
            .unwrap();

        let finalizer = Finalizer::new(store.clone(), FinalizerConfig::default());
        finalizer.sweep_once().await.unwrap();

        assert_eq!(store.get_state(&op_id).await.unwrap(), OperationState::Failed);
    }

    #[tokio::test]
    async fn finalizer_leaves_retry_outcome_pending() {
        let store = Arc::new(MemoryStore::new());
        let op_id = seed_pending_operation(&store, 0).await;
        store.mark_in_progress(&op_id).await.unwrap();
        store
            .write_ahead(&op_id, Outcome::retry("503", 1, 50).unwrap())
            .await
            .unwrap();

        let finalizer = Finalizer::new(store.clone(), FinalizerConfig::default());
        finalizer.sweep_once().await.unwrap();

        assert_eq!(store.get_state(&op_id).await.unwrap(), OperationState::InProgress);
        let wal_entry = store.get_wal_entry(&op_id).await.unwrap().unwrap();
        assert_eq!(wal_entry.wal_state, WalState::Pending);
    }

    #[tokio::test]
    async fn finalizer_on_already_terminal_operation_is_noop_success() {
        let store = Arc::new(MemoryStore::new());
        let op_id = seed_pending_operation(&store, 0).await;
        store.mark_in_progress(&op_id).await.unwrap();
        store.write_ahead(&op_id, Outcome::ok(op_id.clone())).await.unwrap();
        store.finalize(&op_id, OperationState::Completed).await.unwrap();

        // A second write_ahead without a flip back to Pending can't happen
        // under the Runtime's discipline, but a Finalizer sweep landing on
        // an already-finalized entry (wal_state already Completed) must
        // simply not show up in a Pending scan.
        let finalizer = Finalizer::new(store.clone(), FinalizerConfig::default());
        let examined = finalizer.sweep_once().await.unwrap();
        assert_eq!(examined, 0);
    }

    #[tokio::test]
    async fn reaper_republishes_stuck_operation() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::default());
        let old_accepted_at = chrono::Utc::now().timestamp_millis() - 10 * 60 * 1000;
        let op_id = seed_pending_operation(&store, old_accepted_at).await;
        store.mark_in_progress(&op_id).await.unwrap();

        let reaper = Reaper::new(
            store.clone(),
            bus.clone(),
            ReaperConfig {
                stuck_threshold_millis: 5 * 60 * 1000,
                ..ReaperConfig::default()
            },
        );
        let found = reaper.sweep_once().await.unwrap();

        assert_eq!(found, 1);
        assert_eq!(bus.queued_count().await, 1);
        assert_eq!(reaper.reaped_count(), 1);
    }

    #[tokio::test]
    async fn reaper_ignores_operations_within_threshold() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::default());
        let op_id = seed_pending_operation(&store, chrono::Utc::now().timestamp_millis()).await;
        store.mark_in_progress(&op_id).await.unwrap();

        let reaper = Reaper::new(store.clone(), bus.clone(), ReaperConfig::default());
        let found = reaper.sweep_once().await.unwrap();

        assert_eq!(found, 0);
        assert_eq!(bus.queued_count().await, 0);
    }

    #[tokio::test]
    async fn reaper_replay_does_not_duplicate_side_effects_once_pump_observes_terminal_state() {
        // Scenario S7 of the spec: after reaping, a pump cycle that finds
        // the operation already terminal short-circuits. This sweeper does
        // not itself invoke an Executor, so the non-duplication guarantee
        // is exercised at the Runtime layer (see opflow-runtime); here we
        // only assert the reaper's own action is a single republish.
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::default());
        let old_accepted_at = chrono::Utc::now().timestamp_millis() - 10 * 60 * 1000;
        let op_id = seed_pending_operation(&store, old_accepted_at).await;
        store.mark_in_progress(&op_id).await.unwrap();

        let reaper = Reaper::new(store.clone(), bus.clone(), ReaperConfig {
            stuck_threshold_millis: 5 * 60 * 1000,
            ..ReaperConfig::default()
        });
        reaper.sweep_once().await.unwrap();
        reaper.sweep_once().await.unwrap();

        // Each sweep that still finds the operation InProgress republishes;
        // the Bus's own visibility-timeout/in-flight bookkeeping (exercised
        // in opflow-bus-memory's tests) is what prevents duplicate
        // concurrent delivery, not the Reaper itself.
        assert_eq!(bus.queued_count().await, 2);
    }
}
