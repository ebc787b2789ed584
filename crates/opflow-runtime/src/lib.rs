#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **opflow-runtime** – Pump loop that drives queued envelopes to terminal
//! outcomes (§4.3 of the engine specification).
//!
//! Grounded on `toka-agent-runtime::executor::AgentExecutor::run`'s
//! state-transition-then-dispatch shape (`Initializing -> Ready -> running
//! -> terminal`, instrumented, progress reported at each step), generalized
//! here to the spec's `Pending -> InProgress -> {Completed, Failed}` machine
//! and `Outcome` dispatch table. Bounded concurrency uses
//! `tokio::sync::Semaphore`.
//!
//! **Open Question 1 decision** (`spec.md` §9): a `Retry` outcome's
//! `next_retry_after_millis` is republished to the Bus as a single
//! `delay_millis` argument rather than slept in-process. The Runtime never
//! blocks a worker slot waiting out a backoff; an adapter whose underlying
//! transport caps the maximum delay is responsible for chunking it
//! internally. The in-memory reference `Bus` accepts arbitrary delays, so
//! no chunking is implemented here. See `DESIGN.md`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use async_trait::async_trait;
use opflow_bus_core::{Bus, BusError};
use opflow_protection::ProtectionChain;
use opflow_store_core::{Store, StoreError};
use opflow_types::{Envelope, OperationState, Outcome, RetryBudget};

//─────────────────────────────
//  Executor port
//─────────────────────────────

/// The pluggable domain side-effect invoked for each `Envelope`.
///
/// Implementations should not panic; any panic that does escape is caught
/// by the Runtime and converted to `Fail("EXECUTOR_UNCAUGHT")`, matching
/// the spec's "uncaught throw" handling for languages that distinguish
/// exceptions from return values.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Perform the side-effecting call described by `envelope`, returning
    /// the resulting [`Outcome`].
    async fn execute(&self, envelope: &Envelope) -> Outcome;
}

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Default number of envelopes dequeued per pump cycle.
pub const DEFAULT_BATCH_SIZE: usize = 10;
/// Default bound on concurrently-processed envelopes per pump cycle.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 5;
/// Default grace period the pump loop waits for in-flight work to finish
/// after a shutdown signal, in milliseconds.
pub const DEFAULT_SHUTDOWN_GRACE_MILLIS: u64 = 5_000;

/// Configuration for a [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Envelopes dequeued per pump cycle (§4.3: typically 1-10).
    pub batch_size: usize,
    /// Maximum envelopes processed concurrently within one pump cycle.
    pub concurrency_limit: usize,
    /// How long `Runtime::run` waits for in-flight work after a shutdown
    /// signal before abandoning it to the Bus's visibility timeout.
    pub shutdown_grace_millis: u64,
    /// Whether a `Fail`-finalized operation (whether from a direct
    /// Executor `Fail` or a `Retry` whose budget was exhausted) is also
    /// routed to the dead-letter destination.
    pub dlq_on_fail: bool,
    /// Retry budget applied to `Retry` outcomes (closes Open Question 3 of
    /// `spec.md` §9).
    pub retry_budget: RetryBudget,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            shutdown_grace_millis: DEFAULT_SHUTDOWN_GRACE_MILLIS,
            dlq_on_fail: true,
            retry_budget: RetryBudget::default(),
        }
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors raised by the pump loop's infrastructure calls. Per §7, these are
/// treated as transient: the affected message is nacked and retried on a
/// future cycle; the pump itself does not crash.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The Store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// The Bus failed.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

/// Convenience result alias for Runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

fn resource_key_for(envelope: &Envelope) -> String {
    format!("{}/{}", envelope.command.domain, envelope.command.event_type)
}

//─────────────────────────────
//  Runtime
//─────────────────────────────

/// Drives queued [`Envelope`]s through the Protection chain and
/// [`Executor`] to a terminal outcome (§4.3).
pub struct Runtime {
    store: Arc<dyn Store>,
    bus: Arc<dyn Bus>,
    protection: ProtectionChain,
    executor: Arc<dyn Executor>,
    config: RuntimeConfig,
}

impl Runtime {
    /// Construct a new [`Runtime`] over the given collaborators.
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn Bus>,
        protection: ProtectionChain,
        executor: Arc<dyn Executor>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            bus,
            protection,
            executor,
            config,
        }
    }

    /// Run the pump loop until `shutdown` reports `true`, dequeuing and
    /// processing batches until then. In-flight work is drained for up to
    /// `shutdown_grace_millis` before being abandoned to the Bus's
    /// visibility timeout (§5 cancellation semantics).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("runtime pump loop starting");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                result = self.pump_once() => {
                    if let Err(error) = result {
                        warn!(%error, "pump cycle failed, backing off before retrying");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
        info!(grace_millis = self.config.shutdown_grace_millis, "runtime shutting down, draining in-flight work");
        let _ = tokio::time::timeout(
            std::time::Duration::from_millis(self.config.shutdown_grace_millis),
            self.pump_once(),
        )
        .await;
        info!("runtime pump loop stopped");
    }

    /// Run exactly one pump cycle: dequeue up to `batch_size` envelopes and
    /// process each concurrently, bounded by `concurrency_limit`. Returns
    /// the number of envelopes dequeued.
    #[instrument(skip(self))]
    pub async fn pump_once(&self) -> RuntimeResult<usize> {
        let envelopes = self.bus.dequeue(self.config.batch_size).await?;
        if envelopes.is_empty() {
            return Ok(0);
        }
        debug!(count = envelopes.len(), "dequeued batch");

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency_limit.max(1)));
        let mut tasks: JoinSet<()> = JoinSet::new();

        for envelope in envelopes.clone() {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let store = self.store.clone();
            let bus = self.bus.clone();
            let protection = self.protection.clone();
            let executor = self.executor.clone();
            let config = self.config.clone();

            tasks.spawn(async move {
                let _permit = permit;
                if let Err(error) =
                    process_envelope(&store, &bus, &protection, &executor, &config, envelope.clone())
                        .await
                {
                    error!(op_id = %envelope.op_id, %error, "processing envelope failed, nacking for redelivery");
                    if let Err(nack_error) = bus.nack(&envelope).await {
                        error!(op_id = %envelope.op_id, %nack_error, "nack itself failed");
                    }
                }
            });
        }

        while tasks.join_next().await.is_some() {}
        Ok(envelopes.len())
    }
}

/// Process a single envelope through the Protection chain and Executor,
/// dispatching on the resulting [`Outcome`] (§4.3 step 2).
#[instrument(skip(store, bus, protection, executor, config), fields(op_id = %envelope.op_id))]
async fn process_envelope(
    store: &Arc<dyn Store>,
    bus: &Arc<dyn Bus>,
    protection: &ProtectionChain,
    executor: &Arc<dyn Executor>,
    config: &RuntimeConfig,
    envelope: Envelope,
) -> RuntimeResult<()> {
    // At-least-once delivery means this envelope may be a replay. A
    // terminal operation short-circuits: ack and return without invoking
    // the Executor again.
    let state = store.get_state(&envelope.op_id).await?;
    if state.is_terminal() {
        debug!(?state, "replayed envelope for already-terminal operation, acking without re-execution");
        bus.ack(&envelope).await?;
        return Ok(());
    }

    store.mark_in_progress(&envelope.op_id).await?;

    let resource_key = resource_key_for(&envelope);
    let executor = executor.clone();
    let call_envelope = envelope.clone();
    let call: opflow_protection::CallFactory = Arc::new(move || {
        let executor = executor.clone();
        let envelope = call_envelope.clone();
        Box::pin(async move {
            let result = AssertUnwindSafe(executor.execute(&envelope)).catch_unwind().await;
            match result {
                Ok(outcome) => outcome,
                Err(_) => Outcome::fail(
                    "EXECUTOR_UNCAUGHT",
                    "executor panicked during execution",
                ),
            }
        })
    });

    let outcome = protection.execute(&resource_key, call).await;
    dispatch_outcome(store, bus, config, envelope, outcome).await
}

async fn dispatch_outcome(
    store: &Arc<dyn Store>,
    bus: &Arc<dyn Bus>,
    config: &RuntimeConfig,
    envelope: Envelope,
    outcome: Outcome,
) -> RuntimeResult<()> {
    match outcome {
        Outcome::Ok { .. } => {
            store.write_ahead(&envelope.op_id, outcome).await?;
            store.finalize(&envelope.op_id, OperationState::Completed).await?;
            bus.ack(&envelope).await?;
            info!(op_id = %envelope.op_id, "operation completed");
            Ok(())
        }
        Outcome::Fail { .. } => {
            store.write_ahead(&envelope.op_id, outcome.clone()).await?;
            store.finalize(&envelope.op_id, OperationState::Failed).await?;
            if config.dlq_on_fail {
                bus.publish_to_dlq(envelope, outcome).await?;
            } else {
                bus.ack(&envelope).await?;
            }
            Ok(())
        }
        Outcome::Retry {
            ref reason,
            attempt_count,
            next_retry_after_millis,
        } => {
            store.write_ahead(&envelope.op_id, outcome.clone()).await?;

            if config.retry_budget.is_exhausted(attempt_count) {
                warn!(op_id = %envelope.op_id, attempt_count, reason, "retry budget exhausted, converting to permanent failure");
                let fail_outcome = Outcome::fail(
                    "RETRY_BUDGET_EXHAUSTED",
                    format!("retry budget exhausted after {attempt_count} attempts: {reason}"),
                );
                store.write_ahead(&envelope.op_id, fail_outcome.clone()).await?;
                store.finalize(&envelope.op_id, OperationState::Failed).await?;
                if config.dlq_on_fail {
                    bus.publish_to_dlq(envelope, fail_outcome).await?;
                } else {
                    bus.ack(&envelope).await?;
                }
            } else {
                debug!(op_id = %envelope.op_id, attempt_count, next_retry_after_millis, "retry permitted, republishing with backoff");
                bus.publish(envelope.clone(), next_retry_after_millis as i64).await?;
                bus.ack(&envelope).await?;
            }
            Ok(())
        }
    }
}
