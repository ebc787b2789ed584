#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **opflow-orchestrator** – Submit path for the opflow engine (§4.2).
//!
//! Accepts a validated [`Command`], resolves its [`OpId`] via the
//! idempotency resolver, persists and publishes an [`Envelope`], then
//! soft-polls the [`Store`] for a terminal outcome within the caller's
//! `time_budget_millis`. Grounded on `toka-kernel::Kernel::submit`'s
//! validate -> resolve -> execute -> return shape, generalized with a
//! `tokio::time::sleep` soft-poll loop the kernel (being synchronous) has
//! no analogue for.

use std::sync::Arc;
use std::time::Duration;

use opflow_bus_core::{Bus, BusError};
use opflow_idempotency::{IdempotencyError, IdempotencyManager};
use opflow_store_core::{Store, StoreError};
use opflow_types::{Command, Envelope, OpId, OperationState, Outcome, ValidationError};
use tracing::{debug, info, instrument};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Lower bound on `time_budget_millis` (§4.2): below this, soft-polling is
/// ineffective.
pub const MIN_TIME_BUDGET_MILLIS: u64 = 50;
/// Upper bound on `time_budget_millis`: above this, the caller blocks too
/// long.
pub const MAX_TIME_BUDGET_MILLIS: u64 = 5_000;
/// Default soft-poll interval, in milliseconds.
pub const DEFAULT_SOFT_POLL_INTERVAL_MILLIS: u64 = 10;
/// Lower bound the soft-poll interval may be tuned down to.
pub const MIN_SOFT_POLL_INTERVAL_MILLIS: u64 = 5;

/// Configuration for an [`Orchestrator`].
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    /// Interval between `Store::get_state` polls while soft-waiting.
    pub soft_poll_interval_millis: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            soft_poll_interval_millis: DEFAULT_SOFT_POLL_INTERVAL_MILLIS,
        }
    }
}

impl OrchestratorConfig {
    /// Clamp `soft_poll_interval_millis` to its documented lower bound.
    pub fn with_soft_poll_interval_millis(mut self, millis: u64) -> Self {
        self.soft_poll_interval_millis = millis.max(MIN_SOFT_POLL_INTERVAL_MILLIS);
        self
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors raised by [`Orchestrator::submit`].
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The submitted `Command` failed validation.
    #[error("invalid command: {0}")]
    Validation(#[from] ValidationError),
    /// `time_budget_millis` fell outside `[50, 5000]`.
    #[error("time_budget_millis {0} out of range [{MIN_TIME_BUDGET_MILLIS}, {MAX_TIME_BUDGET_MILLIS}]")]
    TimeBudgetOutOfRange(u64),
    /// The idempotency resolver failed.
    #[error("idempotency resolution failed: {0}")]
    Idempotency(#[from] IdempotencyError),
    /// The Store failed during enqueue.
    #[error("store error during submit: {0}")]
    Store(#[from] StoreError),
    /// The Bus failed during publish.
    #[error("bus error during submit: {0}")]
    Bus(#[from] BusError),
}

/// Convenience result alias for [`Orchestrator::submit`].
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

//─────────────────────────────
//  Submission handle
//─────────────────────────────

/// Opaque token a caller can later exchange for the operation's status,
/// when the submit path handed off to async processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLocator {
    /// The operation this locator resolves to.
    pub op_id: OpId,
}

impl StatusLocator {
    /// Render this locator as an opaque string token (the `OpId` itself;
    /// the embedding application's status-query endpoint is out of scope
    /// here, per §1).
    pub fn as_token(&self) -> &str {
        self.op_id.as_str()
    }
}

/// Result of [`Orchestrator::submit`]: either the operation reached a
/// terminal state within the time budget (`Completed`) or it did not
/// (`Async`). The two variants are mutually exclusive by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionHandle {
    /// The operation reached a terminal state within `time_budget_millis`.
    Completed {
        /// The resolved operation identifier.
        op_id: OpId,
        /// The terminal outcome observed.
        outcome: Outcome,
    },
    /// The operation did not reach a terminal state in time; the caller
    /// must poll or subscribe for the result out of band.
    Async {
        /// The resolved operation identifier.
        op_id: OpId,
        /// Token the caller can exchange for status later.
        status_locator: StatusLocator,
    },
}

impl SubmissionHandle {
    /// `true` if this handle represents a fast-path completion.
    pub fn is_completed(&self) -> bool {
        matches!(self, SubmissionHandle::Completed { .. })
    }

    /// The `OpId` this handle refers to, regardless of variant.
    pub fn op_id(&self) -> &OpId {
        match self {
            SubmissionHandle::Completed { op_id, .. } => op_id,
            SubmissionHandle::Async { op_id, .. } => op_id,
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

//─────────────────────────────
//  Orchestrator
//─────────────────────────────

/// Accepts `Command`s and drives them through the submit path (§4.2).
pub struct Orchestrator {
    store: Arc<dyn Store>,
    bus: Arc<dyn Bus>,
    idempotency: Arc<dyn IdempotencyManager>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Construct a new [`Orchestrator`] over the given collaborators.
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn Bus>,
        idempotency: Arc<dyn IdempotencyManager>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            bus,
            idempotency,
            config,
        }
    }

    /// Accept `command`, resolve its `OpId`, enqueue it, and soft-poll for
    /// up to `time_budget_millis` before handing back a
    /// [`SubmissionHandle`].
    ///
    /// If the resolved `OpId` already has a terminal state (an idempotent
    /// resubmit after completion), this returns a `Completed` handle
    /// carrying the *stored* outcome immediately, without re-enqueueing —
    /// the decision recorded for Open Question 2 of `spec.md` §9.
    #[instrument(skip(self, command), fields(domain = %command.domain, event_type = %command.event_type))]
    pub async fn submit(
        &self,
        command: Command,
        time_budget_millis: u64,
    ) -> OrchestratorResult<SubmissionHandle> {
        if !(MIN_TIME_BUDGET_MILLIS..=MAX_TIME_BUDGET_MILLIS).contains(&time_budget_millis) {
            return Err(OrchestratorError::TimeBudgetOutOfRange(time_budget_millis));
        }

        let idempotency_key = command.idempotency_key();
        let op_id = self.idempotency.get_or_create(&idempotency_key).await?;
        debug!(%op_id, "resolved op_id for submitted command");

        let accepted_at = now_millis();
        let envelope = Envelope::new(op_id.clone(), command, accepted_at)?;

        self.store
            .create_if_absent(&op_id, &idempotency_key, &envelope)
            .await?;

        let current_state = self.store.get_state(&op_id).await?;
        if current_state.is_terminal() {
            info!(%op_id, ?current_state, "idempotent resubmit of already-terminal operation");
            let outcome = self.store.get_write_ahead_outcome(&op_id).await?;
            return Ok(SubmissionHandle::Completed { op_id, outcome });
        }

        self.bus.publish(envelope, 0).await?;

        self.soft_poll(op_id, time_budget_millis).await
    }

    async fn soft_poll(
        &self,
        op_id: OpId,
        time_budget_millis: u64,
    ) -> OrchestratorResult<SubmissionHandle> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(time_budget_millis);
        let poll_interval = Duration::from_millis(self.config.soft_poll_interval_millis);

        loop {
            let state = self.store.get_state(&op_id).await?;
            if state.is_terminal() {
                let outcome = self.store.get_write_ahead_outcome(&op_id).await?;
                debug!(%op_id, ?state, "submit fast-completed within time budget");
                return Ok(SubmissionHandle::Completed { op_id, outcome });
            }

            if tokio::time::Instant::now() >= deadline {
                debug!(%op_id, "time budget elapsed, handing off to async status query");
                return Ok(SubmissionHandle::Async {
                    op_id: op_id.clone(),
                    status_locator: StatusLocator { op_id },
                });
            }

            tokio::time::sleep(poll_interval.min(deadline.saturating_duration_since(
                tokio::time::Instant::now(),
            )))
            .await;
        }
    }
}

//─────────────────────────────
//  OperationState helper re-export (for crate consumers querying status)
//─────────────────────────────

/// Convenience re-export so downstream crates querying submission status
/// don't need a direct `opflow-types` dependency just for this type.
pub use opflow_types::OperationState as SubmittedOperationState;
