#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **opflow-store-core** – Store & WAL protocol abstraction for opflow.
//!
//! This crate defines the durable state machine contract operations
//! (`write_ahead`, `finalize`, the two scans, and the three getters) described
//! in §4.4 of the engine specification, without providing a concrete
//! backend. Storage drivers (in-memory, relational, KV) implement
//! [`Store`] in separate crates.
//!
//! `write_ahead` and `finalize` are each required to be their own atomic
//! unit; `finalize` additionally asserts the operation is currently
//! non-terminal and bumps [`opflow_types::OperationRecord::version`] for
//! optimistic-concurrency control (I3, I4, I5 of the spec).

use async_trait::async_trait;

use opflow_types::{Envelope, EnvelopeRecord, OpId, OperationState, Outcome, WalEntryRecord, WalState};

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors raised by a [`Store`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No operation exists for the given [`OpId`].
    #[error("operation not found: {0}")]
    OperationNotFound(OpId),
    /// No WAL entry exists for the given [`OpId`].
    #[error("WAL entry not found: {0}")]
    WalEntryNotFound(OpId),
    /// No persisted envelope exists for the given [`OpId`].
    #[error("envelope not found: {0}")]
    EnvelopeNotFound(OpId),
    /// `finalize` was asked to set a non-terminal state.
    #[error("finalize requires a terminal state, got {0:?}")]
    NonTerminalFinalize(OperationState),
    /// The underlying storage backend failed (I/O, network, …).
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Convenience result alias for [`Store`] operations.
pub type StoreResult<T> = Result<T, StoreError>;

//─────────────────────────────
//  Store port
//─────────────────────────────

/// Abstraction over the durable operation state machine and its WAL.
///
/// See §4.4 of the engine specification for the full contract each method
/// must satisfy, including transactional guarantees for `finalize` and
/// `write_ahead`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a brand-new `Pending` operation record for `op_id`, owned by
    /// `idempotency_key`, and persist `envelope` for later replay. A no-op
    /// if the operation already exists (idempotent re-submit).
    async fn create_if_absent(
        &self,
        op_id: &OpId,
        idempotency_key: &opflow_types::IdempotencyKey,
        envelope: &Envelope,
    ) -> StoreResult<()>;

    /// Transition `op_id` from `Pending` to `InProgress` (idempotent if
    /// already `InProgress`). Fails if the operation is terminal or unknown.
    async fn mark_in_progress(&self, op_id: &OpId) -> StoreResult<()>;

    /// Insert or overwrite the WAL entry for `op_id` with `outcome`,
    /// `wal_state = Pending`, `occurred_at = now`. Atomic; its own
    /// transaction, independent of `finalize`.
    async fn write_ahead(&self, op_id: &OpId, outcome: Outcome) -> StoreResult<()>;

    /// Transactionally: assert `op_id`'s current state is non-terminal,
    /// update it to `terminal_state` with a version bump, and mark the
    /// WAL entry `Completed`. A concurrent finalize that lost the race
    /// observes the already-terminal state and must be treated as success
    /// by the caller (I1).
    async fn finalize(&self, op_id: &OpId, terminal_state: OperationState) -> StoreResult<()>;

    /// Return up to `batch_size` op ids whose WAL entry matches `wal_state`,
    /// ordered by `occurred_at` ascending.
    async fn scan_wa(&self, wal_state: WalState, batch_size: usize) -> StoreResult<Vec<OpId>>;

    /// Return the currently stored [`Outcome`] for `op_id`.
    async fn get_write_ahead_outcome(&self, op_id: &OpId) -> StoreResult<Outcome>;

    /// Return up to `batch_size` op ids currently `InProgress` whose
    /// envelope was accepted more than `timeout_threshold_millis` ago,
    /// ordered by `accepted_at` ascending.
    async fn scan_in_progress(
        &self,
        timeout_threshold_millis: i64,
        batch_size: usize,
    ) -> StoreResult<Vec<OpId>>;

    /// Return the persisted [`EnvelopeRecord`] for `op_id`, for replay.
    async fn get_envelope(&self, op_id: &OpId) -> StoreResult<EnvelopeRecord>;

    /// Return the current [`OperationState`] of `op_id`.
    async fn get_state(&self, op_id: &OpId) -> StoreResult<OperationState>;

    /// Return the current WAL entry for `op_id`, if one has been written.
    async fn get_wal_entry(&self, op_id: &OpId) -> StoreResult<Option<WalEntryRecord>>;

    /// Resolve an already-assigned [`OpId`] for `idempotency_key`, if any
    /// operation has ever been created for it. Used by the idempotency
    /// resolver to detect a replayed submit after process restart when the
    /// idempotency map itself is not durable.
    async fn find_op_id(
        &self,
        idempotency_key: &opflow_types::IdempotencyKey,
    ) -> StoreResult<Option<OpId>>;
}
