#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **opflow-types** – Shared value types and contracts for the opflow engine.
//!
//! This crate is dependency-light and sits at the very bottom of the crate
//! graph so that every other crate can depend on it without causing cycles.
//! It defines the data model in full: identifiers, the `Command`/`Envelope`
//! wire shapes, the `Outcome` sum type, and the `OperationState`/`WalState`
//! state machines. It makes no assumptions about storage, transport, or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

//─────────────────────────────
//  Validation limits
//─────────────────────────────

/// Maximum length of an [`OpId`] string.
pub const MAX_OP_ID_LEN: usize = 255;
/// Maximum length of a [`Domain`] string.
pub const MAX_DOMAIN_LEN: usize = 50;
/// Maximum length of an [`EventType`] string.
pub const MAX_EVENT_TYPE_LEN: usize = 100;
/// Maximum length of a [`BizKey`] string.
pub const MAX_BIZ_KEY_LEN: usize = 512;
/// Maximum length of an [`IdemKey`] string.
pub const MAX_IDEM_KEY_LEN: usize = 512;

//─────────────────────────────
//  Validation errors
//─────────────────────────────

/// Errors raised when constructing or validating a value object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A field was empty when it must not be.
    #[error("{field} must not be empty")]
    Empty {
        /// The field name.
        field: &'static str,
    },
    /// A field exceeded its maximum length.
    #[error("{field} too long: {len} > {max}")]
    TooLong {
        /// The field name.
        field: &'static str,
        /// The actual length observed.
        len: usize,
        /// The maximum permitted length.
        max: usize,
    },
    /// A field contained characters outside its permitted character set.
    #[error("{field} contains invalid characters: {value:?}")]
    InvalidCharset {
        /// The field name.
        field: &'static str,
        /// The offending value.
        value: String,
    },
    /// A numeric field fell outside its permitted range.
    #[error("{field} out of range: {value} not in [{min}, {max}]")]
    OutOfRange {
        /// The field name.
        field: &'static str,
        /// The observed value.
        value: i64,
        /// The minimum permitted value.
        min: i64,
        /// The maximum permitted value.
        max: i64,
    },
}

fn check_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    Ok(())
}

fn check_max_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.len() > max {
        return Err(ValidationError::TooLong {
            field,
            len: value.len(),
            max,
        });
    }
    Ok(())
}

fn check_charset(
    field: &'static str,
    value: &str,
    allowed: impl Fn(char) -> bool,
) -> Result<(), ValidationError> {
    if !value.chars().all(allowed) {
        return Err(ValidationError::InvalidCharset {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

//─────────────────────────────
//  OpId
//─────────────────────────────

/// Globally unique operation identifier.
///
/// Opaque string, validated non-empty, `<= 255` chars, restricted to
/// `[A-Za-z0-9_-]`. Created by the idempotency resolver; never mutated;
/// owned by the Store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(String);

impl OpId {
    /// Validate and wrap a raw string as an [`OpId`].
    pub fn parse(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        check_non_empty("OpId", &raw)?;
        check_max_len("OpId", &raw, MAX_OP_ID_LEN)?;
        check_charset("OpId", &raw, |c| {
            c.is_ascii_alphanumeric() || c == '_' || c == '-'
        })?;
        Ok(Self(raw))
    }

    /// Generate a fresh, collision-resistant [`OpId`] (UUIDv4, 122 bits of entropy).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//─────────────────────────────
//  IdempotencyKey components
//─────────────────────────────

/// Business domain a [`Command`] belongs to. Matches `[A-Z_]+`, `<= 50` chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain(String);

impl Domain {
    /// Validate and wrap a raw string as a [`Domain`].
    pub fn parse(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        check_non_empty("Domain", &raw)?;
        check_max_len("Domain", &raw, MAX_DOMAIN_LEN)?;
        check_charset("Domain", &raw, |c| c.is_ascii_uppercase() || c == '_')?;
        Ok(Self(raw))
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Short symbolic tag identifying the kind of event a [`Command`] represents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    /// Validate and wrap a raw string as an [`EventType`].
    pub fn parse(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        check_non_empty("EventType", &raw)?;
        check_max_len("EventType", &raw, MAX_EVENT_TYPE_LEN)?;
        Ok(Self(raw))
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the business entity a [`Command`] acts upon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BizKey(String);

impl BizKey {
    /// Validate and wrap a raw string as a [`BizKey`].
    pub fn parse(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        check_non_empty("BizKey", &raw)?;
        check_max_len("BizKey", &raw, MAX_BIZ_KEY_LEN)?;
        Ok(Self(raw))
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BizKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied deduplication token, typically a UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdemKey(String);

impl IdemKey {
    /// Validate and wrap a raw string as an [`IdemKey`].
    pub fn parse(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        check_non_empty("IdemKey", &raw)?;
        check_max_len("IdemKey", &raw, MAX_IDEM_KEY_LEN)?;
        Ok(Self(raw))
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composite `(Domain, EventType, BizKey, IdemKey)` key.
///
/// Invariant: the same [`IdempotencyKey`] always maps to the same [`OpId`],
/// forever (enforced by `opflow-idempotency`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    /// Business domain.
    pub domain: Domain,
    /// Event type tag.
    pub event_type: EventType,
    /// Business entity key.
    pub biz_key: BizKey,
    /// Caller-supplied dedup token.
    pub idem_key: IdemKey,
}

impl IdempotencyKey {
    /// Build a composite key from its validated parts.
    pub fn new(domain: Domain, event_type: EventType, biz_key: BizKey, idem_key: IdemKey) -> Self {
        Self {
            domain,
            event_type,
            biz_key,
            idem_key,
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.domain, self.event_type, self.biz_key, self.idem_key
        )
    }
}

//─────────────────────────────
//  Payload
//─────────────────────────────

/// Opaque byte blob carrying business data. May be absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    /// Wrap raw bytes as a [`Payload`].
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Wrap a UTF-8 string as a [`Payload`].
    pub fn from_str(s: impl AsRef<str>) -> Self {
        Self(s.as_ref().as_bytes().to_vec())
    }

    /// Borrow the underlying bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

//─────────────────────────────
//  Command
//─────────────────────────────

/// Immutable request to perform a business operation, validated on construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Business domain.
    pub domain: Domain,
    /// Event type tag.
    pub event_type: EventType,
    /// Business entity key.
    pub biz_key: BizKey,
    /// Caller-supplied dedup token.
    pub idem_key: IdemKey,
    /// Optional business payload.
    pub payload: Option<Payload>,
}

impl Command {
    /// Construct a new, validated [`Command`].
    pub fn new(
        domain: Domain,
        event_type: EventType,
        biz_key: BizKey,
        idem_key: IdemKey,
        payload: Option<Payload>,
    ) -> Self {
        Self {
            domain,
            event_type,
            biz_key,
            idem_key,
            payload,
        }
    }

    /// Derive the [`IdempotencyKey`] identifying this command.
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::new(
            self.domain.clone(),
            self.event_type.clone(),
            self.biz_key.clone(),
            self.idem_key.clone(),
        )
    }
}

//─────────────────────────────
//  Envelope
//─────────────────────────────

/// In-transit unit of work: a [`Command`] bound to its resolved [`OpId`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Resolved operation identifier.
    pub op_id: OpId,
    /// The command being carried.
    pub command: Command,
    /// Epoch millisecond timestamp at which the envelope was accepted.
    pub accepted_at: i64,
}

impl Envelope {
    /// Construct a new envelope. `accepted_at` must be non-negative.
    pub fn new(op_id: OpId, command: Command, accepted_at: i64) -> Result<Self, ValidationError> {
        if accepted_at < 0 {
            return Err(ValidationError::OutOfRange {
                field: "accepted_at",
                value: accepted_at,
                min: 0,
                max: i64::MAX,
            });
        }
        Ok(Self {
            op_id,
            command,
            accepted_at,
        })
    }
}

//─────────────────────────────
//  Outcome
//─────────────────────────────

/// Exhaustive sum type describing the result of executing an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[non_exhaustive]
pub enum Outcome {
    /// The operation succeeded.
    Ok {
        /// The operation this outcome belongs to.
        op_id: OpId,
        /// Optional human-readable message.
        message: Option<String>,
        /// Optional identifier assigned by the external provider.
        provider_txn_id: Option<String>,
        /// Optional result payload to hand back to the caller.
        result_payload: Option<Payload>,
    },
    /// A transient failure occurred; retry is permitted.
    Retry {
        /// Why the attempt failed.
        reason: String,
        /// 1-based count of attempts made so far.
        attempt_count: u32,
        /// Minimum delay, in milliseconds, before the next attempt.
        next_retry_after_millis: u64,
    },
    /// A permanent failure occurred; no further retry is permitted.
    Fail {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable message.
        message: String,
        /// Optional underlying cause, as a string for wire/storage portability.
        cause: Option<String>,
    },
}

impl Outcome {
    /// Construct an `Ok` outcome with only the required fields set.
    pub fn ok(op_id: OpId) -> Self {
        Self::Ok {
            op_id,
            message: None,
            provider_txn_id: None,
            result_payload: None,
        }
    }

    /// Construct a `Retry` outcome.
    pub fn retry(
        reason: impl Into<String>,
        attempt_count: u32,
        next_retry_after_millis: u64,
    ) -> Result<Self, ValidationError> {
        if attempt_count == 0 {
            return Err(ValidationError::OutOfRange {
                field: "attempt_count",
                value: 0,
                min: 1,
                max: i64::MAX,
            });
        }
        Ok(Self::Retry {
            reason: reason.into(),
            attempt_count,
            next_retry_after_millis,
        })
    }

    /// Construct a `Fail` outcome.
    pub fn fail(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fail {
            error_code: error_code.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// `true` for `Ok`, `false` otherwise.
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok { .. })
    }

    /// `true` for `Fail`, `false` otherwise.
    pub fn is_fail(&self) -> bool {
        matches!(self, Outcome::Fail { .. })
    }

    /// `true` for `Retry`, `false` otherwise.
    pub fn is_retry(&self) -> bool {
        matches!(self, Outcome::Retry { .. })
    }

    /// The [`OperationState`] this outcome implies once reflected into the
    /// state machine, per invariant I4. `Retry` has no terminal mapping.
    pub fn terminal_state(&self) -> Option<OperationState> {
        match self {
            Outcome::Ok { .. } => Some(OperationState::Completed),
            Outcome::Fail { .. } => Some(OperationState::Failed),
            Outcome::Retry { .. } => None,
        }
    }
}

//─────────────────────────────
//  OperationState
//─────────────────────────────

/// Finite state machine governing an operation's lifecycle.
///
/// Legal transitions (I2): `Pending -> InProgress -> {Completed, Failed}`,
/// plus `InProgress -> InProgress` on retry. `Completed`/`Failed` are
/// terminal (I1): no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    /// Operation accepted but not yet dequeued for execution.
    Pending,
    /// Operation is being executed (possibly retried).
    InProgress,
    /// Operation completed successfully. Terminal.
    Completed,
    /// Operation failed permanently. Terminal.
    Failed,
}

impl OperationState {
    /// `true` for `Completed`/`Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Completed | OperationState::Failed)
    }

    /// Whether transitioning from `self` to `next` is legal per I1/I2.
    pub fn can_transition_to(&self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
        )
    }
}

//─────────────────────────────
//  WalState
//─────────────────────────────

/// Tracks whether an [`Outcome`] recorded in the WAL has been reflected
/// into the [`OperationState`] machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalState {
    /// The WAL entry has not yet been finalized into the operation state.
    Pending,
    /// The WAL entry has been finalized.
    Completed,
}

//─────────────────────────────
//  Storage-side records
//─────────────────────────────

/// Storage-side representation of an operation's state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// The operation identifier.
    pub op_id: OpId,
    /// Current lifecycle state.
    pub current_state: OperationState,
    /// Monotonic version counter for optimistic-concurrency updates.
    pub version: u64,
    /// Creation timestamp, epoch milliseconds.
    pub created_at: i64,
    /// Last-update timestamp, epoch milliseconds.
    pub updated_at: i64,
    /// The idempotency key that produced this operation.
    pub idempotency_key: IdempotencyKey,
}

/// Storage-side WAL entry. Exactly one per [`OpId`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntryRecord {
    /// The operation this entry belongs to.
    pub op_id: OpId,
    /// The latest recorded outcome.
    pub outcome: Outcome,
    /// Whether this outcome has been reflected into the operation state.
    pub wal_state: WalState,
    /// Timestamp this entry was last written, epoch milliseconds.
    pub occurred_at: i64,
}

/// Persisted [`Envelope`] record, kept so the Reaper can replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeRecord {
    /// The operation this envelope belongs to.
    pub op_id: OpId,
    /// The original command.
    pub command: Command,
    /// Acceptance timestamp, epoch milliseconds.
    pub accepted_at: i64,
}

//─────────────────────────────
//  Retry budget (closes Open Question 3 of spec.md §9)
//─────────────────────────────

/// Configurable bound on how many times an operation may be retried before
/// it is converted to a permanent `Fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    /// Maximum number of attempts (including the first) before giving up.
    pub max_attempts: u32,
    /// Base backoff, in milliseconds, used when a policy doesn't specify one.
    pub base_backoff_millis: u64,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_millis: 100,
        }
    }
}

impl RetryBudget {
    /// Whether `attempt_count` has exhausted this budget.
    pub fn is_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_id_rejects_bad_charset() {
        assert!(OpId::parse("has space").is_err());
        assert!(OpId::parse("").is_err());
        assert!(OpId::parse("a".repeat(300)).is_err());
        assert!(OpId::parse("valid-op_123").is_ok());
    }

    #[test]
    fn domain_requires_upper_snake() {
        assert!(Domain::parse("ORDER").is_ok());
        assert!(Domain::parse("ORDER_BOOK").is_ok());
        assert!(Domain::parse("order").is_err());
        assert!(Domain::parse("").is_err());
    }

    #[test]
    fn command_idempotency_key_round_trips_components() {
        let cmd = Command::new(
            Domain::parse("ORDER").unwrap(),
            EventType::parse("CREATE").unwrap(),
            BizKey::parse("o-1").unwrap(),
            IdemKey::parse("k-1").unwrap(),
            Some(Payload::from_str("{}")),
        );
        let key = cmd.idempotency_key();
        assert_eq!(key.domain.as_str(), "ORDER");
        assert_eq!(key.biz_key.as_str(), "o-1");
    }

    #[test]
    fn operation_state_transitions_respect_invariants() {
        use OperationState::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn outcome_terminal_state_mapping() {
        let op_id = OpId::generate();
        assert_eq!(
            Outcome::ok(op_id).terminal_state(),
            Some(OperationState::Completed)
        );
        assert_eq!(
            Outcome::fail("E", "m").terminal_state(),
            Some(OperationState::Failed)
        );
        assert_eq!(Outcome::retry("503", 1, 50).unwrap().terminal_state(), None);
    }

    #[test]
    fn retry_outcome_rejects_zero_attempt_count() {
        assert!(Outcome::retry("x", 0, 0).is_err());
        assert!(Outcome::retry("x", 1, 0).is_ok());
    }

    #[test]
    fn envelope_rejects_negative_accepted_at() {
        let cmd = Command::new(
            Domain::parse("ORDER").unwrap(),
            EventType::parse("CREATE").unwrap(),
            BizKey::parse("o-1").unwrap(),
            IdemKey::parse("k-1").unwrap(),
            None,
        );
        assert!(Envelope::new(OpId::generate(), cmd.clone(), -1).is_err());
        assert!(Envelope::new(OpId::generate(), cmd, 0).is_ok());
    }

    #[test]
    fn retry_budget_exhaustion() {
        let budget = RetryBudget {
            max_attempts: 3,
            base_backoff_millis: 10,
        };
        assert!(!budget.is_exhausted(1));
        assert!(!budget.is_exhausted(2));
        assert!(budget.is_exhausted(3));
        assert!(budget.is_exhausted(4));
    }

    #[test]
    fn serde_round_trip_outcome() {
        let outcome = Outcome::ok(OpId::generate());
        let json = serde_json::to_string(&outcome).unwrap();
        let back: Outcome = serde_json::from_str(&json).unwrap();
        assert_eq!(outcome, back);
    }
}
