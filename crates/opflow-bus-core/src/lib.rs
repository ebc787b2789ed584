#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **opflow-bus-core** – Bus port abstraction for opflow.
//!
//! Defines the message-transport contract (§6 of the engine specification):
//! `publish`, `dequeue`, `ack`, `nack`, `publish_to_dlq`, with at-least-once
//! delivery semantics and a visibility timeout protecting in-flight
//! messages. Concrete transports (in-memory, queue/broker-backed) implement
//! [`Bus`] in separate crates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use opflow_types::{Envelope, Outcome};

/// Default visibility timeout applied to a dequeued message, in milliseconds.
pub const DEFAULT_VISIBILITY_TIMEOUT_MILLIS: u64 = 30_000;

/// Default long-poll wait applied by `dequeue`, in milliseconds.
pub const DEFAULT_DEQUEUE_WAIT_MILLIS: u64 = 20_000;

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors raised by a [`Bus`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// `delay_millis` was negative.
    #[error("delay_millis must be non-negative, got {0}")]
    NegativeDelay(i64),
    /// The envelope being acked/nacked is not currently in flight
    /// (already acked, or its visibility timeout already expired and it
    /// was redelivered to another consumer).
    #[error("envelope {0} is not in flight")]
    NotInFlight(String),
    /// The underlying transport failed (I/O, network, broker error, …).
    #[error("bus transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

/// Convenience result alias for [`Bus`] operations.
pub type BusResult<T> = Result<T, BusError>;

//─────────────────────────────
//  Dead-letter entry
//─────────────────────────────

/// A message routed to the dead-letter destination, with the failure that
/// caused it to be routed there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    /// The envelope that exhausted retries or hit a permanent failure.
    pub envelope: Envelope,
    /// The terminal `Fail` outcome (or final `Retry` outcome if the retry
    /// budget was exhausted without the executor producing a `Fail`).
    pub outcome: Outcome,
}

//─────────────────────────────
//  Bus port
//─────────────────────────────

/// Abstraction over the message transport the Runtime pumps Envelopes
/// through.
///
/// Delivery semantics are at-least-once: a dequeued message stays invisible
/// to other consumers only for its visibility timeout, after which — absent
/// an `ack` — it is redelivered. Implementations must therefore tolerate
/// concurrent `ack`/`nack` calls racing a timeout-triggered redelivery.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Enqueue `envelope`, becoming visible to consumers after `delay_millis`
    /// (0 = immediate). `delay_millis` must be non-negative.
    async fn publish(&self, envelope: Envelope, delay_millis: i64) -> BusResult<()>;

    /// Dequeue up to `batch_size` envelopes, marking each invisible for the
    /// bus's configured visibility timeout.
    async fn dequeue(&self, batch_size: usize) -> BusResult<Vec<Envelope>>;

    /// Permanently and idempotently remove `envelope` from the queue.
    async fn ack(&self, envelope: &Envelope) -> BusResult<()>;

    /// Return `envelope` for immediate redelivery, without waiting out its
    /// remaining visibility timeout.
    async fn nack(&self, envelope: &Envelope) -> BusResult<()>;

    /// Route `envelope` to the dead-letter destination with `outcome` as
    /// failure metadata, then ack the original delivery.
    async fn publish_to_dlq(&self, envelope: Envelope, outcome: Outcome) -> BusResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_error_messages_are_descriptive() {
        let err = BusError::NegativeDelay(-5);
        assert!(err.to_string().contains("-5"));
    }
}
