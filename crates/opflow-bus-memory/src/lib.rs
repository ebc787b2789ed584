#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **opflow-bus-memory** – In-memory reference [`Bus`] adapter.
//!
//! Non-persistent, single-process implementation of the §6 Bus port: a
//! delayed-visibility queue plus an in-flight table keyed by `OpId`, guarded
//! by independent `RwLock`s in the same style as `opflow-store-memory`.
//! Messages past their visibility deadline without an `ack` are
//! automatically reclaimed and made visible again on the next `dequeue`,
//! giving the at-least-once redelivery semantics the Runtime depends on.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use opflow_bus_core::{Bus, BusError, BusResult, DlqEntry, DEFAULT_VISIBILITY_TIMEOUT_MILLIS};
use opflow_types::{Envelope, OpId, Outcome};

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct QueuedMessage {
    envelope: Envelope,
    visible_at: i64,
}

struct InFlightMessage {
    envelope: Envelope,
    deadline: i64,
}

/// An in-memory, non-persistent [`Bus`] implementation.
pub struct MemoryBus {
    visibility_timeout_millis: i64,
    queue: Arc<RwLock<VecDeque<QueuedMessage>>>,
    in_flight: Arc<RwLock<HashMap<OpId, InFlightMessage>>>,
    dlq: Arc<RwLock<Vec<DlqEntry>>>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_VISIBILITY_TIMEOUT_MILLIS)
    }
}

impl MemoryBus {
    /// Create a new, empty [`MemoryBus`] with `visibility_timeout_millis`.
    pub fn new(visibility_timeout_millis: u64) -> Self {
        Self {
            visibility_timeout_millis: visibility_timeout_millis as i64,
            queue: Arc::new(RwLock::new(VecDeque::new())),
            in_flight: Arc::new(RwLock::new(HashMap::new())),
            dlq: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Number of messages currently visible or pending visibility. Test/diagnostic helper.
    pub async fn queued_count(&self) -> usize {
        self.queue.read().await.len()
    }

    /// Number of messages currently in flight (dequeued, not yet acked). Test/diagnostic helper.
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.read().await.len()
    }

    /// Snapshot of the dead-letter destination. Test/diagnostic helper.
    pub async fn dlq_entries(&self) -> Vec<DlqEntry> {
        self.dlq.read().await.clone()
    }

    /// Move any in-flight messages whose visibility deadline has elapsed
    /// back onto the visible queue, oldest first.
    async fn reclaim_expired(&self) {
        let now = now_millis();
        let mut in_flight = self.in_flight.write().await;
        let expired: Vec<OpId> = in_flight
            .iter()
            .filter(|(_, msg)| msg.deadline <= now)
            .map(|(op_id, _)| op_id.clone())
            .collect();

        if expired.is_empty() {
            return;
        }

        let mut queue = self.queue.write().await;
        for op_id in expired {
            if let Some(msg) = in_flight.remove(&op_id) {
                warn!(%op_id, "visibility timeout expired, redelivering");
                queue.push_back(QueuedMessage {
                    envelope: msg.envelope,
                    visible_at: now,
                });
            }
        }
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, envelope: Envelope, delay_millis: i64) -> BusResult<()> {
        if delay_millis < 0 {
            return Err(BusError::NegativeDelay(delay_millis));
        }

        let visible_at = now_millis() + delay_millis;
        self.queue
            .write()
            .await
            .push_back(QueuedMessage { envelope, visible_at });
        Ok(())
    }

    async fn dequeue(&self, batch_size: usize) -> BusResult<Vec<Envelope>> {
        self.reclaim_expired().await;

        let now = now_millis();
        let mut queue = self.queue.write().await;

        let mut taken_indices = Vec::new();
        for (idx, msg) in queue.iter().enumerate() {
            if msg.visible_at <= now {
                taken_indices.push(idx);
                if taken_indices.len() == batch_size {
                    break;
                }
            }
        }

        let mut taken = Vec::with_capacity(taken_indices.len());
        for idx in taken_indices.into_iter().rev() {
            if let Some(msg) = queue.remove(idx) {
                taken.push(msg);
            }
        }
        taken.reverse();
        drop(queue);

        let deadline = now + self.visibility_timeout_millis;
        let mut in_flight = self.in_flight.write().await;
        let mut envelopes = Vec::with_capacity(taken.len());
        for msg in taken {
            in_flight.insert(
                msg.envelope.op_id.clone(),
                InFlightMessage {
                    envelope: msg.envelope.clone(),
                    deadline,
                },
            );
            envelopes.push(msg.envelope);
        }

        debug!(count = envelopes.len(), "dequeued batch");
        Ok(envelopes)
    }

    async fn ack(&self, envelope: &Envelope) -> BusResult<()> {
        self.in_flight
            .write()
            .await
            .remove(&envelope.op_id)
            .map(|_| ())
            .ok_or_else(|| BusError::NotInFlight(envelope.op_id.to_string()))
    }

    async fn nack(&self, envelope: &Envelope) -> BusResult<()> {
        let removed = self.in_flight.write().await.remove(&envelope.op_id);
        let Some(msg) = removed else {
            return Err(BusError::NotInFlight(envelope.op_id.to_string()));
        };

        self.queue.write().await.push_front(QueuedMessage {
            envelope: msg.envelope,
            visible_at: now_millis(),
        });
        Ok(())
    }

    async fn publish_to_dlq(&self, envelope: Envelope, outcome: Outcome) -> BusResult<()> {
        self.in_flight.write().await.remove(&envelope.op_id);
        self.dlq.write().await.push(DlqEntry {
            envelope,
            outcome,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use opflow_types::{BizKey, Command, Domain, EventType, IdemKey};

    use super::*;

    fn sample_envelope() -> Envelope {
        let cmd = Command::new(
            Domain::parse("ORDER").unwrap(),
            EventType::parse("CREATE").unwrap(),
            BizKey::parse("o-1").unwrap(),
            IdemKey::parse("k-1").unwrap(),
            None,
        );
        Envelope::new(OpId::generate(), cmd, now_millis()).unwrap()
    }

    #[tokio::test]
    async fn publish_then_dequeue_round_trips() {
        let bus = MemoryBus::new(30_000);
        let envelope = sample_envelope();
        bus.publish(envelope.clone(), 0).await.unwrap();

        let dequeued = bus.dequeue(10).await.unwrap();
        assert_eq!(dequeued, vec![envelope]);
        assert_eq!(bus.in_flight_count().await, 1);
    }

    #[tokio::test]
    async fn ack_removes_in_flight_message() {
        let bus = MemoryBus::new(30_000);
        let envelope = sample_envelope();
        bus.publish(envelope.clone(), 0).await.unwrap();
        bus.dequeue(10).await.unwrap();

        bus.ack(&envelope).await.unwrap();
        assert_eq!(bus.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn ack_on_unknown_envelope_errors() {
        let bus = MemoryBus::new(30_000);
        let envelope = sample_envelope();
        let err = bus.ack(&envelope).await.unwrap_err();
        assert!(matches!(err, BusError::NotInFlight(_)));
    }

    #[tokio::test]
    async fn nack_makes_message_immediately_redeliverable() {
        let bus = MemoryBus::new(30_000);
        let envelope = sample_envelope();
        bus.publish(envelope.clone(), 0).await.unwrap();
        bus.dequeue(10).await.unwrap();

        bus.nack(&envelope).await.unwrap();
        assert_eq!(bus.in_flight_count().await, 0);

        let redelivered = bus.dequeue(10).await.unwrap();
        assert_eq!(redelivered, vec![envelope]);
    }

    #[tokio::test]
    async fn delayed_publish_is_not_immediately_visible() {
        let bus = MemoryBus::new(30_000);
        let envelope = sample_envelope();
        bus.publish(envelope.clone(), 60_000).await.unwrap();

        let dequeued = bus.dequeue(10).await.unwrap();
        assert!(dequeued.is_empty());
    }

    #[tokio::test]
    async fn negative_delay_is_rejected() {
        let bus = MemoryBus::new(30_000);
        let err = bus.publish(sample_envelope(), -1).await.unwrap_err();
        assert!(matches!(err, BusError::NegativeDelay(-1)));
    }

    #[tokio::test]
    async fn expired_visibility_timeout_triggers_redelivery() {
        let bus = MemoryBus::new(0);
        let envelope = sample_envelope();
        bus.publish(envelope.clone(), 0).await.unwrap();
        bus.dequeue(10).await.unwrap();
        assert_eq!(bus.in_flight_count().await, 1);

        // Visibility timeout is effectively 0, so the message is immediately
        // eligible for reclaim on the next dequeue.
        let redelivered = bus.dequeue(10).await.unwrap();
        assert_eq!(redelivered, vec![envelope]);
    }

    #[tokio::test]
    async fn publish_to_dlq_acks_and_records_entry() {
        let bus = MemoryBus::new(30_000);
        let envelope = sample_envelope();
        bus.publish(envelope.clone(), 0).await.unwrap();
        bus.dequeue(10).await.unwrap();

        let outcome = Outcome::fail("VALIDATION", "bad amount");
        bus.publish_to_dlq(envelope.clone(), outcome).await.unwrap();

        assert_eq!(bus.in_flight_count().await, 0);
        let entries = bus.dlq_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].envelope, envelope);
    }

    #[tokio::test]
    async fn dequeue_respects_batch_size() {
        let bus = MemoryBus::new(30_000);
        for _ in 0..5 {
            bus.publish(sample_envelope(), 0).await.unwrap();
        }

        let first_batch = bus.dequeue(2).await.unwrap();
        assert_eq!(first_batch.len(), 2);
        assert_eq!(bus.queued_count().await, 3);
    }
}
