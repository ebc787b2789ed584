#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **opflow-store-memory** – In-memory reference [`Store`] adapter.
//!
//! This crate provides a fast, non-persistent backend suitable for testing
//! and local development. All data is lost when the process terminates;
//! implementations requiring crash durability must use a different adapter
//! against the same [`opflow_store_core::Store`] contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use opflow_store_core::{Store, StoreError, StoreResult};
use opflow_types::{
    Envelope, EnvelopeRecord, IdempotencyKey, OpId, OperationRecord, OperationState, Outcome,
    WalEntryRecord, WalState,
};

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

//─────────────────────────────
//  In-memory Store
//─────────────────────────────

/// An in-memory, non-persistent [`Store`] implementation.
///
/// Internally this is three `HashMap`s guarded by independent `RwLock`s:
/// operation records, WAL entries, and envelope records, plus an
/// idempotency-key index used by `find_op_id`. Locks are never held across
/// an await boundary that could block on another lock, avoiding deadlocks
/// between concurrent `finalize`/`write_ahead` calls on different op ids.
#[derive(Debug, Default)]
pub struct MemoryStore {
    operations: Arc<RwLock<HashMap<OpId, OperationRecord>>>,
    wal: Arc<RwLock<HashMap<OpId, WalEntryRecord>>>,
    envelopes: Arc<RwLock<HashMap<OpId, EnvelopeRecord>>>,
    idempotency_index: Arc<RwLock<HashMap<IdempotencyKey, OpId>>>,
}

impl MemoryStore {
    /// Create a new, empty [`MemoryStore`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operation records currently held. Test/diagnostic helper.
    pub async fn operation_count(&self) -> usize {
        self.operations.read().await.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_if_absent(
        &self,
        op_id: &OpId,
        idempotency_key: &IdempotencyKey,
        envelope: &Envelope,
    ) -> StoreResult<()> {
        let mut operations = self.operations.write().await;
        if operations.contains_key(op_id) {
            debug!(%op_id, "operation already exists, skipping create");
            return Ok(());
        }

        let now = now_millis();
        operations.insert(
            op_id.clone(),
            OperationRecord {
                op_id: op_id.clone(),
                current_state: OperationState::Pending,
                version: 0,
                created_at: now,
                updated_at: now,
                idempotency_key: idempotency_key.clone(),
            },
        );
        drop(operations);

        self.envelopes.write().await.insert(
            op_id.clone(),
            EnvelopeRecord {
                op_id: op_id.clone(),
                command: envelope.command.clone(),
                accepted_at: envelope.accepted_at,
            },
        );

        self.idempotency_index
            .write()
            .await
            .entry(idempotency_key.clone())
            .or_insert_with(|| op_id.clone());

        Ok(())
    }

    async fn mark_in_progress(&self, op_id: &OpId) -> StoreResult<()> {
        let mut operations = self.operations.write().await;
        let record = operations
            .get_mut(op_id)
            .ok_or_else(|| StoreError::OperationNotFound(op_id.clone()))?;

        if record.current_state.is_terminal() {
            // I1: no transition leaves a terminal state. Treated as a
            // successful no-op per the spec's invariant-violation policy.
            warn!(%op_id, state = ?record.current_state, "mark_in_progress on terminal operation ignored");
            return Ok(());
        }

        record.current_state = OperationState::InProgress;
        record.version += 1;
        record.updated_at = now_millis();
        Ok(())
    }

    async fn write_ahead(&self, op_id: &OpId, outcome: Outcome) -> StoreResult<()> {
        let mut wal = self.wal.write().await;
        let occurred_at = now_millis();
        match wal.get_mut(op_id) {
            Some(entry) if entry.wal_state == WalState::Completed => {
                // A concurrent finalize already flipped this entry to
                // Completed; the Runtime's discipline (check get_state
                // before write_ahead) means this should not happen, but we
                // preserve wal_state to honour §4.4's overwrite rule.
                warn!(%op_id, "write_ahead raced with finalize, outcome overwritten, wal_state preserved");
                entry.outcome = outcome;
                entry.occurred_at = occurred_at;
            }
            Some(entry) => {
                entry.outcome = outcome;
                entry.occurred_at = occurred_at;
            }
            None => {
                wal.insert(
                    op_id.clone(),
                    WalEntryRecord {
                        op_id: op_id.clone(),
                        outcome,
                        wal_state: WalState::Pending,
                        occurred_at,
                    },
                );
            }
        }
        Ok(())
    }

    async fn finalize(&self, op_id: &OpId, terminal_state: OperationState) -> StoreResult<()> {
        if !terminal_state.is_terminal() {
            return Err(StoreError::NonTerminalFinalize(terminal_state));
        }

        let mut operations = self.operations.write().await;
        let record = operations
            .get_mut(op_id)
            .ok_or_else(|| StoreError::OperationNotFound(op_id.clone()))?;

        if record.current_state.is_terminal() {
            // Idempotent: a second finalize (or a losing concurrent race)
            // on an already-terminal operation is a successful no-op (I1).
            debug!(%op_id, state = ?record.current_state, "finalize on already-terminal operation is a no-op");
            return Ok(());
        }

        record.current_state = terminal_state;
        record.version += 1;
        record.updated_at = now_millis();
        drop(operations);

        let mut wal = self.wal.write().await;
        match wal.get_mut(op_id) {
            Some(entry) => entry.wal_state = WalState::Completed,
            None => return Err(StoreError::WalEntryNotFound(op_id.clone())),
        }
        Ok(())
    }

    async fn scan_wa(&self, wal_state: WalState, batch_size: usize) -> StoreResult<Vec<OpId>> {
        let wal = self.wal.read().await;
        let mut matching: Vec<&WalEntryRecord> = wal
            .values()
            .filter(|entry| entry.wal_state == wal_state)
            .collect();
        matching.sort_by_key(|entry| entry.occurred_at);
        Ok(matching
            .into_iter()
            .take(batch_size)
            .map(|entry| entry.op_id.clone())
            .collect())
    }

    async fn get_write_ahead_outcome(&self, op_id: &OpId) -> StoreResult<Outcome> {
        self.wal
            .read()
            .await
            .get(op_id)
            .map(|entry| entry.outcome.clone())
            .ok_or_else(|| StoreError::WalEntryNotFound(op_id.clone()))
    }

    async fn scan_in_progress(
        &self,
        timeout_threshold_millis: i64,
        batch_size: usize,
    ) -> StoreResult<Vec<OpId>> {
        let operations = self.operations.read().await;
        let envelopes = self.envelopes.read().await;
        let now = now_millis();

        let mut stuck: Vec<(OpId, i64)> = operations
            .values()
            .filter(|record| record.current_state == OperationState::InProgress)
            .filter_map(|record| {
                let accepted_at = envelopes.get(&record.op_id)?.accepted_at;
                if now - accepted_at > timeout_threshold_millis {
                    Some((record.op_id.clone(), accepted_at))
                } else {
                    None
                }
            })
            .collect();

        stuck.sort_by_key(|(_, accepted_at)| *accepted_at);
        Ok(stuck
            .into_iter()
            .take(batch_size)
            .map(|(op_id, _)| op_id)
            .collect())
    }

    async fn get_envelope(&self, op_id: &OpId) -> StoreResult<EnvelopeRecord> {
        self.envelopes
            .read()
            .await
            .get(op_id)
            .cloned()
            .ok_or_else(|| StoreError::EnvelopeNotFound(op_id.clone()))
    }

    async fn get_state(&self, op_id: &OpId) -> StoreResult<OperationState> {
        self.operations
            .read()
            .await
            .get(op_id)
            .map(|record| record.current_state)
            .ok_or_else(|| StoreError::OperationNotFound(op_id.clone()))
    }

    async fn get_wal_entry(&self, op_id: &OpId) -> StoreResult<Option<WalEntryRecord>> {
        Ok(self.wal.read().await.get(op_id).cloned())
    }

    async fn find_op_id(&self, idempotency_key: &IdempotencyKey) -> StoreResult<Option<OpId>> {
        Ok(self
            .idempotency_index
            .read()
            .await
            .get(idempotency_key)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opflow_types::{BizKey, Command, Domain, EventType, IdemKey};

    fn sample_envelope(op_id: OpId) -> (IdempotencyKey, Envelope) {
        let cmd = Command::new(
            Domain::parse("ORDER").unwrap(),
            EventType::parse("CREATE").unwrap(),
            BizKey::parse("o-1").unwrap(),
            IdemKey::parse("k-1").unwrap(),
            None,
        );
        let key = cmd.idempotency_key();
        let envelope = Envelope::new(op_id, cmd, 0).unwrap();
        (key, envelope)
    }

    #[tokio::test]
    async fn create_then_finalize_happy_path() {
        let store = MemoryStore::new();
        let op_id = OpId::generate();
        let (key, envelope) = sample_envelope(op_id.clone());

        store.create_if_absent(&op_id, &key, &envelope).await.unwrap();
        assert_eq!(store.get_state(&op_id).await.unwrap(), OperationState::Pending);

        store.mark_in_progress(&op_id).await.unwrap();
        assert_eq!(store.get_state(&op_id).await.unwrap(), OperationState::InProgress);

        store.write_ahead(&op_id, Outcome::ok(op_id.clone())).await.unwrap();
        let wal_entry = store.get_wal_entry(&op_id).await.unwrap().unwrap();
        assert_eq!(wal_entry.wal_state, WalState::Pending);

        store.finalize(&op_id, OperationState::Completed).await.unwrap();
        assert_eq!(store.get_state(&op_id).await.unwrap(), OperationState::Completed);
        let wal_entry = store.get_wal_entry(&op_id).await.unwrap().unwrap();
        assert_eq!(wal_entry.wal_state, WalState::Completed);
    }

    #[tokio::test]
    async fn finalize_is_idempotent_on_already_terminal() {
        let store = MemoryStore::new();
        let op_id = OpId::generate();
        let (key, envelope) = sample_envelope(op_id.clone());
        store.create_if_absent(&op_id, &key, &envelope).await.unwrap();
        store.mark_in_progress(&op_id).await.unwrap();
        store.write_ahead(&op_id, Outcome::ok(op_id.clone())).await.unwrap();

        store.finalize(&op_id, OperationState::Completed).await.unwrap();
        // Second finalize call: no-op success, not an error.
        store.finalize(&op_id, OperationState::Completed).await.unwrap();
        assert_eq!(store.get_state(&op_id).await.unwrap(), OperationState::Completed);
    }

    #[tokio::test]
    async fn finalize_rejects_non_terminal_target() {
        let store = MemoryStore::new();
        let op_id = OpId::generate();
        let (key, envelope) = sample_envelope(op_id.clone());
        store.create_if_absent(&op_id, &key, &envelope).await.unwrap();

        let err = store
            .finalize(&op_id, OperationState::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NonTerminalFinalize(_)));
    }

    #[tokio::test]
    async fn scan_wa_orders_by_occurred_at() {
        let store = MemoryStore::new();
        let mut ids = vec![];
        for i in 0..3 {
            let op_id = OpId::generate();
            let (key, envelope) = sample_envelope(op_id.clone());
            store.create_if_absent(&op_id, &key, &envelope).await.unwrap();
            store.write_ahead(&op_id, Outcome::ok(op_id.clone())).await.unwrap();
            ids.push(op_id);
            let _ = i;
        }

        let scanned = store.scan_wa(WalState::Pending, 10).await.unwrap();
        assert_eq!(scanned.len(), 3);
    }

    #[tokio::test]
    async fn scan_in_progress_respects_threshold() {
        let store = MemoryStore::new();
        let op_id = OpId::generate();
        let cmd = Command::new(
            Domain::parse("ORDER").unwrap(),
            EventType::parse("CREATE").unwrap(),
            BizKey::parse("o-1").unwrap(),
            IdemKey::parse("k-1").unwrap(),
            None,
        );
        let key = cmd.idempotency_key();
        let old_accepted_at = now_millis() - 10_000;
        let envelope = Envelope::new(op_id.clone(), cmd, old_accepted_at).unwrap();
        store.create_if_absent(&op_id, &key, &envelope).await.unwrap();
        store.mark_in_progress(&op_id).await.unwrap();

        let stuck = store.scan_in_progress(5_000, 10).await.unwrap();
        assert_eq!(stuck, vec![op_id.clone()]);

        let not_stuck = store.scan_in_progress(20_000, 10).await.unwrap();
        assert!(not_stuck.is_empty());
    }

    #[tokio::test]
    async fn find_op_id_resolves_existing_key() {
        let store = MemoryStore::new();
        let op_id = OpId::generate();
        let (key, envelope) = sample_envelope(op_id.clone());
        store.create_if_absent(&op_id, &key, &envelope).await.unwrap();

        assert_eq!(store.find_op_id(&key).await.unwrap(), Some(op_id));
    }
}
