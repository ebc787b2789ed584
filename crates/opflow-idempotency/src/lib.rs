#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **opflow-idempotency** – Idempotency resolver for opflow.
//!
//! Implements §4.1 of the engine specification: the `IdempotencyKey -> OpId`
//! mapping. `get_or_create` must be race-free under concurrency (I5) and
//! must never reassign an existing key to a new `OpId`.
//!
//! Two adapters are provided, matching the two strategies §4.1 enumerates:
//! [`MemoryIdempotencyManager`] (a bare concurrent map, race-free via
//! `DashMap::entry`) and [`StoreBackedIdempotencyManager`] (durable across
//! process restarts by consulting [`opflow_store_core::Store::find_op_id`],
//! with a process-local per-key lock closing the race a plain "check then
//! insert" against the Store would otherwise leave open).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use opflow_store_core::Store;
use opflow_types::{IdempotencyKey, OpId};

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors raised by an [`IdempotencyManager`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    /// The backing storage failed while resolving a key.
    #[error("idempotency storage error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Convenience result alias for [`IdempotencyManager`] operations.
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

//─────────────────────────────
//  Port
//─────────────────────────────

/// Resolves an [`IdempotencyKey`] to a stable [`OpId`].
///
/// Implementations MUST guarantee that if `N` callers race on the same
/// unseen key, exactly one `OpId` is generated and all `N` callers observe
/// it (I5). An already-assigned key is never reassigned.
#[async_trait]
pub trait IdempotencyManager: Send + Sync {
    /// Resolve `key` to its `OpId`, generating and recording a fresh one if
    /// `key` has never been seen before.
    async fn get_or_create(&self, key: &IdempotencyKey) -> IdempotencyResult<OpId>;

    /// Resolve `key` to its `OpId` if one has already been assigned, without
    /// creating a new mapping.
    async fn find(&self, key: &IdempotencyKey) -> IdempotencyResult<Option<OpId>>;
}

//─────────────────────────────
//  In-memory adapter
//─────────────────────────────

/// Pure in-memory [`IdempotencyManager`], backed by a single `DashMap`.
///
/// Race-freedom comes directly from `DashMap`'s per-shard locking: two
/// concurrent `entry(key).or_insert_with(...)` calls on the same key
/// serialize on the same shard, so only one ever runs the `OpId::generate`
/// closure.
#[derive(Debug, Default)]
pub struct MemoryIdempotencyManager {
    map: DashMap<IdempotencyKey, OpId>,
}

impl MemoryIdempotencyManager {
    /// Create a new, empty [`MemoryIdempotencyManager`].
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyManager for MemoryIdempotencyManager {
    async fn get_or_create(&self, key: &IdempotencyKey) -> IdempotencyResult<OpId> {
        let op_id = self
            .map
            .entry(key.clone())
            .or_insert_with(OpId::generate)
            .clone();
        debug!(%key, %op_id, "resolved idempotency key (memory)");
        Ok(op_id)
    }

    async fn find(&self, key: &IdempotencyKey) -> IdempotencyResult<Option<OpId>> {
        Ok(self.map.get(key).map(|entry| entry.clone()))
    }
}

//─────────────────────────────
//  Store-backed adapter
//─────────────────────────────

/// [`IdempotencyManager`] that survives process restarts by treating the
/// [`Store`]'s `find_op_id` as the durable source of truth, with a
/// process-local per-key mutex to dedupe concurrent first-seen resolutions
/// that race ahead of the operation actually being persisted.
///
/// A local `DashMap<IdempotencyKey, OpId>` cache short-circuits the common
/// case (key already resolved in this process); consulting the Store is
/// only needed for keys unseen locally, which after a restart is every key
/// until it is first resolved again.
pub struct StoreBackedIdempotencyManager {
    store: Arc<dyn Store>,
    cache: DashMap<IdempotencyKey, OpId>,
    locks: DashMap<IdempotencyKey, Arc<Mutex<()>>>,
}

impl StoreBackedIdempotencyManager {
    /// Construct a new resolver backed by `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, key: &IdempotencyKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl IdempotencyManager for StoreBackedIdempotencyManager {
    async fn get_or_create(&self, key: &IdempotencyKey) -> IdempotencyResult<OpId> {
        if let Some(op_id) = self.cache.get(key) {
            return Ok(op_id.clone());
        }

        // Clone the per-key lock Arc out of the DashMap before locking so the
        // dashmap shard lock is never held across the Store call, matching
        // the discipline `opflow-protection`'s circuit breaker uses.
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        // Double-checked: another racer may have resolved (and cached) this
        // key while we waited for the lock.
        if let Some(op_id) = self.cache.get(key) {
            return Ok(op_id.clone());
        }

        if let Some(op_id) = self.store.find_op_id(key).await.map_err(anyhow::Error::from)? {
            self.cache.insert(key.clone(), op_id.clone());
            debug!(%key, %op_id, "resolved idempotency key (store, existing)");
            return Ok(op_id);
        }

        let op_id = OpId::generate();
        self.cache.insert(key.clone(), op_id.clone());
        debug!(%key, %op_id, "resolved idempotency key (store, newly generated)");
        Ok(op_id)
    }

    async fn find(&self, key: &IdempotencyKey) -> IdempotencyResult<Option<OpId>> {
        if let Some(op_id) = self.cache.get(key) {
            return Ok(Some(op_id.clone()));
        }
        let resolved = self
            .store
            .find_op_id(key)
            .await
            .map_err(anyhow::Error::from)?;
        if let Some(op_id) = &resolved {
            self.cache.insert(key.clone(), op_id.clone());
        }
        Ok(resolved)
    }
}


#[cfg(test)]
mod get_or_create_properties {
    use std::sync::Arc;

    use proptest::prelude::*;

    use opflow_types::{BizKey, Domain, EventType, IdemKey};

    use super::*;

    fn arb_key() -> impl Strategy<Value = IdempotencyKey> {
        ("[A-Z_]{1,8}", "[a-zA-Z0-9]{1,8}", "[a-zA-Z0-9-]{1,8}", "[a-zA-Z0-9-]{1,8}").prop_map(
            |(domain, event_type, biz_key, idem_key)| {
                IdempotencyKey::new(
                    Domain::parse(domain).unwrap(),
                    EventType::parse(event_type).unwrap(),
                    BizKey::parse(biz_key).unwrap(),
                    IdemKey::parse(idem_key).unwrap(),
                )
            },
        )
    }

    proptest! {
        /// I5: repeated `get_or_create` calls on the same key never reassign
        /// it to a different `OpId`, across arbitrary valid key shapes.
        #[test]
        fn repeated_calls_on_same_key_converge(key in arb_key()) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let manager = MemoryIdempotencyManager::new();
                let first = manager.get_or_create(&key).await.unwrap();
                let second = manager.get_or_create(&key).await.unwrap();
                prop_assert_eq!(first, second);
                Ok(())
            })?;
        }

        /// I5: `N` racing callers on the same unseen key all observe the same
        /// `OpId`, i.e. exactly one generation wins.
        #[test]
        fn concurrent_callers_on_same_key_converge(key in arb_key(), callers in 2usize..16) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let manager = Arc::new(MemoryIdempotencyManager::new());
                let mut handles = Vec::new();
                for _ in 0..callers {
                    let manager = manager.clone();
                    let key = key.clone();
                    handles.push(tokio::spawn(async move {
                        manager.get_or_create(&key).await.unwrap()
                    }));
                }
                let mut results = Vec::new();
                for handle in handles {
                    results.push(handle.await.unwrap());
                }
                prop_assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
                Ok(())
            })?;
        }
    }
}
