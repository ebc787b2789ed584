//! Bulkhead guard (§4.7 order 3): caps concurrent in-flight calls per resource key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::warn;

use opflow_types::Outcome;

use crate::{CallFactory, ResourceKey};

/// Configuration for [`SemaphoreBulkhead`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BulkheadConfig {
    /// Maximum number of concurrent in-flight calls per resource key.
    pub max_concurrent: usize,
    /// Maximum time to wait for a free slot before failing fast, in milliseconds.
    pub max_wait_ms: u64,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 16,
            max_wait_ms: 0,
        }
    }
}

/// Limits concurrent Executor calls for a resource key.
#[async_trait]
pub trait Bulkhead: Send + Sync {
    /// Run `call` under this bulkhead, scoped to `resource_key`.
    async fn run(&self, resource_key: &ResourceKey, call: CallFactory) -> Outcome;
}

/// Disables the guard: concurrency is unbounded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpBulkhead;

#[async_trait]
impl Bulkhead for NoOpBulkhead {
    async fn run(&self, _resource_key: &ResourceKey, call: CallFactory) -> Outcome {
        call().await
    }
}

/// A `tokio::sync::Semaphore` per resource key, initialized lazily.
pub struct SemaphoreBulkhead {
    config: BulkheadConfig,
    semaphores: Arc<DashMap<String, Arc<Semaphore>>>,
}

impl SemaphoreBulkhead {
    /// Construct a new bulkhead from `config`.
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            config,
            semaphores: Arc::new(DashMap::new()),
        }
    }

    fn semaphore_for(&self, resource_key: &str) -> Arc<Semaphore> {
        self.semaphores
            .entry(resource_key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_concurrent)))
            .clone()
    }
}

#[async_trait]
impl Bulkhead for SemaphoreBulkhead {
    async fn run(&self, resource_key: &ResourceKey, call: CallFactory) -> Outcome {
        let semaphore = self.semaphore_for(resource_key);

        let permit = if self.config.max_wait_ms == 0 {
            semaphore.try_acquire().ok()
        } else {
            tokio::time::timeout(
                Duration::from_millis(self.config.max_wait_ms),
                semaphore.acquire(),
            )
            .await
            .ok()
            .and_then(|res| res.ok())
        };

        match permit {
            Some(_permit) => call().await,
            None => {
                warn!(resource_key, "bulkhead full, failing fast");
                Outcome::fail("BULKHEAD_FULL", "no bulkhead capacity available for this resource")
            }
        }
    }
}
