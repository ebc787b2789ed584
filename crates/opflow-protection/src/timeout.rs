//! TimeoutPolicy guard (§4.7 order 1): per-attempt wall-clock limit.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use opflow_types::Outcome;

use crate::{CallFactory, ResourceKey};

/// What `Outcome` to produce when a call exceeds `per_attempt_millis`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpiryAction {
    /// Produce a `Retry` outcome so the Runtime re-enqueues the envelope.
    Retry,
    /// Produce a permanent `Fail` outcome.
    Fail,
}

/// Configuration for [`FixedTimeout`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Per-attempt wall-clock budget, in milliseconds. `0` means unlimited
    /// (equivalent to [`NoOpTimeout`]).
    pub per_attempt_millis: u64,
    /// Outcome produced on expiry.
    pub on_expiry: ExpiryAction,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            per_attempt_millis: 0,
            on_expiry: ExpiryAction::Retry,
        }
    }
}

/// Imposes a per-attempt wall-clock limit on an Executor call.
#[async_trait]
pub trait TimeoutPolicy: Send + Sync {
    /// Run `call` under this policy's timeout, scoped to `resource_key`.
    async fn run(&self, resource_key: &ResourceKey, call: CallFactory) -> Outcome;
}

/// Disables the guard: runs `call` with no time limit.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpTimeout;

#[async_trait]
impl TimeoutPolicy for NoOpTimeout {
    async fn run(&self, _resource_key: &ResourceKey, call: CallFactory) -> Outcome {
        call().await
    }
}

/// Enforces [`TimeoutConfig::per_attempt_millis`] via `tokio::time::timeout`.
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeout {
    config: TimeoutConfig,
}

impl FixedTimeout {
    /// Construct a new [`FixedTimeout`] from `config`.
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TimeoutPolicy for FixedTimeout {
    async fn run(&self, resource_key: &ResourceKey, call: CallFactory) -> Outcome {
        if self.config.per_attempt_millis == 0 {
            return call().await;
        }

        let duration = std::time::Duration::from_millis(self.config.per_attempt_millis);
        match tokio::time::timeout(duration, call()).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                tracing::warn!(
                    resource_key,
                    per_attempt_millis = self.config.per_attempt_millis,
                    "executor call timed out"
                );
                match self.config.on_expiry {
                    ExpiryAction::Retry => Outcome::retry(
                        format!("timeout after {}ms", self.config.per_attempt_millis),
                        1,
                        0,
                    )
                    .expect("attempt_count=1 is always valid"),
                    ExpiryAction::Fail => {
                        Outcome::fail("TIMEOUT", "executor call exceeded per-attempt timeout")
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use opflow_types::OpId;

    use super::*;

    #[tokio::test]
    async fn noop_timeout_runs_call_unbounded() {
        let timeout = NoOpTimeout;
        let call: CallFactory = Arc::new(|| Box::pin(async { Outcome::ok(OpId::generate()) }));
        assert!(timeout.run("res", call).await.is_ok());
    }

    #[tokio::test]
    async fn fixed_timeout_fails_on_expiry() {
        let timeout = FixedTimeout::new(TimeoutConfig {
            per_attempt_millis: 10,
            on_expiry: ExpiryAction::Fail,
        });
        let call: CallFactory = Arc::new(|| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Outcome::ok(OpId::generate())
            })
        });
        let outcome = timeout.run("res", call).await;
        assert!(outcome.is_fail());
    }

    #[tokio::test]
    async fn fixed_timeout_retries_on_expiry_when_configured() {
        let timeout = FixedTimeout::new(TimeoutConfig {
            per_attempt_millis: 10,
            on_expiry: ExpiryAction::Retry,
        });
        let call: CallFactory = Arc::new(|| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Outcome::ok(OpId::generate())
            })
        });
        assert!(timeout.run("res", call).await.is_retry());
    }

    #[tokio::test]
    async fn fixed_timeout_passes_through_fast_calls() {
        let timeout = FixedTimeout::new(TimeoutConfig {
            per_attempt_millis: 500,
            on_expiry: ExpiryAction::Fail,
        });
        let call: CallFactory = Arc::new(|| Box::pin(async { Outcome::ok(OpId::generate()) }));
        assert!(timeout.run("res", call).await.is_ok());
    }
}
