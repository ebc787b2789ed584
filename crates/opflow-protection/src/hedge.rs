//! HedgePolicy (§4.7): managed *within* the Executor wrapper, not in series
//! with the other guards. Launches one or more delayed hedge attempts;
//! the first response wins and the rest are abandoned.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use opflow_types::Outcome;

use crate::{CallFactory, ResourceKey};

/// Configuration for [`RacingHedgePolicy`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HedgeConfig {
    /// Whether hedging is active at all.
    pub enabled: bool,
    /// Delay before launching each subsequent hedge attempt, in milliseconds.
    pub hedge_delay_ms: u64,
    /// Maximum number of hedge attempts beyond the first.
    pub max_hedges: usize,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hedge_delay_ms: 500,
            max_hedges: 0,
        }
    }
}

/// Runs `call` with optional hedge attempts, returning the first result.
#[async_trait]
pub trait HedgePolicy: Send + Sync {
    /// Run `call` under this hedge policy, scoped to `resource_key`.
    async fn run(&self, resource_key: &ResourceKey, call: CallFactory) -> Outcome;
}

/// Disables hedging: a single attempt, no racing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHedgePolicy;

#[async_trait]
impl HedgePolicy for NoOpHedgePolicy {
    async fn run(&self, _resource_key: &ResourceKey, call: CallFactory) -> Outcome {
        call().await
    }
}

/// Launches a hedge attempt every `hedge_delay_ms` (up to `max_hedges`) if
/// the in-flight attempt(s) haven't yet resolved; the first attempt to
/// complete wins and the rest are dropped (abandoned, not cancelled — the
/// Executor contract does not guarantee cancellation of in-flight calls).
pub struct RacingHedgePolicy {
    config: HedgeConfig,
}

impl RacingHedgePolicy {
    /// Construct a new hedge policy from `config`.
    pub fn new(config: HedgeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl HedgePolicy for RacingHedgePolicy {
    async fn run(&self, resource_key: &ResourceKey, call: CallFactory) -> Outcome {
        if !self.config.enabled || self.config.max_hedges == 0 {
            return call().await;
        }

        let mut join_set: JoinSet<Outcome> = JoinSet::new();
        join_set.spawn(call());
        let mut hedges_launched = 0usize;

        loop {
            let delay = tokio::time::sleep(std::time::Duration::from_millis(self.config.hedge_delay_ms));
            tokio::select! {
                biased;
                Some(result) = join_set.join_next() => {
                    match result {
                        Ok(outcome) => {
                            tracing::debug!(resource_key, hedges_launched, "hedge race resolved");
                            return outcome;
                        }
                        Err(_join_error) => continue,
                    }
                }
                _ = delay, if hedges_launched < self.config.max_hedges => {
                    hedges_launched += 1;
                    tracing::debug!(resource_key, hedges_launched, "launching hedge attempt");
                    join_set.spawn(call());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use opflow_types::OpId;

    use super::*;

    #[tokio::test]
    async fn disabled_hedge_runs_call_once() {
        let hedge = RacingHedgePolicy::new(HedgeConfig {
            enabled: false,
            hedge_delay_ms: 10,
            max_hedges: 2,
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let call: CallFactory = Arc::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Outcome::ok(OpId::generate()) })
        });
        assert!(hedge.run("res", call).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_first_attempt_is_hedged() {
        let hedge = RacingHedgePolicy::new(HedgeConfig {
            enabled: true,
            hedge_delay_ms: 20,
            max_hedges: 1,
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let call: CallFactory = Arc::new(move || {
            let n = calls_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n == 0 {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Outcome::ok(OpId::generate())
            })
        });
        let outcome = hedge.run("res", call).await;
        assert!(outcome.is_ok());
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }
}
