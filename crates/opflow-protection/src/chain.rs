//! The fixed-order Protection chain composing all guards (§4.7).

use std::sync::Arc;

use opflow_types::Outcome;

use crate::{
    bulkhead::{Bulkhead, NoOpBulkhead},
    circuit_breaker::{CircuitBreaker, NoOpCircuitBreaker},
    hedge::{HedgePolicy, NoOpHedgePolicy},
    rate_limiter::{NoOpRateLimiter, RateLimiter},
    timeout::{NoOpTimeout, TimeoutPolicy},
    CallFactory, ResourceKey,
};

/// Wraps every Executor invocation in the fixed-order chain:
/// `Timeout -> CircuitBreaker -> Bulkhead -> RateLimiter -> (Hedge ->) Executor`.
///
/// `HedgePolicy` is applied innermost, around the raw call, rather than as a
/// chain stage in series with the other guards — a hedge attempt still
/// counts as a single logical call against the breaker/bulkhead/limiter.
#[derive(Clone)]
pub struct ProtectionChain {
    timeout: Arc<dyn TimeoutPolicy>,
    circuit_breaker: Arc<dyn CircuitBreaker>,
    bulkhead: Arc<dyn Bulkhead>,
    rate_limiter: Arc<dyn RateLimiter>,
    hedge: Arc<dyn HedgePolicy>,
}

impl ProtectionChain {
    /// Construct a chain from explicit guard implementations.
    pub fn new(
        timeout: Arc<dyn TimeoutPolicy>,
        circuit_breaker: Arc<dyn CircuitBreaker>,
        bulkhead: Arc<dyn Bulkhead>,
        rate_limiter: Arc<dyn RateLimiter>,
        hedge: Arc<dyn HedgePolicy>,
    ) -> Self {
        Self {
            timeout,
            circuit_breaker,
            bulkhead,
            rate_limiter,
            hedge,
        }
    }

    /// A chain of every guard disabled — all calls pass straight through.
    /// Used as the default when a deployment doesn't need resilience
    /// policies, or in tests.
    pub fn noop() -> Self {
        Self::new(
            Arc::new(NoOpTimeout),
            Arc::new(NoOpCircuitBreaker),
            Arc::new(NoOpBulkhead),
            Arc::new(NoOpRateLimiter),
            Arc::new(NoOpHedgePolicy),
        )
    }

    /// Run `call` through the full chain, scoped to `resource_key`.
    pub async fn execute(&self, resource_key: &ResourceKey, call: CallFactory) -> Outcome {
        let hedge = self.hedge.clone();
        let hedged_call: CallFactory = {
            let resource_key = resource_key.to_string();
            Arc::new(move || {
                let hedge = hedge.clone();
                let call = call.clone();
                let resource_key = resource_key.clone();
                Box::pin(async move { hedge.run(&resource_key, call).await })
            })
        };

        let rate_limiter = self.rate_limiter.clone();
        let rate_limited_call: CallFactory = {
            let resource_key = resource_key.to_string();
            Arc::new(move || {
                let rate_limiter = rate_limiter.clone();
                let call = hedged_call.clone();
                let resource_key = resource_key.clone();
                Box::pin(async move { rate_limiter.run(&resource_key, call).await })
            })
        };

        let bulkhead = self.bulkhead.clone();
        let bulkheaded_call: CallFactory = {
            let resource_key = resource_key.to_string();
            Arc::new(move || {
                let bulkhead = bulkhead.clone();
                let call = rate_limited_call.clone();
                let resource_key = resource_key.clone();
                Box::pin(async move { bulkhead.run(&resource_key, call).await })
            })
        };

        let circuit_breaker = self.circuit_breaker.clone();
        let breakered_call: CallFactory = {
            let resource_key = resource_key.to_string();
            Arc::new(move || {
                let circuit_breaker = circuit_breaker.clone();
                let call = bulkheaded_call.clone();
                let resource_key = resource_key.clone();
                Box::pin(async move { circuit_breaker.run(&resource_key, call).await })
            })
        };

        self.timeout.run(resource_key, breakered_call).await
    }
}
