#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **opflow-protection** – Protection pipeline for opflow.
//!
//! Implements §4.7 of the engine specification: a fixed-order chain of
//! pluggable guards — [`TimeoutPolicy`], [`CircuitBreaker`], [`Bulkhead`],
//! [`RateLimiter`] — wrapping every Executor invocation, plus an optional
//! [`HedgePolicy`] managed *within* the Executor wrapper rather than in
//! series with the other guards. Each guard has a `NoOp` implementation
//! that disables it and is scoped per resource key.
//!
//! Guards never throw: a short-circuiting guard produces a `Fail` or
//! `Retry` [`opflow_types::Outcome`] directly (`CB_OPEN`, `BULKHEAD_FULL`,
//! `RATE_LIMITED`), matching the spec's failure-semantics requirement that
//! guard decisions flow through the same Outcome channel as the Executor.

mod bulkhead;
mod chain;
mod circuit_breaker;
mod hedge;
mod rate_limiter;
mod timeout;

pub use bulkhead::{Bulkhead, BulkheadConfig, NoOpBulkhead, SemaphoreBulkhead};
pub use chain::ProtectionChain;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, NoOpCircuitBreaker,
    SlidingWindowCircuitBreaker,
};
pub use hedge::{HedgeConfig, HedgePolicy, NoOpHedgePolicy, RacingHedgePolicy};
pub use rate_limiter::{NoOpRateLimiter, RateLimiter, RateLimiterConfig, TokenBucketRateLimiter};
pub use timeout::{ExpiryAction, FixedTimeout, NoOpTimeout, TimeoutConfig, TimeoutPolicy};

use std::sync::Arc;

use futures::future::BoxFuture;

use opflow_types::Outcome;

/// A reusable, cloneable factory producing a fresh boxed future each time
/// it is invoked. Guards call this (possibly more than once, as
/// [`HedgePolicy`] does) rather than consuming a single in-flight future.
pub type CallFactory = Arc<dyn Fn() -> BoxFuture<'static, Outcome> + Send + Sync>;

/// Identifies the resource (typically a `Domain`/`EventType` pair, or a
/// provider name) a guard's process-local state is scoped to.
pub type ResourceKey = str;

#[cfg(test)]
mod tests {
    use super::*;
    use opflow_types::OpId;

    fn ok_factory() -> CallFactory {
        Arc::new(|| Box::pin(async { Outcome::ok(OpId::generate()) }))
    }

    #[tokio::test]
    async fn noop_chain_passes_through() {
        let chain = ProtectionChain::noop();
        let outcome = chain.execute("res", ok_factory()).await;
        assert!(outcome.is_ok());
    }
}
