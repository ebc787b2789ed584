//! RateLimiter guard (§4.7 order 4): admits at most R calls per window.
//!
//! The token-bucket refill/consume arithmetic is grounded on the teacher's
//! `toka-rate-limiter::algorithms::TokenBucketLimiter`, generalized from an
//! HTTP-auth rate limiter keyed by IP/user into a resource-key-scoped guard
//! that produces an [`Outcome`] instead of an HTTP-facing `RateLimitResult`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use opflow_types::Outcome;

use crate::{CallFactory, ResourceKey};

/// Configuration for [`TokenBucketRateLimiter`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Sustained permits admitted per second.
    pub permits_per_second: f64,
    /// Maximum burst capacity of the token bucket.
    pub max_burst: u64,
    /// Maximum time to wait for a permit before failing fast, in milliseconds.
    pub acquire_timeout_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            permits_per_second: 50.0,
            max_burst: 50,
            acquire_timeout_ms: 0,
        }
    }
}

struct TokenBucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    fn new(capacity: u64) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: Utc::now(),
        }
    }

    fn refill(&mut self, config: &RateLimiterConfig) {
        let now = Utc::now();
        let elapsed_seconds = (now - self.last_refill).num_milliseconds() as f64 / 1000.0;
        let replenished = elapsed_seconds * config.permits_per_second;
        self.tokens = (self.tokens + replenished).min(config.max_burst as f64);
        self.last_refill = now;
    }

    fn try_consume(&mut self, config: &RateLimiterConfig) -> bool {
        self.refill(config);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn millis_until_available(&self, config: &RateLimiterConfig) -> u64 {
        if self.tokens >= 1.0 || config.permits_per_second <= 0.0 {
            return 0;
        }
        let seconds_needed = (1.0 - self.tokens) / config.permits_per_second;
        (seconds_needed * 1000.0).ceil() as u64
    }
}

/// Admits at most `permits_per_second` calls per resource key.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Run `call` under this limiter, scoped to `resource_key`.
    async fn run(&self, resource_key: &ResourceKey, call: CallFactory) -> Outcome;
}

/// Disables the guard: every call is admitted immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpRateLimiter;

#[async_trait]
impl RateLimiter for NoOpRateLimiter {
    async fn run(&self, _resource_key: &ResourceKey, call: CallFactory) -> Outcome {
        call().await
    }
}

/// A token bucket per resource key, initialized lazily.
pub struct TokenBucketRateLimiter {
    config: RateLimiterConfig,
    buckets: Arc<DashMap<String, Arc<Mutex<TokenBucket>>>>,
}

impl TokenBucketRateLimiter {
    /// Construct a new limiter from `config`.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: Arc::new(DashMap::new()),
        }
    }

    fn bucket_for(&self, resource_key: &str) -> Arc<Mutex<TokenBucket>> {
        self.buckets
            .entry(resource_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(self.config.max_burst))))
            .clone()
    }
}

#[async_trait]
impl RateLimiter for TokenBucketRateLimiter {
    async fn run(&self, resource_key: &ResourceKey, call: CallFactory) -> Outcome {
        // Clone the per-key Arc<Mutex<_>> out of the DashMap so the shard
        // lock is never held across the sleep/Executor-call below.
        let bucket = self.bucket_for(resource_key);

        loop {
            let wait_millis = {
                let mut bucket = bucket.lock().await;
                if bucket.try_consume(&self.config) {
                    0
                } else {
                    bucket.millis_until_available(&self.config)
                }
            };

            if wait_millis == 0 {
                return call().await;
            }

            if self.config.acquire_timeout_ms == 0 || wait_millis > self.config.acquire_timeout_ms
            {
                debug!(resource_key, wait_millis, "rate limit exceeded, failing fast");
                return Outcome::fail("RATE_LIMITED", "rate limit exceeded for this resource");
            }

            tokio::time::sleep(Duration::from_millis(wait_millis)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use opflow_types::OpId;

    use super::*;

    fn ok_call() -> CallFactory {
        Arc::new(|| Box::pin(async { Outcome::ok(OpId::generate()) }))
    }

    #[tokio::test]
    async fn admits_calls_within_burst() {
        let limiter = TokenBucketRateLimiter::new(RateLimiterConfig {
            permits_per_second: 1.0,
            max_burst: 3,
            acquire_timeout_ms: 0,
        });
        for _ in 0..3 {
            assert!(limiter.run("res", ok_call()).await.is_ok());
        }
    }

    #[tokio::test]
    async fn fails_fast_once_burst_exhausted() {
        let limiter = TokenBucketRateLimiter::new(RateLimiterConfig {
            permits_per_second: 0.001,
            max_burst: 1,
            acquire_timeout_ms: 0,
        });
        assert!(limiter.run("res", ok_call()).await.is_ok());
        let outcome = limiter.run("res", ok_call()).await;
        match outcome {
            Outcome::Fail { error_code, .. } => assert_eq!(error_code, "RATE_LIMITED"),
            other => panic!("expected RATE_LIMITED fail, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn independent_resource_keys_have_independent_buckets() {
        let limiter = TokenBucketRateLimiter::new(RateLimiterConfig {
            permits_per_second: 0.001,
            max_burst: 1,
            acquire_timeout_ms: 0,
        });
        assert!(limiter.run("a", ok_call()).await.is_ok());
        assert!(limiter.run("b", ok_call()).await.is_ok());
    }
}
