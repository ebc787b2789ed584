//! CircuitBreaker guard (§4.7 order 2): `CLOSED -> OPEN -> HALF_OPEN -> CLOSED`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use opflow_types::Outcome;

use crate::{CallFactory, ResourceKey};

/// Externally observable circuit state for a single resource key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls pass through normally; failures are counted in the sliding window.
    Closed,
    /// Calls are short-circuited with `Fail("CB_OPEN")` until the cool-off elapses.
    Open,
    /// A limited number of probe calls are admitted to decide `Closed` vs `Open`.
    HalfOpen,
}

/// Configuration for [`SlidingWindowCircuitBreaker`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failure ratio (0-100) over the sliding window that trips the breaker.
    pub failure_rate_threshold: u8,
    /// Number of most-recent call outcomes retained per resource key.
    pub sliding_window_size: usize,
    /// Minimum number of calls recorded before the failure ratio is evaluated.
    pub minimum_calls: usize,
    /// How long the breaker stays `Open` before admitting probes, in milliseconds.
    pub wait_duration_in_open_ms: u64,
    /// Number of probe calls permitted while `HalfOpen`.
    pub permitted_calls_in_half_open: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50,
            sliding_window_size: 20,
            minimum_calls: 10,
            wait_duration_in_open_ms: 30_000,
            permitted_calls_in_half_open: 3,
        }
    }
}

struct BreakerState {
    state: CircuitState,
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_probes_remaining: usize,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            opened_at: None,
            half_open_probes_remaining: 0,
        }
    }

    fn record(&mut self, config: &CircuitBreakerConfig, success: bool) {
        self.window.push_back(success);
        while self.window.len() > config.sliding_window_size {
            self.window.pop_front();
        }
    }

    fn failure_rate(&self) -> u8 {
        if self.window.is_empty() {
            return 0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        ((failures * 100) / self.window.len()) as u8
    }
}

/// Gates Executor calls on a per-resource-key failure-ratio state machine.
#[async_trait]
pub trait CircuitBreaker: Send + Sync {
    /// Run `call` under this breaker, scoped to `resource_key`.
    async fn run(&self, resource_key: &ResourceKey, call: CallFactory) -> Outcome;
}

/// Disables the guard: the circuit never opens.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpCircuitBreaker;

#[async_trait]
impl CircuitBreaker for NoOpCircuitBreaker {
    async fn run(&self, _resource_key: &ResourceKey, call: CallFactory) -> Outcome {
        call().await
    }
}

/// Sliding-window failure-ratio circuit breaker, one state machine per
/// resource key, initialized lazily.
pub struct SlidingWindowCircuitBreaker {
    config: CircuitBreakerConfig,
    states: Arc<DashMap<String, Arc<Mutex<BreakerState>>>>,
}

impl SlidingWindowCircuitBreaker {
    /// Construct a new breaker from `config`.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: Arc::new(DashMap::new()),
        }
    }

    /// Current [`CircuitState`] for `resource_key`, `Closed` if unseen.
    pub async fn state_of(&self, resource_key: &str) -> CircuitState {
        match self.states.get(resource_key) {
            Some(entry) => entry.clone().lock().await.state,
            None => CircuitState::Closed,
        }
    }

    fn state_for(&self, resource_key: &str) -> Arc<Mutex<BreakerState>> {
        self.states
            .entry(resource_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BreakerState::new())))
            .clone()
    }
}

#[async_trait]
impl CircuitBreaker for SlidingWindowCircuitBreaker {
    async fn run(&self, resource_key: &ResourceKey, call: CallFactory) -> Outcome {
        // Clone the per-key Arc<Mutex<_>> out of the DashMap before locking so
        // the dashmap shard lock is never held across the Executor call.
        let state = self.state_for(resource_key);
        let mut guard = state.lock().await;

        match guard.state {
            CircuitState::Open => {
                let opened_at = guard.opened_at.unwrap_or_else(Instant::now);
                if opened_at.elapsed() >= Duration::from_millis(self.config.wait_duration_in_open_ms)
                {
                    info!(resource_key, "circuit breaker cooling-off elapsed, transitioning to half-open");
                    guard.state = CircuitState::HalfOpen;
                    guard.half_open_probes_remaining = self.config.permitted_calls_in_half_open;
                } else {
                    return Outcome::fail("CB_OPEN", "circuit breaker is open for this resource");
                }
            }
            CircuitState::HalfOpen => {
                if guard.half_open_probes_remaining == 0 {
                    return Outcome::fail("CB_OPEN", "circuit breaker half-open probe budget exhausted");
                }
                guard.half_open_probes_remaining -= 1;
            }
            CircuitState::Closed => {}
        }
        drop(guard);

        let outcome = call().await;
        // Retry is a transient failure (§3/§7), not a success: folding it into
        // the success side would let a flaky, always-retrying dependency hide
        // from the failure-ratio window.
        let success = outcome.is_ok();

        let mut guard = state.lock().await;
        match guard.state {
            CircuitState::HalfOpen => {
                if success {
                    if guard.half_open_probes_remaining == 0 {
                        debug!(resource_key, "half-open probes succeeded, closing circuit");
                        guard.state = CircuitState::Closed;
                        guard.window.clear();
                        guard.opened_at = None;
                    }
                } else {
                    warn!(resource_key, "half-open probe failed, reopening circuit");
                    guard.state = CircuitState::Open;
                    guard.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Closed => {
                guard.record(&self.config, success);
                if guard.window.len() >= self.config.minimum_calls
                    && guard.failure_rate() >= self.config.failure_rate_threshold
                {
                    warn!(resource_key, failure_rate = guard.failure_rate(), "tripping circuit breaker to open");
                    guard.state = CircuitState::Open;
                    guard.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }

        outcome
    }
}
