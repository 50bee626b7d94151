//! Per-upstream circuit breakers
//!
//! One breaker per distinct upstream target, held in a registry owned by the
//! proxy service for the process lifetime. State transitions:
//! Closed --threshold failures--> Open --reset timeout--> HalfOpen, which
//! admits exactly one probe call; probe success closes the circuit, probe
//! failure reopens it.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Upstream is failing, calls are rejected without a network attempt
    Open,
    /// Cooldown elapsed, a single trial call is in flight
    HalfOpen,
}

#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("circuit open for upstream '{0}'")]
    Open(String),
}

/// Breaker tuning, shared by every breaker in a registry.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a probe
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    /// Set while the single half-open probe is in flight
    probing: bool,
}

/// Circuit breaker for a single upstream target.
pub struct CircuitBreaker {
    upstream: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(upstream: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            upstream: upstream.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                probing: false,
            }),
        }
    }

    /// Ask permission to make a call. While Open, transitions to HalfOpen
    /// once the reset timeout has elapsed and admits exactly one probe.
    pub fn try_acquire(&self) -> Result<(), BreakerError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.probing = true;
                    tracing::info!(upstream = %self.upstream, "circuit half-open, admitting probe");
                    Ok(())
                } else {
                    Err(BreakerError::Open(self.upstream.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probing {
                    Err(BreakerError::Open(self.upstream.clone()))
                } else {
                    inner.probing = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call. Closes the circuit and resets the counter.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        if inner.state == CircuitState::HalfOpen {
            tracing::info!(upstream = %self.upstream, "circuit closed after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.probing = false;
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.last_failure_time = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    tracing::warn!(
                        upstream = %self.upstream,
                        failure_count = inner.failure_count,
                        threshold = self.config.failure_threshold,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.probing = false;
                tracing::warn!(upstream = %self.upstream, "probe failed, circuit reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state without mutating it (for metrics and health reporting).
    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner
            .lock()
            .expect("breaker lock poisoned")
            .failure_count
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }
}

/// Registry of breakers keyed by upstream target, constructed once at startup
/// and passed into request handlers via the proxy service.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for an upstream target.
    pub fn get(&self, upstream: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("registry lock poisoned");
        breakers
            .entry(upstream.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(upstream, self.config)))
            .clone()
    }

    /// Snapshot of all known breakers (for metrics).
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let breakers = self.breakers.lock().expect("registry lock poisoned");
        breakers
            .iter()
            .map(|(name, b)| (name.clone(), b.state()))
            .collect()
    }
}
