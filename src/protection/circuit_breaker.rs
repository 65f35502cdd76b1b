//! Circuit breaker for a single provider.
//!
//! Three states:
//!
//! - **Closed**: normal operation, requests are allowed through.
//! - **Open**: the provider is failing, requests are rejected immediately.
//! - **HalfOpen**: probing recovery with a limited number of requests.
//!
//! State is in-memory and resets on restart.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};

/// Rejection returned when the circuit is open. Downcastable from the
/// `anyhow::Error` surfaced by [`CircuitBreaker::execute`].
#[derive(Debug, Error, PartialEq, Eq)]
#[error("circuit breaker is open")]
pub struct CircuitOpenError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long to reject requests before probing recovery.
    pub recovery_timeout: Duration,
    /// Probe successes needed to close the circuit from HalfOpen.
    pub half_open_retries: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_retries: 2,
        }
    }
}

#[derive(Debug)]
struct Inner {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    half_open_successes: u32,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
}

/// Snapshot of breaker state for metrics and event emission.
#[derive(Clone, Debug)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_successes: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Circuit breaker guarding calls to one provider.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                config,
                state: CircuitState::Closed,
                failure_count: 0,
                half_open_successes: 0,
                last_failure: None,
                last_success: None,
                next_retry_at: None,
            }),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Lock the state, recovering from poison. Slightly stale breaker state
    /// beats a panic cascade.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("circuit breaker mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Whether a request may proceed right now.
    ///
    /// Inspecting an Open circuit after its retry time transitions it to
    /// HalfOpen and admits the probe.
    pub fn is_allowed(&self) -> bool {
        let now = self.clock.now();
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let due = inner.next_retry_at.is_some_and(|at| now >= at);
                if due {
                    info!("circuit breaker transitioning Open -> HalfOpen");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.last_success = Some(now);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                debug!(
                    successes = inner.half_open_successes,
                    needed = inner.config.half_open_retries,
                    "circuit breaker probe succeeded"
                );
                if inner.half_open_successes >= inner.config.half_open_retries {
                    info!("circuit breaker closing after successful probes");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.half_open_successes = 0;
                    inner.next_retry_at = None;
                }
            }
            CircuitState::Open => {
                debug!("unexpected success while circuit open");
            }
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(now);

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= inner.config.failure_threshold {
                    info!(
                        failures = inner.failure_count,
                        "circuit breaker opening after consecutive failures"
                    );
                    inner.state = CircuitState::Open;
                    inner.next_retry_at =
                        Some(now + chrono::Duration::from_std(inner.config.recovery_timeout)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60)));
                } else {
                    debug!(
                        failures = inner.failure_count,
                        threshold = inner.config.failure_threshold,
                        "circuit breaker recorded failure"
                    );
                }
            }
            CircuitState::HalfOpen => {
                info!("circuit breaker reopening after failed probe");
                inner.state = CircuitState::Open;
                inner.half_open_successes = 0;
                inner.next_retry_at =
                    Some(now + chrono::Duration::from_std(inner.config.recovery_timeout)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60)));
            }
            CircuitState::Open => {
                inner.next_retry_at =
                    Some(now + chrono::Duration::from_std(inner.config.recovery_timeout)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60)));
            }
        }
    }

    /// Run `f` under breaker protection: check admission, execute, record
    /// the outcome. Rejection surfaces as [`CircuitOpenError`].
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.is_allowed() {
            return Err(CircuitOpenError.into());
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Return to Closed with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.half_open_successes = 0;
        inner.last_failure = None;
        inner.last_success = None;
        inner.next_retry_at = None;
    }

    pub fn update_config(&self, config: CircuitBreakerConfig) {
        let mut inner = self.lock();
        inner.config = config;
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.lock();
        CircuitStats {
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_successes: inner.half_open_successes,
            last_failure: inner.last_failure,
            last_success: inner.last_success,
            next_retry_at: inner.next_retry_at,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
