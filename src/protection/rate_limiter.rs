//! Per-provider request throttling.
//!
//! Two interchangeable strategies behind one type: a token bucket (steady
//! refill with bursting up to capacity) and a sliding window (bounded count
//! of requests in the trailing minute).

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};

const WINDOW_MS: i64 = 60_000;

/// Maximum cooperative polling tick inside [`RateLimiter::wait_for_slot`].
const MAX_POLL_TICK: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitStrategy {
    TokenBucket,
    SlidingWindow,
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    /// Burst capacity. Defaults to `requests_per_minute` when unset.
    pub burst_limit: Option<u32>,
}

impl RateLimitConfig {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            burst_limit: None,
        }
    }

    pub fn with_burst_limit(mut self, burst_limit: u32) -> Self {
        self.burst_limit = Some(burst_limit);
        self
    }

    pub fn burst(&self) -> u32 {
        self.burst_limit.unwrap_or(self.requests_per_minute)
    }

    /// Token refill rate in tokens per millisecond.
    fn refill_per_ms(&self) -> f64 {
        f64::from(self.requests_per_minute) / WINDOW_MS as f64
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(60)
    }
}

#[derive(Debug)]
enum State {
    TokenBucket {
        tokens: f64,
        last_refill: DateTime<Utc>,
    },
    SlidingWindow {
        timestamps: VecDeque<DateTime<Utc>>,
    },
}

#[derive(Debug)]
struct Inner {
    config: RateLimitConfig,
    state: State,
}

/// Throttle for calls to one provider.
pub struct RateLimiter {
    inner: Mutex<Inner>,
    strategy: RateLimitStrategy,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn token_bucket(config: RateLimitConfig) -> Self {
        Self::new(RateLimitStrategy::TokenBucket, config)
    }

    pub fn sliding_window(config: RateLimitConfig) -> Self {
        Self::new(RateLimitStrategy::SlidingWindow, config)
    }

    pub fn new(strategy: RateLimitStrategy, config: RateLimitConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let state = Self::fresh_state(strategy, &config, clock.now());
        Self {
            inner: Mutex::new(Inner { config, state }),
            strategy,
            clock,
        }
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        let strategy = self.strategy;
        let config = self.lock().config.clone();
        let state = Self::fresh_state(strategy, &config, clock.now());
        Self {
            inner: Mutex::new(Inner { config, state }),
            strategy,
            clock,
        }
    }

    fn fresh_state(
        strategy: RateLimitStrategy,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> State {
        match strategy {
            RateLimitStrategy::TokenBucket => State::TokenBucket {
                tokens: f64::from(config.burst()),
                last_refill: now,
            },
            RateLimitStrategy::SlidingWindow => State::SlidingWindow {
                timestamps: VecDeque::new(),
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("rate limiter mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn strategy(&self) -> RateLimitStrategy {
        self.strategy
    }

    /// Non-blocking admission check. Consumes a slot when admitted.
    pub fn allow_request(&self) -> bool {
        let now = self.clock.now();
        let mut inner = self.lock();
        let burst = inner.config.burst();
        let refill = inner.config.refill_per_ms();

        match &mut inner.state {
            State::TokenBucket {
                tokens,
                last_refill,
            } => {
                let elapsed_ms = (now - *last_refill).num_milliseconds().max(0) as f64;
                *tokens = (*tokens + elapsed_ms * refill).min(f64::from(burst));
                *last_refill = now;

                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    true
                } else {
                    false
                }
            }
            State::SlidingWindow { timestamps } => {
                let cutoff = now - chrono::Duration::milliseconds(WINDOW_MS);
                while timestamps.front().is_some_and(|t| *t <= cutoff) {
                    timestamps.pop_front();
                }

                if (timestamps.len() as u32) < burst {
                    timestamps.push_back(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// How long until the next request could be admitted.
    pub fn time_until_available(&self) -> Duration {
        let now = self.clock.now();
        let mut inner = self.lock();
        let burst = inner.config.burst();
        let refill = inner.config.refill_per_ms();

        match &mut inner.state {
            State::TokenBucket {
                tokens,
                last_refill,
            } => {
                let elapsed_ms = (now - *last_refill).num_milliseconds().max(0) as f64;
                *tokens = (*tokens + elapsed_ms * refill).min(f64::from(burst));
                *last_refill = now;

                if *tokens >= 1.0 || refill <= 0.0 {
                    Duration::ZERO
                } else {
                    let needed = 1.0 - *tokens;
                    Duration::from_millis((needed / refill).ceil() as u64)
                }
            }
            State::SlidingWindow { timestamps } => {
                let cutoff = now - chrono::Duration::milliseconds(WINDOW_MS);
                while timestamps.front().is_some_and(|t| *t <= cutoff) {
                    timestamps.pop_front();
                }

                if (timestamps.len() as u32) < burst {
                    Duration::ZERO
                } else {
                    match timestamps.front() {
                        Some(oldest) => {
                            let expires = *oldest + chrono::Duration::milliseconds(WINDOW_MS);
                            (expires - now)
                                .to_std()
                                .unwrap_or(Duration::ZERO)
                        }
                        None => Duration::ZERO,
                    }
                }
            }
        }
    }

    /// Block cooperatively until a slot is admitted, polling on ticks of at
    /// most 100 ms so the scheduler is never held hostage.
    pub async fn wait_for_slot(&self) {
        loop {
            if self.allow_request() {
                return;
            }

            let wait = self
                .time_until_available()
                .clamp(Duration::from_millis(1), MAX_POLL_TICK);
            debug!(wait_ms = wait.as_millis() as u64, "rate limited, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Wait for admission, then run `f`.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.wait_for_slot().await;
        f().await
    }

    /// Clear accumulated state: a full bucket, an empty window.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.state = Self::fresh_state(self.strategy, &inner.config, now);
    }

    /// Swap limits. Accumulated state is cleared, as with [`reset`](Self::reset).
    pub fn update_config(&self, config: RateLimitConfig) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.state = Self::fresh_state(self.strategy, &config, now);
        inner.config = config;
    }

    pub fn config(&self) -> RateLimitConfig {
        self.lock().config.clone()
    }
}
