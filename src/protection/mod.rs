//! Per-provider failure isolation: circuit breakers and rate limiters.
//!
//! Both primitives are owned by the sync orchestrator, one pair per
//! registered provider, and are clock-injected so their time-dependent
//! behavior is deterministic under test.

mod circuit_breaker;
mod rate_limiter;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitState, CircuitStats,
};
pub use rate_limiter::{RateLimitConfig, RateLimitStrategy, RateLimiter};
