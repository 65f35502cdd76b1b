use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::duration::deserialize_duration;
use crate::protection::{CircuitBreakerConfig, RateLimitConfig};

fn default_reporting_currency() -> String {
    "USD".to_string()
}

/// Default portfolio cache freshness (5 minutes).
fn default_cache_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Default price cache freshness (1 minute).
fn default_price_cache_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_half_open_retries() -> u32 {
    2
}

/// Per-provider rate-limit settings as declared in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_limit: Option<u32>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            burst_limit: None,
        }
    }
}

impl From<RateLimitSettings> for RateLimitConfig {
    fn from(settings: RateLimitSettings) -> Self {
        let config = RateLimitConfig::new(settings.requests_per_minute);
        match settings.burst_limit {
            Some(burst) => config.with_burst_limit(burst),
            None => config,
        }
    }
}

/// Per-provider circuit-breaker settings as declared in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(
        default = "default_recovery_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub recovery_timeout: Duration,
    #[serde(default = "default_half_open_retries")]
    pub half_open_retries: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
            half_open_retries: default_half_open_retries(),
        }
    }
}

impl From<CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            recovery_timeout: settings.recovery_timeout,
            half_open_retries: settings.half_open_retries,
        }
    }
}

/// Host-facing configuration knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How long a persisted portfolio stays fresh for cache hits.
    #[serde(
        default = "default_cache_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub cache_ttl: Duration,

    /// How long a fetched price is served from the valuator cache.
    #[serde(
        default = "default_price_cache_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub price_cache_ttl: Duration,

    /// Currency for portfolio totals (e.g. "USD").
    #[serde(default = "default_reporting_currency")]
    pub reporting_currency: String,

    /// Per-provider rate-limit overrides, keyed by provider source tag.
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitSettings>,

    /// Per-provider circuit-breaker overrides, keyed by provider source tag.
    #[serde(default)]
    pub circuit_breakers: HashMap<String, CircuitBreakerSettings>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_ttl: default_cache_ttl(),
            price_cache_ttl: default_price_cache_ttl(),
            reporting_currency: default_reporting_currency(),
            rate_limits: HashMap::new(),
            circuit_breakers: HashMap::new(),
        }
    }
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load config from a file, or return defaults if it doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Rate-limit settings for a provider, falling back to defaults.
    pub fn rate_limit_for(&self, provider: &str) -> RateLimitConfig {
        self.rate_limits
            .get(provider)
            .cloned()
            .unwrap_or_default()
            .into()
    }

    /// Circuit-breaker settings for a provider, falling back to defaults.
    pub fn circuit_breaker_for(&self, provider: &str) -> CircuitBreakerConfig {
        self.circuit_breakers
            .get(provider)
            .cloned()
            .unwrap_or_default()
            .into()
    }
}
