//! Sync orchestrator: runs protected health cycles against registered
//! providers and tracks per-provider reliability metrics.
//!
//! The orchestrator exclusively owns one circuit breaker and one rate
//! limiter per provider. A sync cycle fans out one protected task per
//! provider and waits for all of them to settle; one provider's failure
//! never cancels its peers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::events::{DomainEvent, EventBus, EventKind};
use crate::protection::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats, RateLimitConfig,
    RateLimiter,
};
use crate::providers::AssetProvider;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Another sync cycle is in flight on this orchestrator.
    #[error("A sync cycle is already in progress")]
    SyncInProgress,

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
}

/// Reliability counters for one provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderSyncMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_response_ms: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl ProviderSyncMetrics {
    fn record(&mut self, succeeded: bool, response_ms: f64, at: DateTime<Utc>) {
        self.attempts += 1;
        if succeeded {
            self.successes += 1;
            self.last_success = Some(at);
        } else {
            self.failures += 1;
            self.last_failure = Some(at);
        }
        let n = self.attempts as f64;
        self.avg_response_ms = (self.avg_response_ms * (n - 1.0) + response_ms) / n;
    }
}

/// Aggregated counters across all providers plus cycle-level timing.
#[derive(Debug, Clone, Default)]
pub struct SyncMetrics {
    pub per_provider: BTreeMap<String, ProviderSyncMetrics>,
    pub cycles: u64,
    pub avg_cycle_ms: f64,
    pub next_scheduled_sync: Option<DateTime<Utc>>,
}

impl SyncMetrics {
    pub fn total_attempts(&self) -> u64 {
        self.per_provider.values().map(|m| m.attempts).sum()
    }

    pub fn total_successes(&self) -> u64 {
        self.per_provider.values().map(|m| m.successes).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.per_provider.values().map(|m| m.failures).sum()
    }
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone)]
pub struct SyncCycleResult {
    pub successful: Vec<String>,
    pub failed: Vec<String>,
    pub errors: BTreeMap<String, String>,
    pub duration: Duration,
    pub completed_at: DateTime<Utc>,
}

struct ProviderSlot {
    provider: Arc<dyn AssetProvider>,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
}

/// Cancellation handle for a scheduled sync loop.
pub struct SyncScheduleHandle {
    task: JoinHandle<()>,
}

impl SyncScheduleHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_finished()
    }
}

pub struct SyncOrchestrator {
    slots: HashMap<String, ProviderSlot>,
    metrics: Mutex<SyncMetrics>,
    in_flight: AtomicBool,
    events: Option<EventBus>,
    clock: Arc<dyn Clock>,
    canary_addresses: Vec<String>,
}

impl SyncOrchestrator {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            metrics: Mutex::new(SyncMetrics::default()),
            in_flight: AtomicBool::new(false),
            events: None,
            clock: Arc::new(SystemClock),
            canary_addresses: Vec::new(),
        }
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Addresses used for the per-provider health fetch. Defaults to an
    /// empty set, which providers treat as a ping.
    pub fn with_canary_addresses(mut self, addresses: Vec<String>) -> Self {
        self.canary_addresses = addresses;
        self
    }

    /// Register a provider with default protection settings.
    pub fn register_provider(&mut self, provider: Arc<dyn AssetProvider>) {
        self.register_provider_with(
            provider,
            RateLimitConfig::default(),
            CircuitBreakerConfig::default(),
        );
    }

    /// Register a provider with explicit rate-limit and breaker settings.
    pub fn register_provider_with(
        &mut self,
        provider: Arc<dyn AssetProvider>,
        rate_limit: RateLimitConfig,
        breaker: CircuitBreakerConfig,
    ) {
        let source = provider.source().to_string();
        let slot = ProviderSlot {
            provider,
            breaker: CircuitBreaker::new(breaker).with_clock(self.clock.clone()),
            limiter: RateLimiter::token_bucket(rate_limit).with_clock(self.clock.clone()),
        };
        self.slots.insert(source, slot);
    }

    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.keys().cloned().collect();
        names.sort();
        names
    }

    fn slot(&self, provider: &str) -> Result<&ProviderSlot, SyncError> {
        self.slots
            .get(provider)
            .ok_or_else(|| SyncError::UnknownProvider(provider.to_string()))
    }

    fn publish(&self, kind: EventKind) {
        if let Some(events) = &self.events {
            events.publish(&DomainEvent::new(kind));
        }
    }

    fn publish_breaker_transition(&self, provider: &str, before: CircuitState, after: CircuitState) {
        if before == after {
            return;
        }
        let kind = match after {
            CircuitState::Open => EventKind::CircuitBreakerOpened {
                provider: provider.to_string(),
            },
            CircuitState::Closed => EventKind::CircuitBreakerClosed {
                provider: provider.to_string(),
            },
            CircuitState::HalfOpen => EventKind::CircuitBreakerHalfOpen {
                provider: provider.to_string(),
            },
        };
        self.publish(kind);
    }

    /// Run one protected health call against a provider: breaker admission,
    /// rate-limit wait, connect if needed, canary fetch.
    async fn protected_call(&self, name: &str, slot: &ProviderSlot) -> Result<f64> {
        let before = slot.breaker.state();

        if !slot.breaker.is_allowed() {
            self.publish_breaker_transition(name, before, slot.breaker.state());
            debug!(provider = name, "circuit open, refusing sync task");
            return Err(crate::protection::CircuitOpenError.into());
        }
        self.publish_breaker_transition(name, before, slot.breaker.state());

        slot.limiter.wait_for_slot().await;

        let before = slot.breaker.state();
        let started = self.clock.now();
        let result = slot
            .breaker
            .execute(|| async {
                if !slot.provider.is_connected().await {
                    slot.provider.connect().await?;
                }
                slot.provider.fetch_assets(&self.canary_addresses).await?;
                Ok(())
            })
            .await;
        let response_ms = (self.clock.now() - started).num_milliseconds().max(0) as f64;

        self.publish_breaker_transition(name, before, slot.breaker.state());

        result.map(|()| response_ms)
    }

    /// Run one sync cycle over the given providers, in parallel, waiting
    /// for every task to settle. Only one cycle may run at a time.
    pub async fn orchestrate_sync(&self, providers: &[String]) -> Result<SyncCycleResult> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::SyncInProgress.into());
        }

        let result = self.run_cycle(providers, false).await;
        self.in_flight.store(false, Ordering::SeqCst);
        Ok(result)
    }

    async fn run_cycle(&self, providers: &[String], scheduled: bool) -> SyncCycleResult {
        let started = self.clock.now();
        self.publish(EventKind::SyncCycleStarted {
            providers: providers.to_vec(),
            scheduled,
        });
        info!(providers = providers.len(), "sync cycle started");

        let tasks = providers.iter().map(|name| async move {
            match self.slot(name) {
                Ok(slot) => (name.clone(), self.protected_call(name, slot).await),
                Err(err) => (name.clone(), Err(err.into())),
            }
        });
        let outcomes = join_all(tasks).await;

        let now = self.clock.now();
        let mut successful = Vec::new();
        let mut failed = Vec::new();
        let mut errors = BTreeMap::new();

        for (name, outcome) in outcomes {
            match outcome {
                Ok(response_ms) => successful.push((name, response_ms)),
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(provider = %name, error = %message, "sync task failed");
                    errors.insert(name.clone(), message.clone());
                    failed.push(name.clone());
                    self.publish(EventKind::SyncSourceFailed {
                        source: name,
                        error: message,
                    });
                }
            }
        }

        let duration = (now - started).to_std().unwrap_or(Duration::ZERO);
        {
            let mut metrics = self.metrics.lock().expect("metrics mutex");
            for (name, response_ms) in &successful {
                metrics
                    .per_provider
                    .entry(name.clone())
                    .or_default()
                    .record(true, *response_ms, now);
            }
            for name in &failed {
                metrics
                    .per_provider
                    .entry(name.clone())
                    .or_default()
                    .record(false, 0.0, now);
            }
            metrics.cycles += 1;
            let n = metrics.cycles as f64;
            metrics.avg_cycle_ms =
                (metrics.avg_cycle_ms * (n - 1.0) + duration.as_millis() as f64) / n;
        }
        let successful: Vec<String> = successful.into_iter().map(|(name, _)| name).collect();

        let result = SyncCycleResult {
            successful,
            failed,
            errors,
            duration,
            completed_at: now,
        };

        self.publish(EventKind::SyncCycleCompleted {
            successful: result.successful.clone(),
            failed: result.failed.clone(),
            errors: result.errors.clone(),
            duration_ms: duration.as_millis() as u64,
        });
        info!(
            successful = result.successful.len(),
            failed = result.failed.len(),
            "sync cycle completed"
        );

        result
    }

    /// Run `orchestrate_sync` over all registered providers on a fixed
    /// period until the returned handle is cancelled.
    pub fn schedule_sync_cycle(self: &Arc<Self>, interval: Duration) -> SyncScheduleHandle {
        let orchestrator = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so the first cycle
            // lands one full interval from now.
            ticker.tick().await;
            loop {
                {
                    let mut metrics = orchestrator.metrics.lock().expect("metrics mutex");
                    metrics.next_scheduled_sync = Some(
                        orchestrator.clock.now()
                            + chrono::Duration::from_std(interval)
                                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                    );
                }
                ticker.tick().await;

                let providers = orchestrator.providers();
                if orchestrator
                    .in_flight
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    debug!("scheduled sync skipped: cycle already in flight");
                    continue;
                }
                orchestrator.run_cycle(&providers, true).await;
                orchestrator.in_flight.store(false, Ordering::SeqCst);
            }
        });
        SyncScheduleHandle { task }
    }

    /// Reset a provider's breaker and run a single protected task against it.
    pub async fn retry_failed_provider(&self, provider: &str) -> Result<()> {
        let slot = self.slot(provider)?;
        slot.breaker.reset();

        let now_result = self.protected_call(provider, slot).await;
        let now = self.clock.now();
        let mut metrics = self.metrics.lock().expect("metrics mutex");
        let entry = metrics.per_provider.entry(provider.to_string()).or_default();
        match now_result {
            Ok(response_ms) => {
                entry.record(true, response_ms, now);
                Ok(())
            }
            Err(err) => {
                entry.record(false, 0.0, now);
                Err(err)
            }
        }
    }

    /// Hot-swap a provider's rate-limit settings.
    pub fn configure_rate_limit(&self, provider: &str, config: RateLimitConfig) -> Result<()> {
        let slot = self.slot(provider)?;
        slot.limiter.update_config(config);
        Ok(())
    }

    /// Hot-swap a provider's breaker settings.
    pub fn configure_circuit_breaker(
        &self,
        provider: &str,
        config: CircuitBreakerConfig,
    ) -> Result<()> {
        let slot = self.slot(provider)?;
        slot.breaker.update_config(config);
        Ok(())
    }

    pub fn circuit_state(&self, provider: &str) -> Result<CircuitState> {
        Ok(self.slot(provider)?.breaker.state())
    }

    pub fn circuit_stats(&self, provider: &str) -> Result<CircuitStats> {
        Ok(self.slot(provider)?.breaker.stats())
    }

    pub fn sync_metrics(&self) -> SyncMetrics {
        self.metrics.lock().expect("metrics mutex").clone()
    }
}

impl Default for SyncOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}
