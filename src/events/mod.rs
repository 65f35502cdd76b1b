//! Domain events and the in-process event bus.
//!
//! Services publish facts about completed mutations; hosts subscribe by
//! event type or globally. Publication is synchronous and best-effort: a
//! misbehaving handler is isolated and logged, never allowed to disturb
//! sibling handlers or the publishing service.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::Id;

/// Type-specific payload of a domain event. The serde tag doubles as the
/// subscription key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    PortfolioAggregationStarted {
        portfolio_id: String,
        sources: Vec<String>,
        addresses: BTreeMap<String, Vec<String>>,
    },
    PortfolioAggregationCompleted {
        portfolio_id: String,
        total_value: Decimal,
        currency: String,
        asset_count: usize,
        duration_ms: u64,
    },
    PortfolioAggregationFailed {
        portfolio_id: String,
        error: String,
    },
    PortfolioReconciliationStarted {
        portfolio_id: String,
        asset_count: usize,
    },
    PortfolioReconciliationCompleted {
        portfolio_id: String,
        asset_count: usize,
    },
    AssetAddedToPortfolio {
        portfolio_id: String,
        asset_id: String,
        symbol: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
    },
    AssetMerged {
        portfolio_id: String,
        asset_id: String,
        symbol: String,
    },
    AssetPriceUpdated {
        portfolio_id: String,
        asset_id: String,
        symbol: String,
        price: Decimal,
        currency: String,
    },
    IntegrationSourceConnected {
        source: String,
    },
    IntegrationSourceFailed {
        source: String,
        error: String,
    },
    IntegrationSourceDataFetched {
        source: String,
        asset_count: usize,
    },
    AddressAdded {
        chain: String,
        address: String,
    },
    AddressRemoved {
        chain: String,
        address: String,
    },
    AddressMetadataUpdated {
        chain: String,
        address: String,
    },
    SyncCycleStarted {
        providers: Vec<String>,
        scheduled: bool,
    },
    SyncCycleCompleted {
        successful: Vec<String>,
        failed: Vec<String>,
        errors: BTreeMap<String, String>,
        duration_ms: u64,
    },
    SyncSourceFailed {
        source: String,
        error: String,
    },
    CircuitBreakerOpened {
        provider: String,
    },
    CircuitBreakerClosed {
        provider: String,
    },
    CircuitBreakerHalfOpen {
        provider: String,
    },
}

impl EventKind {
    /// Subscription key for this event, matching the serde tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PortfolioAggregationStarted { .. } => "portfolio_aggregation_started",
            Self::PortfolioAggregationCompleted { .. } => "portfolio_aggregation_completed",
            Self::PortfolioAggregationFailed { .. } => "portfolio_aggregation_failed",
            Self::PortfolioReconciliationStarted { .. } => "portfolio_reconciliation_started",
            Self::PortfolioReconciliationCompleted { .. } => "portfolio_reconciliation_completed",
            Self::AssetAddedToPortfolio { .. } => "asset_added_to_portfolio",
            Self::AssetMerged { .. } => "asset_merged",
            Self::AssetPriceUpdated { .. } => "asset_price_updated",
            Self::IntegrationSourceConnected { .. } => "integration_source_connected",
            Self::IntegrationSourceFailed { .. } => "integration_source_failed",
            Self::IntegrationSourceDataFetched { .. } => "integration_source_data_fetched",
            Self::AddressAdded { .. } => "address_added",
            Self::AddressRemoved { .. } => "address_removed",
            Self::AddressMetadataUpdated { .. } => "address_metadata_updated",
            Self::SyncCycleStarted { .. } => "sync_cycle_started",
            Self::SyncCycleCompleted { .. } => "sync_cycle_completed",
            Self::SyncSourceFailed { .. } => "sync_source_failed",
            Self::CircuitBreakerOpened { .. } => "circuit_breaker_opened",
            Self::CircuitBreakerClosed { .. } => "circuit_breaker_closed",
            Self::CircuitBreakerHalfOpen { .. } => "circuit_breaker_half_open",
        }
    }
}

/// Immutable event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: Id,
    pub occurred_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl DomainEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: Id::new(),
            occurred_at: Utc::now(),
            aggregate_id: None,
            kind,
        }
    }

    pub fn with_aggregate_id(mut self, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}

type Handler = Arc<dyn Fn(&DomainEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_token: AtomicU64,
    by_type: Mutex<HashMap<String, Vec<(u64, Handler)>>>,
    global: Mutex<Vec<(u64, Handler)>>,
}

/// In-process publish/subscribe fan-out.
///
/// Cloning the bus is cheap; clones share subscriptions.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event type. The returned handle unsubscribes;
    /// dropping it without calling `unsubscribe` leaves the handler live.
    pub fn subscribe<F>(&self, event_type: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let mut by_type = self.inner.by_type.lock().expect("event bus mutex");
        by_type
            .entry(event_type.into())
            .or_default()
            .push((token, Arc::new(handler)));
        SubscriptionHandle {
            bus: Arc::downgrade(&self.inner),
            token,
        }
    }

    /// Subscribe to every event.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let mut global = self.inner.global.lock().expect("event bus mutex");
        global.push((token, Arc::new(handler)));
        SubscriptionHandle {
            bus: Arc::downgrade(&self.inner),
            token,
        }
    }

    /// Dispatch to every handler for the event's type plus every global
    /// subscriber. A panicking handler is logged and skipped.
    pub fn publish(&self, event: &DomainEvent) {
        let mut handlers: Vec<Handler> = Vec::new();
        {
            let by_type = self.inner.by_type.lock().expect("event bus mutex");
            if let Some(typed) = by_type.get(event.event_type()) {
                handlers.extend(typed.iter().map(|(_, h)| h.clone()));
            }
        }
        {
            let global = self.inner.global.lock().expect("event bus mutex");
            handlers.extend(global.iter().map(|(_, h)| h.clone()));
        }

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(
                    event_type = event.event_type(),
                    "event handler panicked; continuing with remaining handlers"
                );
            }
        }
    }
}

/// Unsubscribe handle returned by [`EventBus::subscribe`]. Calling
/// [`unsubscribe`](Self::unsubscribe) more than once is a no-op.
pub struct SubscriptionHandle {
    bus: Weak<BusInner>,
    token: u64,
}

impl SubscriptionHandle {
    pub fn unsubscribe(&self) {
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        let mut by_type = inner.by_type.lock().expect("event bus mutex");
        for handlers in by_type.values_mut() {
            handlers.retain(|(token, _)| *token != self.token);
        }
        drop(by_type);
        let mut global = inner.global.lock().expect("event bus mutex");
        global.retain(|(token, _)| *token != self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn started_event() -> DomainEvent {
        DomainEvent::new(EventKind::SyncCycleStarted {
            providers: vec!["evm".to_string()],
            scheduled: false,
        })
    }

    #[test]
    fn test_typed_subscription_receives_matching_events() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let seen = count.clone();
        bus.subscribe("sync_cycle_started", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&started_event());
        bus.publish(&DomainEvent::new(EventKind::CircuitBreakerOpened {
            provider: "evm".to_string(),
        }));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_global_subscription_receives_everything() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let seen = count.clone();
        bus.subscribe_all(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&started_event());
        bus.publish(&DomainEvent::new(EventKind::CircuitBreakerOpened {
            provider: "evm".to_string(),
        }));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let seen = count.clone();
        let handle = bus.subscribe("sync_cycle_started", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&started_event());
        handle.unsubscribe();
        handle.unsubscribe();
        bus.publish(&started_event());

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_handler_does_not_break_siblings() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe("sync_cycle_started", |_| {
            panic!("bad handler");
        });
        let seen = count.clone();
        bus.subscribe("sync_cycle_started", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&started_event());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_serialization_includes_tag() {
        let event = started_event().with_aggregate_id("portfolio_1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "sync_cycle_started");
        assert_eq!(json["aggregate_id"], "portfolio_1");
        assert!(json["id"].is_string());
    }

    #[test]
    fn test_event_type_matches_serde_tag() {
        let event = DomainEvent::new(EventKind::AssetMerged {
            portfolio_id: "p".to_string(),
            asset_id: "a".to_string(),
            symbol: "ETH".to_string(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.event_type());
    }
}
