//! Aggregation service: the end-to-end pipeline that turns a set of tracked
//! addresses into a priced, deduplicated portfolio.
//!
//! Pipeline per call: cache check, per-provider fan-out, serial reduction
//! into the portfolio aggregate, a full reconciliation pass, best-effort
//! price enrichment, persistence, and event emission. Provider failures are
//! contained per provider; the pipeline always completes with whatever
//! partial data was gathered.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::events::{DomainEvent, EventBus, EventKind, SubscriptionHandle};
use crate::models::{AddOutcome, Asset, Portfolio};
use crate::providers::{AssetProvider, ProviderKind};
use crate::storage::PortfolioRepository;
use crate::valuation::Valuator;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregationError {
    #[error("Portfolio not found: {0}")]
    PortfolioNotFound(String),
}

/// Input to [`AggregationService::aggregate_portfolio`].
#[derive(Debug, Clone, Default)]
pub struct AggregationParams {
    /// Chain tag to address list.
    pub addresses: BTreeMap<String, Vec<String>>,
    /// Providers to consult; all registered providers when None.
    pub sources: Option<Vec<String>>,
    pub user_id: Option<String>,
    /// Skip the cache and rebuild even if a fresh snapshot exists.
    pub force_refresh: bool,
}

impl AggregationParams {
    pub fn for_addresses(addresses: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            addresses,
            ..Default::default()
        }
    }
}

pub struct AggregationService {
    providers: HashMap<String, Arc<dyn AssetProvider>>,
    portfolio_repository: Arc<dyn PortfolioRepository>,
    valuator: Arc<dyn Valuator>,
    events: Option<EventBus>,
    cache_ttl: Duration,
    reporting_currency: String,
    clock: Arc<dyn Clock>,
}

impl AggregationService {
    pub fn new(
        portfolio_repository: Arc<dyn PortfolioRepository>,
        valuator: Arc<dyn Valuator>,
    ) -> Self {
        Self {
            providers: HashMap::new(),
            portfolio_repository,
            valuator,
            events: None,
            cache_ttl: Duration::from_secs(5 * 60),
            reporting_currency: "USD".to_string(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn AssetProvider>) -> Self {
        self.providers.insert(provider.source().to_string(), provider);
        self
    }

    /// Attach an event bus. Without one, every publish step is a no-op and
    /// semantics are otherwise unchanged.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_reporting_currency(mut self, currency: impl Into<String>) -> Self {
        self.reporting_currency = currency.into().to_uppercase();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn publish(&self, kind: EventKind, aggregate_id: &str) {
        if let Some(events) = &self.events {
            events.publish(&DomainEvent::new(kind).with_aggregate_id(aggregate_id));
        }
    }

    /// Subscribe to one event type. Returns None when no bus is attached.
    pub fn on<F>(&self, event_type: impl Into<String>, handler: F) -> Option<SubscriptionHandle>
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        self.events
            .as_ref()
            .map(|events| events.subscribe(event_type, handler))
    }

    pub fn off(&self, handle: SubscriptionHandle) {
        handle.unsubscribe();
    }

    /// Build (or return from cache) the portfolio for an address set.
    pub async fn aggregate_portfolio(&self, params: AggregationParams) -> Result<Portfolio> {
        let portfolio_id = match &params.user_id {
            Some(user_id) => format!("portfolio_{user_id}"),
            None => format!("portfolio_{}", self.clock.now().timestamp_millis()),
        };

        if !params.force_refresh {
            if let Some(snapshot) = self.portfolio_repository.find_by_id(&portfolio_id).await? {
                let age = (self.clock.now() - snapshot.last_updated)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if age < self.cache_ttl {
                    debug!(portfolio_id = %portfolio_id, age_secs = age.as_secs(), "cache hit");
                    return Ok(Portfolio::from_snapshot(snapshot));
                }
                debug!(portfolio_id = %portfolio_id, age_secs = age.as_secs(), "cache stale");
            }
        }

        let target_providers = self.target_providers(&params);
        self.publish(
            EventKind::PortfolioAggregationStarted {
                portfolio_id: portfolio_id.clone(),
                sources: target_providers.clone(),
                addresses: params.addresses.clone(),
            },
            &portfolio_id,
        );

        match self
            .run_pipeline(&portfolio_id, &params, &target_providers)
            .await
        {
            Ok(portfolio) => Ok(portfolio),
            Err(err) => {
                self.publish(
                    EventKind::PortfolioAggregationFailed {
                        portfolio_id: portfolio_id.clone(),
                        error: format!("{err:#}"),
                    },
                    &portfolio_id,
                );
                Err(err)
            }
        }
    }

    fn target_providers(&self, params: &AggregationParams) -> Vec<String> {
        match &params.sources {
            Some(sources) => sources.clone(),
            None => {
                let mut all: Vec<String> = self.providers.keys().cloned().collect();
                all.sort();
                all
            }
        }
    }

    async fn run_pipeline(
        &self,
        portfolio_id: &str,
        params: &AggregationParams,
        target_providers: &[String],
    ) -> Result<Portfolio> {
        let started = self.clock.now();
        let mut portfolio = Portfolio::new(portfolio_id, params.user_id.clone());

        // Fan out one independently-failing fetch per provider.
        let tasks = target_providers.iter().filter_map(|source| {
            let provider = self.providers.get(source)?;
            let relevant =
                ProviderKind::from_source(source).relevant_addresses(&params.addresses);
            if relevant.is_empty() {
                debug!(provider = %source, "no relevant addresses, skipping");
                return None;
            }
            Some(async move {
                let assets = self.fetch_from_provider(provider.as_ref(), &relevant).await;
                (source.clone(), assets)
            })
        });
        let outcomes = join_all(tasks).await;

        // Serial reduction: each provider's assets land atomically relative
        // to its peers.
        for (source, outcome) in outcomes {
            match outcome {
                Ok(assets) => {
                    let count = assets.len();
                    for asset in assets {
                        let asset = self.stamp_provenance(asset, &source);
                        let asset_id = asset.id.to_string();
                        let symbol = asset.symbol.clone();
                        let outcome = portfolio
                            .add_asset(asset)
                            .with_context(|| format!("adding asset from {source}"))?;
                        match outcome {
                            AddOutcome::Added => self.publish(
                                EventKind::AssetAddedToPortfolio {
                                    portfolio_id: portfolio_id.to_string(),
                                    asset_id,
                                    symbol,
                                    provider: Some(source.clone()),
                                },
                                portfolio_id,
                            ),
                            AddOutcome::Merged { surviving_id } => self.publish(
                                EventKind::AssetMerged {
                                    portfolio_id: portfolio_id.to_string(),
                                    asset_id: surviving_id,
                                    symbol,
                                },
                                portfolio_id,
                            ),
                        }
                    }
                    portfolio.add_source(source.as_str());
                    self.publish(
                        EventKind::IntegrationSourceDataFetched {
                            source: source.clone(),
                            asset_count: count,
                        },
                        portfolio_id,
                    );
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(provider = %source, error = %message, "provider fetch failed");
                    self.publish(
                        EventKind::IntegrationSourceFailed {
                            source,
                            error: message,
                        },
                        portfolio_id,
                    );
                }
            }
        }

        // The per-insert merge already dedupes; this pass is defense in
        // depth against providers that raced duplicates in.
        self.publish(
            EventKind::PortfolioReconciliationStarted {
                portfolio_id: portfolio_id.to_string(),
                asset_count: portfolio.len(),
            },
            portfolio_id,
        );
        portfolio.reconcile().context("reconciling portfolio")?;
        self.publish(
            EventKind::PortfolioReconciliationCompleted {
                portfolio_id: portfolio_id.to_string(),
                asset_count: portfolio.len(),
            },
            portfolio_id,
        );

        self.enrich_prices(&mut portfolio, portfolio_id).await;

        self.portfolio_repository
            .save(&portfolio.to_snapshot(&self.reporting_currency))
            .await
            .context("saving portfolio")?;

        let duration = (self.clock.now() - started)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.publish(
            EventKind::PortfolioAggregationCompleted {
                portfolio_id: portfolio_id.to_string(),
                total_value: portfolio.total_value(&self.reporting_currency),
                currency: self.reporting_currency.clone(),
                asset_count: portfolio.len(),
                duration_ms: duration.as_millis() as u64,
            },
            portfolio_id,
        );
        info!(
            portfolio_id = %portfolio_id,
            assets = portfolio.len(),
            sources = portfolio.sources().count(),
            "portfolio aggregation completed"
        );

        Ok(portfolio)
    }

    async fn fetch_from_provider(
        &self,
        provider: &dyn AssetProvider,
        addresses: &[String],
    ) -> Result<Vec<Asset>> {
        if !provider.is_connected().await {
            provider
                .connect()
                .await
                .with_context(|| format!("connecting to {}", provider.source()))?;
            self.publish(
                EventKind::IntegrationSourceConnected {
                    source: provider.source().to_string(),
                },
                provider.source(),
            );
        }
        provider
            .fetch_assets(addresses)
            .await
            .with_context(|| format!("fetching assets from {}", provider.source()))
    }

    /// Ensure every asset records which provider produced it and when.
    fn stamp_provenance(&self, mut asset: Asset, source: &str) -> Asset {
        if asset.metadata.provider.is_none() {
            asset.metadata.provider = Some(source.to_string());
        }
        if asset.metadata.fetched_at.is_none() {
            asset.metadata.fetched_at = Some(self.clock.now());
        }
        asset
    }

    /// Best-effort price enrichment: valuator failures are logged, never
    /// propagated.
    async fn enrich_prices(&self, portfolio: &mut Portfolio, portfolio_id: &str) {
        let symbols: BTreeSet<String> =
            portfolio.assets().map(|a| a.symbol.clone()).collect();
        if symbols.is_empty() {
            return;
        }
        let symbols: Vec<String> = symbols.into_iter().collect();

        let prices = match self
            .valuator
            .batch_prices(&symbols, Some(&self.reporting_currency))
            .await
        {
            Ok(prices) => prices,
            Err(err) => {
                warn!(error = %err, "price enrichment failed");
                return;
            }
        };

        let targets: Vec<(String, String)> = portfolio
            .assets()
            .filter(|a| prices.contains_key(&a.symbol))
            .map(|a| (a.id.to_string(), a.symbol.clone()))
            .collect();

        let mut updated = 0usize;
        for (asset_id, symbol) in targets {
            let Some(price) = prices.get(&symbol) else {
                continue;
            };
            if let Some(asset) = portfolio.asset_mut(&asset_id) {
                asset.update_price(price.clone());
                updated += 1;
                self.publish(
                    EventKind::AssetPriceUpdated {
                        portfolio_id: portfolio_id.to_string(),
                        asset_id,
                        symbol,
                        price: price.value,
                        currency: price.currency.clone(),
                    },
                    portfolio_id,
                );
            }
        }
        if updated > 0 {
            portfolio.set_last_updated(self.clock.now());
        }
    }

    /// Re-run aggregation for a persisted portfolio, bypassing the cache.
    pub async fn refresh_portfolio(&self, portfolio_id: &str) -> Result<Portfolio> {
        let snapshot = self
            .portfolio_repository
            .find_by_id(portfolio_id)
            .await?
            .ok_or_else(|| AggregationError::PortfolioNotFound(portfolio_id.to_string()))?;

        // Rebuild the chain-to-addresses map from what the assets recorded
        // at fetch time.
        let mut addresses: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for asset in &snapshot.assets {
            let chain = asset.chain.clone().unwrap_or_else(|| "unknown".to_string());
            let list = addresses.entry(chain).or_default();
            if let Some(serde_json::Value::String(address)) =
                asset.metadata.extra.get("address")
            {
                if !list.contains(address) {
                    list.push(address.clone());
                }
            }
        }

        let params = AggregationParams {
            addresses,
            sources: Some(snapshot.sources.clone()),
            user_id: snapshot.user_id.clone(),
            force_refresh: true,
        };
        self.aggregate_portfolio(params).await
    }

    /// Load a portfolio snapshot by id.
    pub async fn get_portfolio(&self, portfolio_id: &str) -> Result<Option<Portfolio>> {
        Ok(self
            .portfolio_repository
            .find_by_id(portfolio_id)
            .await?
            .map(Portfolio::from_snapshot))
    }
}
