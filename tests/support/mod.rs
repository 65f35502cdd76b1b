#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use omnifolio::events::{DomainEvent, EventBus};
use omnifolio::models::{Asset, AssetBalance, AssetType, PriceInfo, SourceKind};
use omnifolio::providers::AssetProvider;
use omnifolio::valuation::Valuator;
use rust_decimal::Decimal;

/// Route test logs through the test harness capture. Safe to call from
/// every test; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Build a native (no contract address) holding with provenance stamped.
pub fn native_asset(
    symbol: &str,
    chain: &str,
    amount: Decimal,
    decimals: u32,
    source_kind: SourceKind,
) -> Asset {
    let balance = AssetBalance::new(amount, decimals).unwrap();
    let mut asset = Asset::new(symbol, AssetType::Token, balance)
        .unwrap()
        .with_chain(chain);
    asset.metadata.source_kind = Some(source_kind);
    asset.metadata.fetched_at = Some(Utc::now());
    asset
}

/// Build a contract-addressed holding.
pub fn contract_asset(
    symbol: &str,
    chain: &str,
    contract: &str,
    amount: Decimal,
    decimals: u32,
    source_kind: SourceKind,
) -> Asset {
    native_asset(symbol, chain, amount, decimals, source_kind).with_contract_address(contract)
}

/// Configurable in-memory provider for pipeline tests.
pub struct MockProvider {
    source: String,
    assets: Vec<Asset>,
    connected: AtomicBool,
    failing: AtomicBool,
    fetch_delay: Option<Duration>,
    fetch_calls: AtomicUsize,
    connect_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            assets: Vec::new(),
            connected: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            fetch_delay: None,
            fetch_calls: AtomicUsize::new(0),
            connect_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_assets(mut self, assets: Vec<Asset>) -> Self {
        self.assets = assets;
        self
    }

    pub fn failing(self) -> Self {
        self.failing.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetProvider for MockProvider {
    fn source(&self) -> &str {
        &self.source
    }

    async fn connect(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("{} connection refused", self.source);
        }
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn fetch_assets(&self, _addresses: &[String]) -> Result<Vec<Asset>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("{} RPC timeout", self.source);
        }
        Ok(self.assets.clone())
    }
}

/// Valuator serving a fixed symbol-to-price table.
pub struct MockValuator {
    prices: HashMap<String, Decimal>,
    currency: String,
    failing: AtomicBool,
    batch_calls: AtomicUsize,
}

impl MockValuator {
    pub fn new() -> Self {
        Self {
            prices: HashMap::new(),
            currency: "USD".to_string(),
            failing: AtomicBool::new(false),
            batch_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_price(mut self, symbol: &str, value: Decimal) -> Self {
        self.prices.insert(symbol.to_uppercase(), value);
        self
    }

    pub fn failing(self) -> Self {
        self.failing.store(true, Ordering::SeqCst);
        self
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Valuator for MockValuator {
    async fn price(&self, symbol: &str, currency: Option<&str>) -> Result<PriceInfo> {
        let prices = self.batch_prices(&[symbol.to_string()], currency).await?;
        prices
            .into_values()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no price for {symbol}"))
    }

    async fn batch_prices(
        &self,
        symbols: &[String],
        currency: Option<&str>,
    ) -> Result<HashMap<String, PriceInfo>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("valuator unavailable");
        }
        let currency = currency.unwrap_or(&self.currency);
        let mut result = HashMap::new();
        for symbol in symbols {
            let key = symbol.to_uppercase();
            if let Some(value) = self.prices.get(&key) {
                result.insert(key, PriceInfo::new(*value, currency, Utc::now()));
            }
        }
        Ok(result)
    }

    async fn convert_value(&self, amount: Decimal, _from: &str, _to: &str) -> Result<Decimal> {
        Ok(amount)
    }
}

/// Collects every published event for later assertions.
pub struct EventRecorder {
    pub bus: EventBus,
    events: std::sync::Arc<Mutex<Vec<DomainEvent>>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        let bus = EventBus::new();
        let events = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        bus.subscribe_all(move |event: &DomainEvent| {
            sink.lock().unwrap().push(event.clone());
        });
        Self { bus, events }
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_of(&self, event_type: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }

    pub fn first_of(&self, event_type: &str) -> Option<DomainEvent> {
        self.events()
            .into_iter()
            .find(|e| e.event_type() == event_type)
    }
}
