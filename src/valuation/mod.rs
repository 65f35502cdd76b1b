//! Valuator port and the TTL caching decorator.
//!
//! The core never discovers prices itself; hosts inject a [`Valuator`] and
//! may wrap it in [`CachedValuator`] to bound how often the backing source
//! is consulted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::models::PriceInfo;

/// Boundary to the market price source.
#[async_trait]
pub trait Valuator: Send + Sync {
    /// Current price of one symbol, in `currency` (provider default when None).
    async fn price(&self, symbol: &str, currency: Option<&str>) -> Result<PriceInfo>;

    /// Prices for many symbols at once. Symbols the provider cannot price
    /// are simply absent from the result.
    async fn batch_prices(
        &self,
        symbols: &[String],
        currency: Option<&str>,
    ) -> Result<HashMap<String, PriceInfo>>;

    async fn convert_value(&self, amount: Decimal, from: &str, to: &str) -> Result<Decimal>;

    /// Drop cached prices for the given symbols, or everything when None.
    /// Meaningful only for caching implementations; default is a no-op.
    async fn invalidate_cache(&self, _symbols: Option<&[String]>) -> Result<()> {
        Ok(())
    }
}

struct CacheEntry {
    price: PriceInfo,
    cached_at: DateTime<Utc>,
}

/// TTL'd in-memory price cache in front of another valuator.
pub struct CachedValuator {
    inner: Arc<dyn Valuator>,
    ttl: Duration,
    cache: Mutex<HashMap<(String, String), CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl CachedValuator {
    pub fn new(inner: Arc<dyn Valuator>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(HashMap::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn cache_key(symbol: &str, currency: Option<&str>) -> (String, String) {
        (
            symbol.to_uppercase(),
            currency.unwrap_or("").to_uppercase(),
        )
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let age = (now - entry.cached_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        age < self.ttl
    }
}

#[async_trait]
impl Valuator for CachedValuator {
    async fn price(&self, symbol: &str, currency: Option<&str>) -> Result<PriceInfo> {
        let key = Self::cache_key(symbol, currency);
        let now = self.clock.now();

        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&key) {
                if self.is_fresh(entry, now) {
                    debug!(symbol = %key.0, "price cache hit");
                    return Ok(entry.price.clone());
                }
            }
        }

        let price = self.inner.price(symbol, currency).await?;
        let mut cache = self.cache.lock().await;
        cache.insert(
            key,
            CacheEntry {
                price: price.clone(),
                cached_at: now,
            },
        );
        Ok(price)
    }

    async fn batch_prices(
        &self,
        symbols: &[String],
        currency: Option<&str>,
    ) -> Result<HashMap<String, PriceInfo>> {
        let now = self.clock.now();
        let mut result = HashMap::new();
        let mut missing: Vec<String> = Vec::new();

        {
            let cache = self.cache.lock().await;
            for symbol in symbols {
                let key = Self::cache_key(symbol, currency);
                match cache.get(&key) {
                    Some(entry) if self.is_fresh(entry, now) => {
                        result.insert(key.0, entry.price.clone());
                    }
                    _ => missing.push(symbol.clone()),
                }
            }
        }

        if !missing.is_empty() {
            debug!(
                missing = missing.len(),
                cached = result.len(),
                "fetching uncached prices"
            );
            let fetched = self.inner.batch_prices(&missing, currency).await?;
            let mut cache = self.cache.lock().await;
            for (symbol, price) in fetched {
                let key = Self::cache_key(&symbol, currency);
                cache.insert(
                    key.clone(),
                    CacheEntry {
                        price: price.clone(),
                        cached_at: now,
                    },
                );
                result.insert(key.0, price);
            }
        }

        Ok(result)
    }

    async fn convert_value(&self, amount: Decimal, from: &str, to: &str) -> Result<Decimal> {
        self.inner.convert_value(amount, from, to).await
    }

    async fn invalidate_cache(&self, symbols: Option<&[String]>) -> Result<()> {
        let mut cache = self.cache.lock().await;
        match symbols {
            Some(symbols) => {
                for symbol in symbols {
                    let symbol = symbol.to_uppercase();
                    cache.retain(|(cached_symbol, _), _| *cached_symbol != symbol);
                }
            }
            None => cache.clear(),
        }
        Ok(())
    }
}
