//! End-to-end composition: aggregation service over the JSON-file
//! repository with a cached valuator, configured from a TOML file.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use omnifolio::aggregation::{AggregationParams, AggregationService};
use omnifolio::config::Config;
use omnifolio::models::SourceKind;
use omnifolio::storage::{JsonFilePortfolioRepository, PortfolioRepository};
use omnifolio::valuation::CachedValuator;
use rust_decimal_macros::dec;

mod support;
use support::{init_tracing, native_asset, MockProvider, MockValuator};

const EVM_ADDR: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";

#[tokio::test]
async fn aggregation_persists_snapshots_to_disk() -> Result<()> {
    init_tracing();
    let dir = tempfile::TempDir::new()?;
    let repository = Arc::new(JsonFilePortfolioRepository::new(dir.path()));

    let evm = Arc::new(MockProvider::new("evm").with_assets(vec![native_asset(
        "ETH",
        "ethereum",
        dec!(2),
        18,
        SourceKind::Onchain,
    )]));

    let config = Config::default();
    let valuator = Arc::new(CachedValuator::new(
        Arc::new(MockValuator::new().with_price("ETH", dec!(3000))),
        config.price_cache_ttl,
    ));

    let service = AggregationService::new(repository.clone(), valuator)
        .with_provider(evm)
        .with_cache_ttl(config.cache_ttl)
        .with_reporting_currency(config.reporting_currency.clone());

    let params = AggregationParams {
        user_id: Some("user-1".to_string()),
        ..AggregationParams::for_addresses(BTreeMap::from([(
            "ethereum".to_string(),
            vec![EVM_ADDR.to_string()],
        )]))
    };
    let portfolio = service.aggregate_portfolio(params).await?;

    // The snapshot landed on disk with the computed total.
    let snapshot = repository.find_by_id(portfolio.id()).await?.unwrap();
    assert_eq!(snapshot.id, "portfolio_user-1");
    assert_eq!(snapshot.total_value.value, dec!(6000));
    assert_eq!(snapshot.total_value.currency, "USD");
    assert_eq!(snapshot.assets.len(), 1);
    assert_eq!(snapshot.sources, vec!["evm".to_string()]);
    Ok(())
}

#[tokio::test]
async fn cached_valuator_absorbs_repeat_aggregations() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let repository = Arc::new(JsonFilePortfolioRepository::new(dir.path()));

    let inner = Arc::new(MockValuator::new().with_price("ETH", dec!(3000)));
    let valuator = Arc::new(CachedValuator::new(
        inner.clone(),
        std::time::Duration::from_secs(300),
    ));

    let evm = Arc::new(MockProvider::new("evm").with_assets(vec![native_asset(
        "ETH",
        "ethereum",
        dec!(1),
        18,
        SourceKind::Onchain,
    )]));

    let service = AggregationService::new(repository, valuator)
        .with_provider(evm)
        .with_cache_ttl(std::time::Duration::ZERO);

    let params = || AggregationParams {
        user_id: Some("user-2".to_string()),
        ..AggregationParams::for_addresses(BTreeMap::from([(
            "ethereum".to_string(),
            vec![EVM_ADDR.to_string()],
        )]))
    };

    // Portfolio cache is disabled, so both calls run the pipeline, but the
    // second batch-price lookup is served from the valuator cache.
    service.aggregate_portfolio(params()).await?;
    service.aggregate_portfolio(params()).await?;
    assert_eq!(inner.batch_calls(), 1);
    Ok(())
}
