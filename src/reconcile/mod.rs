//! Reconciliation engine: identifies equivalent assets reported by
//! different providers and merges them under provenance precedence rules.

use std::collections::HashMap;

use thiserror::Error;

use crate::models::{Asset, AssetBalance};

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Attempted to merge two assets that fail the same-asset predicate.
    /// This is a programming error, not recoverable input.
    #[error("Cannot merge different assets: {left} vs {right}")]
    DifferentAssets { left: String, right: String },
}

/// Canonical grouping key: `{chain}:{SYMBOL}:{contract|"native"}`.
///
/// Missing chains group under `unknown`; contract addresses compare
/// lower-cased; native tokens (no contract) group by symbol.
pub fn asset_key(asset: &Asset) -> String {
    let chain = asset.chain.as_deref().unwrap_or("unknown");
    let contract = asset
        .contract_address
        .as_deref()
        .map(|c| c.to_lowercase())
        .unwrap_or_else(|| "native".to_string());
    format!("{}:{}:{}", chain, asset.symbol.to_uppercase(), contract)
}

/// Two assets are the same holding iff their chains match and either both
/// carry the same contract address (case-insensitive) or neither carries
/// one and their symbols match. An asset with a contract address is never
/// the same as one without, even for a well-known token.
pub fn same_asset(a: &Asset, b: &Asset) -> bool {
    if a.chain != b.chain {
        return false;
    }
    match (&a.contract_address, &b.contract_address) {
        (Some(ca), Some(cb)) => ca.eq_ignore_ascii_case(cb),
        (None, None) => a.symbol.eq_ignore_ascii_case(&b.symbol),
        _ => false,
    }
}

fn precedence(asset: &Asset) -> u8 {
    asset
        .metadata
        .source_kind
        .map(|k| k.rank())
        .unwrap_or(u8::MAX)
}

/// Merge two equivalent assets into one.
///
/// The side with the better provenance rank supplies identity, symbol,
/// type, chain, display decimals, and nullable fields (falling back to the
/// other side); balances sum; the price with the more recent fetch wins.
pub fn merge(a: &Asset, b: &Asset) -> Result<Asset, ReconcileError> {
    if !same_asset(a, b) {
        return Err(ReconcileError::DifferentAssets {
            left: asset_key(a),
            right: asset_key(b),
        });
    }

    let (preferred, other) = if precedence(b) < precedence(a) {
        (b, a)
    } else {
        (a, b)
    };

    let balance = AssetBalance {
        amount: a.balance.amount + b.balance.amount,
        decimals: preferred.balance.decimals,
        formatted: crate::models::format_amount(
            a.balance.amount + b.balance.amount,
            preferred.balance.decimals,
        ),
    };

    let price = match (&a.price, &b.price) {
        (Some(_), Some(_)) => {
            if b.metadata.fetched_at > a.metadata.fetched_at {
                b.price.clone()
            } else {
                a.price.clone()
            }
        }
        (Some(_), None) => a.price.clone(),
        (None, Some(_)) => b.price.clone(),
        (None, None) => None,
    };

    let mut metadata = preferred.metadata.clone();
    metadata.fetched_at = metadata.fetched_at.or(other.metadata.fetched_at);
    metadata.source_kind = metadata.source_kind.or(other.metadata.source_kind);
    metadata.merged_from = a
        .metadata
        .merged_from
        .iter()
        .chain(b.metadata.merged_from.iter())
        .cloned()
        .chain(other.metadata.provider.clone())
        .collect();
    for (key, value) in &other.metadata.extra {
        metadata.extra.entry(key.clone()).or_insert(value.clone());
    }

    Ok(Asset {
        id: preferred.id.clone(),
        symbol: preferred.symbol.clone(),
        name: preferred.name.clone().or_else(|| other.name.clone()),
        asset_type: preferred.asset_type,
        chain: preferred.chain.clone().or_else(|| other.chain.clone()),
        balance,
        price,
        contract_address: preferred
            .contract_address
            .clone()
            .or_else(|| other.contract_address.clone())
            .map(|c| c.to_lowercase()),
        image_url: preferred
            .image_url
            .clone()
            .or_else(|| other.image_url.clone()),
        metadata,
    })
}

/// Group assets by key and reduce each group with [`merge`].
///
/// The result carries at most one asset per key; group order follows first
/// appearance in the input.
pub fn reconcile(assets: Vec<Asset>) -> Result<Vec<Asset>, ReconcileError> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Asset> = HashMap::new();

    for asset in assets {
        let key = asset_key(&asset);
        match groups.remove(&key) {
            Some(existing) => {
                let merged = merge(&existing, &asset)?;
                groups.insert(key, merged);
            }
            None => {
                order.push(key.clone());
                groups.insert(key, asset);
            }
        }
    }

    Ok(order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .collect())
}
