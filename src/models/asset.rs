use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Id;

/// Validation errors from constructing assets and balances.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssetError {
    #[error("Asset symbol must be non-empty")]
    EmptySymbol,

    #[error("Balance amount must be non-negative: {0}")]
    NegativeBalance(Decimal),
}

/// Classification of a holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Token,
    Nft,
    Stock,
    Option,
    Crypto,
    Defi,
}

/// Where an asset record originated, ordered by merge precedence.
/// On-chain data wins over aggregator data, which wins over exchange data,
/// which wins over manual entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Onchain,
    Dex,
    Cex,
    Manual,
}

impl SourceKind {
    /// Precedence rank. Lower wins when merging duplicate assets.
    pub fn rank(&self) -> u8 {
        match self {
            SourceKind::Onchain => 1,
            SourceKind::Dex => 2,
            SourceKind::Cex => 3,
            SourceKind::Manual => 4,
        }
    }
}

/// A holding amount with display formatting.
///
/// `formatted` is always rendered to exactly `decimals` fraction digits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub amount: Decimal,
    pub decimals: u32,
    pub formatted: String,
}

impl AssetBalance {
    pub fn new(amount: Decimal, decimals: u32) -> Result<Self, AssetError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(AssetError::NegativeBalance(amount));
        }
        Ok(Self {
            amount,
            decimals,
            formatted: format_amount(amount, decimals),
        })
    }
}

/// Render an amount with exactly `decimals` fraction digits.
pub fn format_amount(amount: Decimal, decimals: u32) -> String {
    format!("{amount:.prec$}", prec = decimals as usize)
}

/// A market price attached to an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceInfo {
    pub value: Decimal,
    pub currency: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl PriceInfo {
    pub fn new(value: Decimal, currency: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            value,
            currency: currency.into().to_uppercase(),
            timestamp,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Provenance and free-form annotations carried by an asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_kind: Option<SourceKind>,
    /// Provider labels this asset absorbed through merges. Append-only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One holding: a balance of a single asset, optionally priced.
///
/// Assets are created by provider adapters and owned by a [`Portfolio`];
/// after construction they change only through [`Asset::update_price`] and
/// [`Asset::update_balance`].
///
/// [`Portfolio`]: super::Portfolio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: Id,
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
    pub balance: AssetBalance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<PriceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub metadata: AssetMetadata,
}

impl Asset {
    pub fn new(
        symbol: impl Into<String>,
        asset_type: AssetType,
        balance: AssetBalance,
    ) -> Result<Self, AssetError> {
        let symbol = symbol.into().trim().to_uppercase();
        if symbol.is_empty() {
            return Err(AssetError::EmptySymbol);
        }
        Ok(Self {
            id: Id::new(),
            symbol,
            name: None,
            asset_type,
            chain: None,
            balance,
            price: None,
            contract_address: None,
            image_url: None,
            metadata: AssetMetadata::default(),
        })
    }

    pub fn with_id(mut self, id: Id) -> Self {
        self.id = id;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_chain(mut self, chain: impl Into<String>) -> Self {
        self.chain = Some(chain.into());
        self
    }

    pub fn with_contract_address(mut self, contract: impl Into<String>) -> Self {
        self.contract_address = Some(contract.into());
        self
    }

    pub fn with_image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    pub fn with_price(mut self, price: PriceInfo) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_metadata(mut self, metadata: AssetMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Replace the market price.
    pub fn update_price(&mut self, price: PriceInfo) {
        self.price = Some(price);
    }

    /// Replace the balance amount, re-rendering the display string to the
    /// existing decimals.
    pub fn update_balance(&mut self, amount: Decimal) -> Result<(), AssetError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(AssetError::NegativeBalance(amount));
        }
        self.balance.amount = amount;
        self.balance.formatted = format_amount(amount, self.balance.decimals);
        Ok(())
    }

    /// Holding value in the price currency, if a price is attached.
    pub fn value(&self) -> Option<Decimal> {
        self.price
            .as_ref()
            .map(|p| self.balance.amount * p.value)
    }
}
