//! Provider port: the boundary to external asset data sources.
//!
//! The core never talks to a network itself; hosts inject implementations
//! of [`AssetProvider`] (blockchain RPC clients, brokerage HTTP clients,
//! fixtures). Variant providers differ only by their `source` tag and by
//! which chains the aggregation pipeline routes to them.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::Asset;

/// EVM-compatible chains routed to EVM providers.
pub const EVM_CHAINS: [&str; 5] = ["ethereum", "polygon", "arbitrum", "optimism", "binance"];

/// Sentinel "address" handed to brokerage providers, which hold accounts
/// rather than chain addresses.
pub const BROKERAGE_DEFAULT_ADDRESS: &str = "default";

/// Routing family of a provider, derived from its source tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Evm,
    Solana,
    Brokerage,
    Unknown,
}

impl ProviderKind {
    pub fn from_source(source: &str) -> Self {
        match source {
            "evm" => Self::Evm,
            "solana" => Self::Solana,
            "brokerage" => Self::Brokerage,
            _ => Self::Unknown,
        }
    }

    /// The subset of a chain-keyed address map this provider should fetch,
    /// deduplicated preserving first appearance.
    pub fn relevant_addresses(&self, addresses: &BTreeMap<String, Vec<String>>) -> Vec<String> {
        let mut relevant: Vec<String> = Vec::new();
        let mut push_unique = |addr: &str| {
            if !relevant.iter().any(|a| a == addr) {
                relevant.push(addr.to_string());
            }
        };

        match self {
            Self::Evm => {
                for chain in EVM_CHAINS {
                    if let Some(list) = addresses.get(chain) {
                        for addr in list {
                            push_unique(addr);
                        }
                    }
                }
            }
            Self::Solana => {
                if let Some(list) = addresses.get("solana") {
                    for addr in list {
                        push_unique(addr);
                    }
                }
            }
            Self::Brokerage => {
                push_unique(BROKERAGE_DEFAULT_ADDRESS);
            }
            Self::Unknown => {}
        }

        relevant
    }
}

/// A transaction record reported by a provider. Optional capability; the
/// core only relays these, it does not interpret them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderTransaction {
    pub id: String,
    pub symbol: String,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Callback invoked with fresh assets by streaming-capable providers.
pub type UpdateHandler = Arc<dyn Fn(Vec<Asset>) + Send + Sync>;

/// Cancellation handle for a streaming subscription.
pub struct UpdateSubscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl UpdateSubscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Handle for providers without streaming support.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Boundary to one external holdings source.
#[async_trait]
pub trait AssetProvider: Send + Sync {
    /// Stable identifier, e.g. "evm", "solana", "brokerage".
    fn source(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn is_connected(&self) -> bool;

    /// Fetch current holdings for the given addresses. An empty address
    /// slice is a health ping and should return cheaply.
    async fn fetch_assets(&self, addresses: &[String]) -> Result<Vec<Asset>>;

    /// Optional capability; default reports no transactions.
    async fn fetch_transactions(&self, _addresses: &[String]) -> Result<Vec<ProviderTransaction>> {
        Ok(Vec::new())
    }

    /// Optional capability; default returns an inert handle.
    async fn subscribe_to_updates(
        &self,
        _addresses: &[String],
        _handler: UpdateHandler,
    ) -> Result<UpdateSubscription> {
        Ok(UpdateSubscription::noop())
    }
}
