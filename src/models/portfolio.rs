use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::reconcile::{self, ReconcileError};

use super::{Asset, AssetType};

/// What happened when an asset was added to a portfolio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// The asset was inserted as a new holding.
    Added,
    /// The asset matched an existing holding and was merged into it.
    /// Carries the id of the surviving merged asset.
    Merged { surviving_id: String },
}

/// Aggregate root over a deduplicated set of holdings.
///
/// The portfolio owns its assets exclusively; all mutation goes through the
/// methods below, each of which maintains the aggregate invariants: no two
/// holdings share an asset key, `sources` is the union of contributing
/// providers, and `last_updated` tracks the latest mutation.
#[derive(Debug, Clone)]
pub struct Portfolio {
    id: String,
    user_id: Option<String>,
    assets: HashMap<String, Asset>,
    sources: BTreeSet<String>,
    last_updated: DateTime<Utc>,
}

impl Portfolio {
    pub fn new(id: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            user_id,
            assets: HashMap::new(),
            sources: BTreeSet::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    pub fn set_last_updated(&mut self, at: DateTime<Utc>) {
        self.last_updated = at;
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().map(String::as_str)
    }

    pub fn has_source(&self, source: &str) -> bool {
        self.sources.contains(source)
    }

    pub fn assets(&self) -> impl Iterator<Item = &Asset> {
        self.assets.values()
    }

    pub fn asset(&self, id: &str) -> Option<&Asset> {
        self.assets.values().find(|a| a.id.as_str() == id)
    }

    pub fn asset_mut(&mut self, id: &str) -> Option<&mut Asset> {
        self.assets.values_mut().find(|a| a.id.as_str() == id)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Insert a holding, merging with an existing equivalent one if present.
    pub fn add_asset(&mut self, asset: Asset) -> Result<AddOutcome, ReconcileError> {
        let existing_key = self
            .assets
            .iter()
            .find(|(_, existing)| reconcile::same_asset(existing, &asset))
            .map(|(key, _)| key.clone());

        let outcome = match existing_key {
            Some(key) => {
                let existing = self.assets.remove(&key).expect("key just observed");
                let merged = reconcile::merge(&existing, &asset)?;
                let surviving_id = merged.id.to_string();
                self.assets.insert(key, merged);
                AddOutcome::Merged { surviving_id }
            }
            None => {
                self.assets.insert(asset.id.to_string(), asset);
                AddOutcome::Added
            }
        };

        self.last_updated = Utc::now();
        Ok(outcome)
    }

    /// Remove a holding by asset id. Returns whether anything was removed;
    /// `last_updated` moves only on an actual removal.
    pub fn remove_asset(&mut self, asset_id: &str) -> bool {
        let key = self
            .assets
            .iter()
            .find(|(_, a)| a.id.as_str() == asset_id)
            .map(|(key, _)| key.clone());

        match key {
            Some(key) => {
                self.assets.remove(&key);
                self.last_updated = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn add_source(&mut self, source: impl Into<String>) {
        self.sources.insert(source.into());
        self.last_updated = Utc::now();
    }

    /// Absorb every asset and source of `other`.
    pub fn merge_portfolio(&mut self, other: &Portfolio) -> Result<(), ReconcileError> {
        for asset in other.assets() {
            self.add_asset(asset.clone())?;
        }
        for source in other.sources() {
            self.add_source(source);
        }
        Ok(())
    }

    /// Rebuild the internal map keyed by asset key, merging collisions.
    /// Idempotent: a second pass over already-reconciled assets is a no-op
    /// on keys and balances.
    pub fn reconcile(&mut self) -> Result<(), ReconcileError> {
        let assets: Vec<Asset> = self.assets.drain().map(|(_, a)| a).collect();
        for asset in reconcile::reconcile(assets)? {
            let key = reconcile::asset_key(&asset);
            self.assets.insert(key, asset);
        }
        self.last_updated = Utc::now();
        Ok(())
    }

    /// Sum of holding values whose price currency matches `currency`.
    /// Unpriced assets and assets priced in other currencies are skipped.
    pub fn total_value(&self, currency: &str) -> Decimal {
        self.assets
            .values()
            .filter_map(|asset| {
                let price = asset.price.as_ref()?;
                if price.currency.eq_ignore_ascii_case(currency) {
                    asset.value()
                } else {
                    None
                }
            })
            .sum()
    }

    pub fn assets_by_chain(&self, chain: &str) -> Vec<&Asset> {
        self.assets
            .values()
            .filter(|a| a.chain.as_deref() == Some(chain))
            .collect()
    }

    pub fn assets_by_type(&self, asset_type: AssetType) -> Vec<&Asset> {
        self.assets
            .values()
            .filter(|a| a.asset_type == asset_type)
            .collect()
    }

    pub fn clear(&mut self) {
        self.assets.clear();
        self.sources.clear();
        self.last_updated = Utc::now();
    }

    /// Serialize to the persistence snapshot shape, computing the total in
    /// the given reporting currency.
    pub fn to_snapshot(&self, currency: &str) -> PortfolioSnapshot {
        let currency = currency.to_uppercase();
        PortfolioSnapshot {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            assets: self.assets.values().cloned().collect(),
            total_value: TotalValue {
                value: self.total_value(&currency),
                currency,
                timestamp: Utc::now(),
            },
            last_updated: self.last_updated,
            sources: self.sources.iter().cloned().collect(),
        }
    }

    /// Rebuild a portfolio from a persisted snapshot, preserving its
    /// recorded `last_updated`.
    pub fn from_snapshot(snapshot: PortfolioSnapshot) -> Self {
        let mut assets = HashMap::new();
        for asset in snapshot.assets {
            assets.insert(asset.id.to_string(), asset);
        }
        Self {
            id: snapshot.id,
            user_id: snapshot.user_id,
            assets,
            sources: snapshot.sources.into_iter().collect(),
            last_updated: snapshot.last_updated,
        }
    }
}

/// Reporting-currency total recorded in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotalValue {
    pub value: Decimal,
    pub currency: String,
    pub timestamp: DateTime<Utc>,
}

/// Persistence shape for a portfolio. Asset values are derivable from
/// balance and price, so they are not stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub assets: Vec<Asset>,
    pub total_value: TotalValue,
    pub last_updated: DateTime<Utc>,
    pub sources: Vec<String>,
}
