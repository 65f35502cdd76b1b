use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a tracked address entered the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressSource {
    Manual,
    Wallet,
    Discovered,
}

/// A tracked address on a specific chain.
///
/// Identity is the `(chain, address)` pair; the address is stored in its
/// chain-normalized form (lower-cased for EVM chains, verbatim otherwise).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressEntry {
    pub chain: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    pub source: AddressSource,
    pub added_at: DateTime<Utc>,
}

impl AddressEntry {
    pub fn new(
        chain: impl Into<String>,
        address: impl Into<String>,
        source: AddressSource,
    ) -> Self {
        Self {
            chain: chain.into(),
            address: address.into(),
            label: None,
            tags: BTreeSet::new(),
            source,
            added_at: Utc::now(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}
