//! Address registry: the canonical store of tracked addresses per chain,
//! with chain-aware format validation and wallet discovery.

use std::sync::{Arc, OnceLock};

use anyhow::Result;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{DomainEvent, EventBus, EventKind};
use crate::models::{AddressEntry, AddressSource};
use crate::storage::AddressRepository;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address {address:?} for chain {chain}")]
    InvalidAddress { chain: String, address: String },
}

/// Chains validated with the EVM address format.
pub fn is_evm_chain(chain: &str) -> bool {
    matches!(
        chain,
        "ethereum" | "polygon" | "arbitrum" | "optimism" | "binance"
    )
}

fn evm_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("valid regex"))
}

fn solana_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$").expect("valid regex"))
}

fn bitcoin_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // P2PKH (1...), P2SH (3...), and Bech32 (bc1...) forms.
    RE.get_or_init(|| {
        Regex::new(r"^(1[1-9A-HJ-NP-Za-km-z]{25,34}|3[1-9A-HJ-NP-Za-km-z]{25,34}|bc1[a-z0-9]{8,87})$")
            .expect("valid regex")
    })
}

/// Check an address against its chain's format. Unknown chains accept any
/// non-empty string shorter than 100 characters.
pub fn validate_address(chain: &str, address: &str) -> Result<(), AddressError> {
    let valid = if is_evm_chain(chain) {
        evm_regex().is_match(address)
    } else if chain == "solana" {
        solana_regex().is_match(address)
    } else if chain == "bitcoin" {
        bitcoin_regex().is_match(address)
    } else {
        !address.is_empty() && address.len() < 100
    };

    if valid {
        Ok(())
    } else {
        Err(AddressError::InvalidAddress {
            chain: chain.to_string(),
            address: address.to_string(),
        })
    }
}

/// Canonical storage form: EVM addresses lower-case, everything else
/// preserved byte-for-byte.
pub fn normalize_address(chain: &str, address: &str) -> String {
    if is_evm_chain(chain) {
        address.to_lowercase()
    } else {
        address.to_string()
    }
}

/// Map an EIP-155 chain id reported by a wallet to a chain tag.
pub fn chain_for_wallet_chain_id(chain_id: u64) -> String {
    match chain_id {
        1 => "ethereum".to_string(),
        137 => "polygon".to_string(),
        42161 => "arbitrum".to_string(),
        10 => "optimism".to_string(),
        56 => "binance".to_string(),
        other => other.to_string(),
    }
}

/// An account exposed by a connected wallet.
#[derive(Debug, Clone)]
pub struct WalletAccount {
    pub chain_id: u64,
    pub address: String,
}

/// Boundary to a connected wallet used for address discovery.
pub trait WalletConnection: Send + Sync {
    fn connected_accounts(&self) -> Vec<WalletAccount>;
}

/// Label/tag/source metadata attached when registering an address.
#[derive(Debug, Clone)]
pub struct AddressDetails {
    pub label: Option<String>,
    pub tags: Vec<String>,
    pub source: AddressSource,
}

impl Default for AddressDetails {
    fn default() -> Self {
        Self {
            label: None,
            tags: Vec::new(),
            source: AddressSource::Manual,
        }
    }
}

/// Registry service over the address repository port.
pub struct AddressRegistry {
    repository: Arc<dyn AddressRepository>,
    events: Option<EventBus>,
}

impl AddressRegistry {
    pub fn new(repository: Arc<dyn AddressRepository>) -> Self {
        Self {
            repository,
            events: None,
        }
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn publish(&self, kind: EventKind) {
        if let Some(events) = &self.events {
            events.publish(&DomainEvent::new(kind));
        }
    }

    /// Validate, normalize, and persist an address.
    pub async fn add_address(
        &self,
        chain: &str,
        address: &str,
        details: AddressDetails,
    ) -> Result<AddressEntry> {
        validate_address(chain, address)?;
        let normalized = normalize_address(chain, address);

        let mut entry = AddressEntry::new(chain, normalized.clone(), details.source);
        entry.label = details.label;
        entry.tags = details.tags.into_iter().collect();

        self.repository.save(&entry).await?;
        info!(chain = chain, address = %normalized, "address registered");
        self.publish(EventKind::AddressAdded {
            chain: chain.to_string(),
            address: normalized,
        });
        Ok(entry)
    }

    pub async fn remove_address(&self, chain: &str, address: &str) -> Result<bool> {
        let normalized = normalize_address(chain, address);
        let removed = self.repository.remove(chain, &normalized).await?;
        if removed {
            self.publish(EventKind::AddressRemoved {
                chain: chain.to_string(),
                address: normalized,
            });
        }
        Ok(removed)
    }

    /// Replace the label and tags on an existing entry. Returns whether the
    /// entry existed.
    pub async fn update_metadata(
        &self,
        chain: &str,
        address: &str,
        label: Option<String>,
        tags: Vec<String>,
    ) -> Result<bool> {
        let normalized = normalize_address(chain, address);
        let existing = self
            .repository
            .find_by_chain(chain)
            .await?
            .into_iter()
            .find(|e| e.address == normalized);

        let Some(mut entry) = existing else {
            return Ok(false);
        };

        entry.label = label;
        entry.tags = tags.into_iter().collect();
        let updated = self.repository.update(&entry).await?;
        if updated {
            self.publish(EventKind::AddressMetadataUpdated {
                chain: chain.to_string(),
                address: normalized,
            });
        }
        Ok(updated)
    }

    /// Check an address against its chain's format without persisting it.
    pub fn validate(&self, chain: &str, address: &str) -> Result<(), AddressError> {
        validate_address(chain, address)
    }

    /// All tracked addresses, optionally restricted to one chain.
    pub async fn addresses(&self, chain: Option<&str>) -> Result<Vec<AddressEntry>> {
        match chain {
            Some(chain) => self.repository.find_by_chain(chain).await,
            None => self.repository.find_all().await,
        }
    }

    pub async fn by_label(&self, label: &str) -> Result<Vec<AddressEntry>> {
        self.repository.find_by_label(label).await
    }

    /// Import the accounts a connected wallet exposes. Addresses that fail
    /// their chain's format check are skipped, and already-tracked
    /// addresses are left untouched. Returns the newly added entries.
    pub async fn discover_addresses(
        &self,
        wallet: &dyn WalletConnection,
    ) -> Result<Vec<AddressEntry>> {
        let mut added = Vec::new();

        for account in wallet.connected_accounts() {
            let chain = chain_for_wallet_chain_id(account.chain_id);
            if let Err(err) = validate_address(&chain, &account.address) {
                warn!(chain = %chain, error = %err, "skipping invalid wallet account");
                continue;
            }
            let normalized = normalize_address(&chain, &account.address);

            let already_tracked = self
                .repository
                .find_by_chain(&chain)
                .await?
                .iter()
                .any(|e| e.address == normalized);
            if already_tracked {
                debug!(chain = %chain, address = %normalized, "wallet account already tracked");
                continue;
            }

            let entry = AddressEntry::new(&chain, normalized.clone(), AddressSource::Wallet);
            self.repository.save(&entry).await?;
            self.publish(EventKind::AddressAdded {
                chain: chain.clone(),
                address: normalized,
            });
            added.push(entry);
        }

        info!(count = added.len(), "wallet discovery finished");
        Ok(added)
    }
}
