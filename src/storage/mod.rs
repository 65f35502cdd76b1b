//! Repository ports for portfolios and tracked addresses, plus the
//! in-process adapters the core ships with.
//!
//! Production backends live with the host; these traits are the only
//! contract the aggregation pipeline relies on.

mod json_file;
mod memory;

pub use json_file::JsonFilePortfolioRepository;
pub use memory::{MemoryAddressRepository, MemoryPortfolioRepository};

use anyhow::Result;

use crate::models::{AddressEntry, PortfolioSnapshot};

/// Persistence boundary for portfolio snapshots.
///
/// The aggregation service relies on `find_by_id` returning a snapshot with
/// a meaningful `last_updated` for cache-freshness checks.
#[async_trait::async_trait]
pub trait PortfolioRepository: Send + Sync {
    async fn save(&self, snapshot: &PortfolioSnapshot) -> Result<()>;
    async fn find_by_id(&self, id: &str) -> Result<Option<PortfolioSnapshot>>;
    async fn find_by_user_id(&self, user_id: &str) -> Result<Vec<PortfolioSnapshot>>;
    async fn delete(&self, id: &str) -> Result<bool>;
    async fn exists(&self, id: &str) -> Result<bool>;
}

/// Persistence boundary for the address registry.
#[async_trait::async_trait]
pub trait AddressRepository: Send + Sync {
    async fn save(&self, entry: &AddressEntry) -> Result<()>;
    /// Remove by identity pair. Returns whether anything was removed.
    async fn remove(&self, chain: &str, address: &str) -> Result<bool>;
    async fn find_by_chain(&self, chain: &str) -> Result<Vec<AddressEntry>>;
    async fn find_all(&self) -> Result<Vec<AddressEntry>>;
    async fn find_by_label(&self, label: &str) -> Result<Vec<AddressEntry>>;
    /// Replace an existing entry's metadata. Returns whether it existed.
    async fn update(&self, entry: &AddressEntry) -> Result<bool>;
    async fn clear(&self) -> Result<()>;
}
