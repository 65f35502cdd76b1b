//! In-memory repository implementations for testing and embedded use.

use std::collections::HashMap;

use anyhow::Result;
use tokio::sync::Mutex;

use crate::models::{AddressEntry, PortfolioSnapshot};

use super::{AddressRepository, PortfolioRepository};

/// In-memory portfolio store.
pub struct MemoryPortfolioRepository {
    portfolios: Mutex<HashMap<String, PortfolioSnapshot>>,
}

impl MemoryPortfolioRepository {
    pub fn new() -> Self {
        Self {
            portfolios: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryPortfolioRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PortfolioRepository for MemoryPortfolioRepository {
    async fn save(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        let mut portfolios = self.portfolios.lock().await;
        portfolios.insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<PortfolioSnapshot>> {
        let portfolios = self.portfolios.lock().await;
        Ok(portfolios.get(id).cloned())
    }

    async fn find_by_user_id(&self, user_id: &str) -> Result<Vec<PortfolioSnapshot>> {
        let portfolios = self.portfolios.lock().await;
        Ok(portfolios
            .values()
            .filter(|p| p.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut portfolios = self.portfolios.lock().await;
        Ok(portfolios.remove(id).is_some())
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let portfolios = self.portfolios.lock().await;
        Ok(portfolios.contains_key(id))
    }
}

/// In-memory address store keyed by the `(chain, address)` identity pair.
pub struct MemoryAddressRepository {
    entries: Mutex<HashMap<(String, String), AddressEntry>>,
}

impl MemoryAddressRepository {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryAddressRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AddressRepository for MemoryAddressRepository {
    async fn save(&self, entry: &AddressEntry) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            (entry.chain.clone(), entry.address.clone()),
            entry.clone(),
        );
        Ok(())
    }

    async fn remove(&self, chain: &str, address: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        Ok(entries
            .remove(&(chain.to_string(), address.to_string()))
            .is_some())
    }

    async fn find_by_chain(&self, chain: &str) -> Result<Vec<AddressEntry>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .values()
            .filter(|e| e.chain == chain)
            .cloned()
            .collect())
    }

    async fn find_all(&self) -> Result<Vec<AddressEntry>> {
        let entries = self.entries.lock().await;
        Ok(entries.values().cloned().collect())
    }

    async fn find_by_label(&self, label: &str) -> Result<Vec<AddressEntry>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .values()
            .filter(|e| e.label.as_deref() == Some(label))
            .cloned()
            .collect())
    }

    async fn update(&self, entry: &AddressEntry) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let key = (entry.chain.clone(), entry.address.clone());
        if entries.contains_key(&key) {
            entries.insert(key, entry.clone());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.clear();
        Ok(())
    }
}
