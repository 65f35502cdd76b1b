//! JSON file-based portfolio repository.
//!
//! Directory structure:
//! ```text
//! data/
//!   portfolios/
//!     {id}.json   # one snapshot per portfolio
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::warn;

use crate::models::PortfolioSnapshot;

use super::PortfolioRepository;

pub struct JsonFilePortfolioRepository {
    base_path: PathBuf,
}

impl JsonFilePortfolioRepository {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn portfolios_dir(&self) -> PathBuf {
        self.base_path.join("portfolios")
    }

    fn portfolio_file(&self, id: &str) -> Result<PathBuf> {
        ensure_safe_id(id)?;
        Ok(self.portfolios_dir().join(format!("{id}.json")))
    }

    async fn read_snapshot(&self, path: &Path) -> Result<PortfolioSnapshot> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// Portfolio ids become file names, so they must be plain path segments.
fn ensure_safe_id(id: &str) -> Result<()> {
    let safe = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains('/')
        && !id.contains('\\')
        && !id.contains('\0');
    if !safe {
        anyhow::bail!("Portfolio id is not a safe path segment: {id:?}");
    }
    Ok(())
}

#[async_trait::async_trait]
impl PortfolioRepository for JsonFilePortfolioRepository {
    async fn save(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        let path = self.portfolio_file(&snapshot.id)?;
        fs::create_dir_all(self.portfolios_dir())
            .await
            .context("Failed to create portfolios directory")?;

        let json = serde_json::to_string_pretty(snapshot)
            .context("Failed to serialize portfolio snapshot")?;

        // Write then rename, so a crash mid-write never clobbers the old snapshot.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<PortfolioSnapshot>> {
        let path = self.portfolio_file(id)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(self.read_snapshot(&path).await?))
    }

    async fn find_by_user_id(&self, user_id: &str) -> Result<Vec<PortfolioSnapshot>> {
        let dir = self.portfolios_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to list {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_snapshot(&path).await {
                Ok(snapshot) if snapshot.user_id.as_deref() == Some(user_id) => {
                    snapshots.push(snapshot);
                }
                Ok(_) => {}
                Err(err) => {
                    // A single corrupt file should not hide the rest.
                    warn!(path = %path.display(), error = %err, "skipping unreadable snapshot");
                }
            }
        }
        Ok(snapshots)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let path = self.portfolio_file(id)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)
            .await
            .with_context(|| format!("Failed to delete {}", path.display()))?;
        Ok(true)
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.portfolio_file(id)?.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Portfolio;

    #[tokio::test]
    async fn test_save_and_load() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let repo = JsonFilePortfolioRepository::new(dir.path());

        let portfolio = Portfolio::new("portfolio_1", Some("user-9".to_string()));
        repo.save(&portfolio.to_snapshot("USD")).await?;

        assert!(repo.exists("portfolio_1").await?);
        let found = repo.find_by_id("portfolio_1").await?.unwrap();
        assert_eq!(found.id, "portfolio_1");
        assert_eq!(found.user_id.as_deref(), Some("user-9"));

        let by_user = repo.find_by_user_id("user-9").await?;
        assert_eq!(by_user.len(), 1);

        assert!(repo.delete("portfolio_1").await?);
        assert!(!repo.exists("portfolio_1").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_portfolio_is_none() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let repo = JsonFilePortfolioRepository::new(dir.path());
        assert!(repo.find_by_id("nope").await?.is_none());
        assert!(!repo.delete("nope").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_unsafe_ids_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = JsonFilePortfolioRepository::new(dir.path());

        for id in ["../escape", "a/b", "", ".."] {
            assert!(repo.find_by_id(id).await.is_err(), "id {id:?} accepted");
        }
    }

    #[tokio::test]
    async fn test_corrupt_file_skipped_in_user_scan() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let repo = JsonFilePortfolioRepository::new(dir.path());

        let portfolio = Portfolio::new("good", Some("u".to_string()));
        repo.save(&portfolio.to_snapshot("USD")).await?;

        let bad = dir.path().join("portfolios").join("bad.json");
        tokio::fs::write(&bad, "{not json").await?;

        let found = repo.find_by_user_id("u").await?;
        assert_eq!(found.len(), 1);
        Ok(())
    }
}
