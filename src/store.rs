//! Durable account storage — a JSON array on disk.
//!
//! The store owns the persisted copy of the account list and nothing else;
//! it has no opinion on rotation or refresh. Reads are served from a
//! short-lived in-memory cache. Writes go through [`AccountStore::merge`],
//! which updates existing records by `refresh_token` and never drops records
//! absent from the in-memory view — disabled or out-of-rotation accounts
//! persist untouched.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::Mutex;
use tracing::warn;

use crate::account::Account;

/// How long a read may be served from cache.
const READ_CACHE_TTL: Duration = Duration::from_secs(5);

struct CacheState {
    accounts: Option<Vec<Account>>,
    read_at: Instant,
}

pub struct AccountStore {
    path: PathBuf,
    cache: Mutex<CacheState>,
}

impl AccountStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(CacheState { accounts: None, read_at: Instant::now() }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every persisted account (including disabled ones).
    ///
    /// A missing file is created as an empty array; a malformed file is
    /// logged and treated as empty rather than taking the gateway down.
    pub async fn read_all(&self) -> anyhow::Result<Vec<Account>> {
        let mut cache = self.cache.lock().await;
        if let Some(accounts) = &cache.accounts {
            if cache.read_at.elapsed() < READ_CACHE_TTL {
                return Ok(accounts.clone());
            }
        }

        let accounts = self.read_from_disk().await?;
        cache.accounts = Some(accounts.clone());
        cache.read_at = Instant::now();
        Ok(accounts)
    }

    /// Overwrite the persisted array and refresh the cache.
    pub async fn write_all(&self, accounts: &[Account]) -> anyhow::Result<()> {
        let mut cache = self.cache.lock().await;
        self.write_to_disk(accounts).await?;
        cache.accounts = Some(accounts.to_vec());
        cache.read_at = Instant::now();
        Ok(())
    }

    /// Merge the in-memory view back into the persisted array.
    ///
    /// Each record in `updates` replaces the persisted record with the same
    /// `refresh_token`; new identities are appended. Persisted records not
    /// present in `updates` are left exactly as they are.
    pub async fn merge(&self, updates: &[Account]) -> anyhow::Result<()> {
        let mut cache = self.cache.lock().await;
        let mut all = self.read_from_disk().await?;

        for update in updates {
            match all.iter_mut().find(|a| a.refresh_token == update.refresh_token) {
                Some(existing) => *existing = update.clone(),
                None => all.push(update.clone()),
            }
        }

        self.write_to_disk(&all).await?;
        cache.accounts = Some(all);
        cache.read_at = Instant::now();
        Ok(())
    }

    /// Remove one record by identity. Returns whether anything was removed.
    pub async fn remove(&self, refresh_token: &str) -> anyhow::Result<bool> {
        let mut cache = self.cache.lock().await;
        let mut all = self.read_from_disk().await?;
        let before = all.len();
        all.retain(|a| a.refresh_token != refresh_token);
        let removed = all.len() != before;
        if removed {
            self.write_to_disk(&all).await?;
            cache.accounts = Some(all);
            cache.read_at = Instant::now();
        }
        Ok(removed)
    }

    async fn read_from_disk(&self) -> anyhow::Result<Vec<Account>> {
        self.ensure_file().await?;
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        match serde_json::from_str::<Vec<Account>>(&data) {
            Ok(accounts) => Ok(accounts),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "account file malformed — treating as empty");
                Ok(Vec::new())
            }
        }
    }

    async fn write_to_disk(&self, accounts: &[Account]) -> anyhow::Result<()> {
        self.ensure_file().await?;
        let data = serde_json::to_string_pretty(accounts)?;
        tokio::fs::write(&self.path, data)
            .await
            .with_context(|| format!("writing {}", self.path.display()))
    }

    async fn ensure_file(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(());
        }
        tokio::fs::write(&self.path, "[]")
            .await
            .with_context(|| format!("creating {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("ggw-store-{}.json", uuid::Uuid::new_v4()))
    }

    fn account(refresh_token: &str) -> Account {
        Account {
            access_token: format!("access-{refresh_token}"),
            refresh_token: refresh_token.into(),
            expires_in: 3600,
            issued_at: 1_700_000_000_000,
            enabled: true,
            project_id: Some("project-a".into()),
            email: None,
            has_quota: true,
        }
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty_and_is_created() {
        let path = temp_path();
        let store = AccountStore::new(&path);
        assert!(store.read_all().await.unwrap().is_empty());
        assert!(path.exists());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn malformed_file_reads_as_empty() {
        let path = temp_path();
        std::fs::write(&path, "{not json").unwrap();
        let store = AccountStore::new(&path);
        assert!(store.read_all().await.unwrap().is_empty());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let path = temp_path();
        let store = AccountStore::new(&path);
        store.write_all(&[account("rt-1"), account("rt-2")]).await.unwrap();
        let read = store.read_all().await.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].refresh_token, "rt-1");
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn merge_updates_only_matching_identity() {
        let path = temp_path();
        let store = AccountStore::new(&path);
        let mut disabled = account("rt-disabled");
        disabled.enabled = false;
        store.write_all(&[account("rt-1"), disabled.clone()]).await.unwrap();

        // Update rt-1's project id; rt-disabled is not in the in-memory view.
        let mut updated = account("rt-1");
        updated.project_id = Some("project-b".into());
        store.merge(&[updated]).await.unwrap();

        let read = store.read_all().await.unwrap();
        assert_eq!(read.len(), 2);
        let rt1 = read.iter().find(|a| a.refresh_token == "rt-1").unwrap();
        assert_eq!(rt1.project_id.as_deref(), Some("project-b"));
        // The absent account kept every field, including `enabled = false`.
        let kept = read.iter().find(|a| a.refresh_token == "rt-disabled").unwrap();
        assert_eq!(kept, &disabled);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn merge_appends_new_identities() {
        let path = temp_path();
        let store = AccountStore::new(&path);
        store.write_all(&[account("rt-1")]).await.unwrap();
        store.merge(&[account("rt-new")]).await.unwrap();
        assert_eq!(store.read_all().await.unwrap().len(), 2);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn remove_deletes_by_identity() {
        let path = temp_path();
        let store = AccountStore::new(&path);
        store.write_all(&[account("rt-1"), account("rt-2")]).await.unwrap();
        assert!(store.remove("rt-1").await.unwrap());
        assert!(!store.remove("rt-missing").await.unwrap());
        let read = store.read_all().await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].refresh_token, "rt-2");
        let _ = std::fs::remove_file(path);
    }
}
