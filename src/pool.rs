//! The token pool — owns the authoritative in-memory account list.
//!
//! The pool hands out accounts to the proxy per the active rotation strategy,
//! refreshes access tokens near expiry, and applies admin CRUD. Every
//! mutation is written back through the [`AccountStore`] merge contract so
//! the durable copy never loses accounts that are out of rotation.
//!
//! Refresh is *single-flight* per identity: the first caller for a given
//! `refresh_token` performs the upstream round trip, concurrent callers
//! subscribe to a broadcast channel and receive the same outcome. A failed
//! refresh leaves the stale record in the pool and surfaces the error only
//! to the callers of that refresh.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::{
    account::{Account, RotationStrategy},
    config::RotationSettings,
    error::GatewayError,
    oauth::OAuthClient,
    store::AccountStore,
};

/// Shared outcome of a single-flight refresh. `Err` carries the rendered
/// message because [`GatewayError`] is not `Clone`.
type RefreshOutcome = Result<Account, String>;

struct PoolInner {
    accounts: Vec<Account>,
    /// Cursor into the *enabled-account ordering*, not the raw list.
    cursor: usize,
    /// Calls already served at the current cursor (request_count strategy).
    uses_on_cursor: u32,
    rotation: RotationSettings,
}

impl PoolInner {
    fn enabled_indices(&self) -> Vec<usize> {
        self.accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.enabled)
            .map(|(i, _)| i)
            .collect()
    }
}

pub struct TokenPool {
    store: Arc<AccountStore>,
    oauth: Arc<OAuthClient>,
    inner: Mutex<PoolInner>,
    inflight: Mutex<HashMap<String, broadcast::Sender<RefreshOutcome>>>,
}

/// Fields accepted by `POST /admin/tokens`. Only `access_token` and
/// `refresh_token` are required.
#[derive(Debug, Deserialize)]
pub struct NewToken {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub issued_at: Option<i64>,
    pub enabled: Option<bool>,
    pub project_id: Option<String>,
    pub email: Option<String>,
}

/// Partial update applied by `PUT /admin/tokens/{refresh_token}`. Absent
/// fields are left unchanged; identity cannot be edited.
#[derive(Debug, Default, Deserialize)]
pub struct TokenUpdate {
    pub enabled: Option<bool>,
    pub project_id: Option<String>,
    pub email: Option<String>,
    pub has_quota: Option<bool>,
}

impl TokenPool {
    pub fn new(store: Arc<AccountStore>, oauth: Arc<OAuthClient>, rotation: RotationSettings) -> Self {
        Self {
            store,
            oauth,
            inner: Mutex::new(PoolInner {
                accounts: Vec::new(),
                cursor: 0,
                uses_on_cursor: 0,
                rotation,
            }),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Populate the in-memory list from the store. Accounts with a refresh
    /// currently in flight are kept even when they vanished from disk, so a
    /// reload never drops an identity mid-refresh.
    pub async fn load(&self) -> Result<usize, GatewayError> {
        let from_disk = self.store.read_all().await?;
        let inflight = self.inflight.lock().await;
        let mut inner = self.inner.lock().await;

        let mut accounts = from_disk;
        for old in &inner.accounts {
            let still_refreshing = inflight.contains_key(&old.refresh_token);
            let present = accounts.iter().any(|a| a.refresh_token == old.refresh_token);
            if still_refreshing && !present {
                accounts.push(old.clone());
            }
        }

        inner.accounts = accounts;
        // Clamp rather than reset so hot reloads don't restart rotation.
        let enabled = inner.enabled_indices().len();
        if enabled > 0 {
            inner.cursor %= enabled;
        } else {
            inner.cursor = 0;
        }
        info!(count = inner.accounts.len(), "account pool loaded");
        Ok(inner.accounts.len())
    }

    /// Hot reload — same as [`load`](Self::load); in-flight refreshes and
    /// retries are unaffected because they re-look up by identity.
    pub async fn reload(&self) -> Result<usize, GatewayError> {
        self.load().await
    }

    /// Next account per the active rotation strategy.
    ///
    /// Only enabled accounts participate; disabled accounts never advance
    /// the cursor. Fails with [`GatewayError::NoTokenAvailable`] when the
    /// pool is empty or fully disabled.
    pub async fn get_token(&self) -> Result<Account, GatewayError> {
        let mut inner = self.inner.lock().await;
        let enabled = inner.enabled_indices();
        if enabled.is_empty() {
            return Err(GatewayError::NoTokenAvailable);
        }

        inner.cursor %= enabled.len();
        let picked = inner.accounts[enabled[inner.cursor]].clone();

        match inner.rotation.strategy {
            RotationStrategy::RoundRobin => {
                inner.cursor = (inner.cursor + 1) % enabled.len();
            }
            RotationStrategy::RequestCount => {
                inner.uses_on_cursor += 1;
                if inner.uses_on_cursor >= inner.rotation.request_count {
                    inner.cursor = (inner.cursor + 1) % enabled.len();
                    inner.uses_on_cursor = 0;
                }
            }
            // Advances only on an explicit exhaustion report.
            RotationStrategy::QuotaExhausted => {}
        }

        Ok(picked)
    }

    /// Exhaustion signal from the proxy's 429 retry path. Under the
    /// `quota_exhausted` strategy, moves the cursor past the named account;
    /// a no-op otherwise.
    pub async fn report_exhausted(&self, refresh_token: &str) {
        let mut inner = self.inner.lock().await;
        if inner.rotation.strategy != RotationStrategy::QuotaExhausted {
            return;
        }
        let enabled = inner.enabled_indices();
        if enabled.is_empty() {
            return;
        }
        let current = enabled[inner.cursor % enabled.len()];
        if inner.accounts[current].refresh_token == refresh_token {
            inner.cursor = (inner.cursor + 1) % enabled.len();
            inner.uses_on_cursor = 0;
            warn!(email = ?inner.accounts[current].email, "account reported exhausted — rotating");
        }
    }

    /// `get_token()` plus proactive refresh when the access token is within
    /// the expiry buffer. The ready-to-use account is returned.
    pub async fn acquire(&self) -> Result<Account, GatewayError> {
        let account = self.get_token().await?;
        if account.is_expired() {
            return self.refresh(&account.refresh_token).await;
        }
        Ok(account)
    }

    /// Snapshot of the in-memory list for admin display.
    pub async fn get_token_list(&self) -> Vec<Account> {
        self.inner.lock().await.accounts.clone()
    }

    /// Force-refresh the access token for one identity, deduplicated: if a
    /// refresh for the same `refresh_token` is already in flight, await its
    /// outcome instead of issuing a second upstream call.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Account, GatewayError> {
        let mut follower = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(refresh_token) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(refresh_token.to_string(), tx);
                    None
                }
            }
        };

        if let Some(rx) = follower.as_mut() {
            return match rx.recv().await {
                Ok(Ok(account)) => Ok(account),
                Ok(Err(message)) => Err(GatewayError::RefreshFailed(message)),
                Err(_) => Err(GatewayError::RefreshFailed("refresh aborted".into())),
            };
        }

        let outcome = self.perform_refresh(refresh_token).await;

        let mut inflight = self.inflight.lock().await;
        if let Some(tx) = inflight.remove(refresh_token) {
            let shared = match &outcome {
                Ok(account) => Ok(account.clone()),
                Err(e) => Err(e.to_string()),
            };
            // No receivers is fine — nobody else asked.
            let _ = tx.send(shared);
        }
        outcome
    }

    async fn perform_refresh(&self, refresh_token: &str) -> Result<Account, GatewayError> {
        let grant = match self.oauth.refresh(refresh_token).await {
            Ok(grant) => grant,
            Err(e) => {
                // Stale record stays in the pool; only this caller sees it.
                warn!(error = %e, "token refresh failed — keeping stale account");
                return Err(GatewayError::RefreshFailed(e.to_string()));
            }
        };

        let updated = {
            let mut inner = self.inner.lock().await;
            let account = inner
                .accounts
                .iter_mut()
                .find(|a| a.refresh_token == refresh_token)
                .ok_or_else(|| GatewayError::NotFound("token not found".into()))?;
            account.access_token = grant.access_token;
            account.expires_in = grant.expires_in;
            account.issued_at = chrono::Utc::now().timestamp_millis();
            account.clone()
        };

        self.store.merge(std::slice::from_ref(&updated)).await?;
        Ok(updated)
    }

    /// Insert (or replace, keyed by identity) a manually supplied account.
    pub async fn add_token(&self, new: NewToken) -> Result<Account, GatewayError> {
        let access_token = new
            .access_token
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GatewayError::Validation("access_token and refresh_token required".into()))?;
        let refresh_token = new
            .refresh_token
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GatewayError::Validation("access_token and refresh_token required".into()))?;

        let account = Account {
            access_token,
            refresh_token,
            expires_in: new.expires_in.unwrap_or(3600),
            issued_at: new.issued_at.unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            enabled: new.enabled.unwrap_or(true),
            project_id: new.project_id,
            email: new.email,
            has_quota: true,
        };

        self.insert(account.clone()).await?;
        Ok(account)
    }

    /// Insert a fully formed account (OAuth onboarding path). Replaces any
    /// existing record with the same identity.
    pub async fn insert(&self, account: Account) -> Result<(), GatewayError> {
        {
            let mut inner = self.inner.lock().await;
            match inner.accounts.iter_mut().find(|a| a.refresh_token == account.refresh_token) {
                Some(existing) => *existing = account.clone(),
                None => inner.accounts.push(account.clone()),
            }
        }
        self.store.merge(std::slice::from_ref(&account)).await?;
        Ok(())
    }

    /// Apply a partial field update by identity.
    pub async fn update_token(
        &self,
        refresh_token: &str,
        update: TokenUpdate,
    ) -> Result<Account, GatewayError> {
        let updated = {
            let mut inner = self.inner.lock().await;
            let account = inner
                .accounts
                .iter_mut()
                .find(|a| a.refresh_token == refresh_token)
                .ok_or_else(|| GatewayError::NotFound("token not found".into()))?;
            if let Some(enabled) = update.enabled {
                account.enabled = enabled;
            }
            if let Some(project_id) = update.project_id {
                account.project_id = Some(project_id);
            }
            if let Some(email) = update.email {
                account.email = Some(email);
            }
            if let Some(has_quota) = update.has_quota {
                account.has_quota = has_quota;
            }
            account.clone()
        };
        self.store.merge(std::slice::from_ref(&updated)).await?;
        Ok(updated)
    }

    /// Delete by identity — memory and durable copy both.
    pub async fn delete_token(&self, refresh_token: &str) -> Result<(), GatewayError> {
        let removed_from_memory = {
            let mut inner = self.inner.lock().await;
            let before = inner.accounts.len();
            inner.accounts.retain(|a| a.refresh_token != refresh_token);
            inner.accounts.len() != before
        };
        let removed_from_disk = self.store.remove(refresh_token).await?;
        if !removed_from_memory && !removed_from_disk {
            return Err(GatewayError::NotFound("token not found".into()));
        }
        Ok(())
    }

    pub async fn get_rotation_config(&self) -> RotationSettings {
        self.inner.lock().await.rotation
    }

    /// Change the rotation policy. The per-cursor counter resets on any
    /// strategy or parameter change.
    pub async fn update_rotation_config(
        &self,
        strategy: Option<RotationStrategy>,
        request_count: Option<u32>,
    ) -> Result<RotationSettings, GatewayError> {
        if let Some(count) = request_count {
            if count < 1 {
                return Err(GatewayError::Validation(
                    "request_count must be a positive integer".into(),
                ));
            }
        }
        let mut inner = self.inner.lock().await;
        if let Some(strategy) = strategy {
            inner.rotation.strategy = strategy;
        }
        if let Some(count) = request_count {
            inner.rotation.request_count = count;
        }
        inner.uses_on_cursor = 0;
        Ok(inner.rotation)
    }
}
