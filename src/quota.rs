//! Per-account quota cache with lazy TTL expiry.
//!
//! Quota snapshots come from the upstream model-listing call and are cached
//! per account identity for five minutes. Expiry is lazy — `get` checks the
//! entry's age and treats a stale hit as a miss — plus an hourly background
//! sweep that drops expired entries outright so identities removed from the
//! pool don't accumulate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How long a cached snapshot stays fresh.
pub const QUOTA_CACHE_TTL_MS: i64 = 5 * 60 * 1000;

/// Interval of the background sweep over expired entries.
pub const QUOTA_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Remaining quota for one model on one account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelQuota {
    pub remaining: f64,

    /// Quota reset time as epoch seconds.
    pub reset_epoch: i64,
}

/// One account's quota snapshot across all models.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuotaEntry {
    /// Epoch milliseconds when the snapshot was taken.
    pub last_updated: i64,

    pub models: HashMap<String, ModelQuota>,
}

/// Concurrent quota cache keyed by account identity (refresh token).
#[derive(Default)]
pub struct QuotaCache {
    entries: DashMap<String, QuotaEntry>,
}

impl QuotaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh snapshot for `identity`, or `None` on a miss or a stale hit.
    pub fn get(&self, identity: &str) -> Option<QuotaEntry> {
        self.get_at(identity, Utc::now().timestamp_millis())
    }

    fn get_at(&self, identity: &str, now_ms: i64) -> Option<QuotaEntry> {
        let entry = self.entries.get(identity)?;
        if now_ms - entry.last_updated >= QUOTA_CACHE_TTL_MS {
            return None;
        }
        Some(entry.clone())
    }

    /// Store a snapshot taken just now.
    pub fn update(&self, identity: &str, models: HashMap<String, ModelQuota>) {
        self.entries.insert(
            identity.to_string(),
            QuotaEntry { last_updated: Utc::now().timestamp_millis(), models },
        );
    }

    pub fn remove(&self, identity: &str) {
        self.entries.remove(identity);
    }

    /// Drop every entry older than the TTL. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now().timestamp_millis())
    }

    fn sweep_at(&self, now_ms: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now_ms - entry.last_updated < QUOTA_CACHE_TTL_MS);
        before - self.entries.len()
    }
}

/// Periodic sweep task. Runs for the lifetime of the process.
pub fn spawn_sweeper(cache: Arc<QuotaCache>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(QUOTA_SWEEP_INTERVAL);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            let removed = cache.sweep();
            if removed > 0 {
                debug!(removed, "quota cache swept");
            }
        }
    });
}

/// Render an epoch-seconds reset time as a Beijing-time (UTC+8) wall clock
/// string, `YYYY-MM-DD HH:MM:SS`.
pub fn to_beijing_time(epoch_seconds: i64) -> String {
    let beijing = FixedOffset::east_opt(8 * 3600).expect("UTC+8 is a valid offset");
    match Utc.timestamp_opt(epoch_seconds, 0) {
        chrono::LocalResult::Single(dt) => {
            dt.with_timezone(&beijing).format("%Y-%m-%d %H:%M:%S").to_string()
        }
        _ => String::new(),
    }
}
