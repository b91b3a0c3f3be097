//! Account records and rotation policy types.
//!
//! An [`Account`] is one OAuth credential set plus derived metadata. Its
//! `refresh_token` is the stable identity key: lookups, updates, refresh
//! deduplication, and deletion all key on it, and it never changes over the
//! account's lifetime — refreshes overwrite `access_token`/`expires_in`/
//! `issued_at` in place.

use serde::{Deserialize, Serialize};

/// How close to expiry (ms) an access token may be before callers should
/// refresh it proactively — 5 minutes.
pub const TOKEN_REFRESH_BUFFER_MS: i64 = 5 * 60 * 1000;

/// One OAuth-backed credential set held in the pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub access_token: String,

    /// Stable identity key, unique across the pool.
    pub refresh_token: String,

    /// Access-token lifetime in seconds, as reported by the token endpoint.
    pub expires_in: u64,

    /// Epoch milliseconds at which `access_token` was issued.
    pub issued_at: i64,

    /// Disabled accounts stay persisted but are skipped by rotation.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// False when the eligibility probe failed during onboarding and a
    /// synthetic project id was substituted.
    #[serde(default = "default_has_quota")]
    pub has_quota: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_has_quota() -> bool {
    true
}

impl Account {
    /// True when the access token expires within [`TOKEN_REFRESH_BUFFER_MS`]
    /// of `now_ms`.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.issued_at + (self.expires_in as i64) * 1000 <= now_ms + TOKEN_REFRESH_BUFFER_MS
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp_millis())
    }
}

/// Policy governing which enabled account `get_token()` returns next.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    /// Every call advances the cursor by one, wrapping.
    #[default]
    RoundRobin,

    /// Stay on the current account until a caller reports exhaustion
    /// (an upstream 429 on the retry path), then advance.
    QuotaExhausted,

    /// Stay on the current account for N consecutive calls, then advance.
    RequestCount,
}

impl std::fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::RoundRobin => "round_robin",
            Self::QuotaExhausted => "quota_exhausted",
            Self::RequestCount => "request_count",
        })
    }
}

impl std::str::FromStr for RotationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "quota_exhausted" => Ok(Self::QuotaExhausted),
            "request_count" => Ok(Self::RequestCount),
            other => Err(format!(
                "invalid strategy `{other}`, valid values: round_robin, quota_exhausted, request_count"
            )),
        }
    }
}
