//! Configuration types for gemini-gateway.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults.
//!
//! # Example
//! ```toml
//! [gateway]
//! client_port = 8080
//! admin_port  = 8081
//! accounts_path = "/var/lib/gemini-gateway/accounts.json"
//!
//! [upstream]
//! base_url = "https://daily-cloudcode-pa.sandbox.googleapis.com"
//!
//! [oauth]
//! client_id_env     = "GGW_OAUTH_CLIENT_ID"
//! client_secret_env = "GGW_OAUTH_CLIENT_SECRET"
//!
//! [rotation]
//! strategy = "round_robin"
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::account::RotationStrategy;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub oauth: OAuthConfig,

    /// Default generation parameters, merged under any the caller omits.
    #[serde(default)]
    pub defaults: GenerationDefaults,

    /// Account rotation policy applied by the token pool.
    #[serde(default)]
    pub rotation: RotationSettings,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.gateway.client_port != 0, "gateway.client_port must be non-zero");
        anyhow::ensure!(self.gateway.admin_port != 0, "gateway.admin_port must be non-zero");
        anyhow::ensure!(
            self.rotation.request_count >= 1,
            "rotation.request_count must be a positive integer"
        );
        anyhow::ensure!(
            self.gateway.heartbeat_interval_ms >= 1_000,
            "gateway.heartbeat_interval_ms must be at least 1000"
        );
        anyhow::ensure!(
            !self.upstream.base_url.is_empty(),
            "upstream.base_url must not be empty"
        );
        Ok(())
    }
}

/// Core gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port for the OpenAI-compatible client API (default: 8080).
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,

    /// Port for the admin API (default: 8081).
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,

    /// Path of the persisted account array (JSON).
    #[serde(default = "defaults::accounts_path")]
    pub accounts_path: String,

    /// SSE heartbeat interval in milliseconds (default: 15 000).
    ///
    /// A comment frame is emitted on this interval for the lifetime of every
    /// stream to defeat intermediary idle-connection timeouts.
    #[serde(default = "defaults::heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Additional attempts after an upstream 429 (default: 3). Each retry
    /// re-acquires a token from the pool before re-issuing the call.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Request timeout in milliseconds for short upstream calls — OAuth,
    /// model listing, the eligibility probe (default: 300 000). Generation
    /// calls never time out; their latency is unbounded.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Environment variable whose value is the Bearer token required for all
    /// admin API requests. Leave unset to disable admin authentication (only
    /// recommended when the admin port is strictly firewalled).
    #[serde(default)]
    pub admin_token_env: Option<String>,

    /// Forward upstream thought signatures to clients in reasoning and
    /// tool-call deltas (default: false).
    #[serde(default)]
    pub pass_signature_to_client: bool,

    /// System instruction applied when a request carries no system message.
    #[serde(default)]
    pub system_instruction: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty gateway config should deserialize")
    }
}

/// Endpoints of the generative backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Base URL — the `:streamGenerateContent`, `:generateContent`,
    /// `:fetchAvailableModels` and `:loadCodeAssist` paths are appended.
    #[serde(default = "defaults::upstream_base_url")]
    pub base_url: String,

    /// User-Agent header sent on every upstream call.
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty upstream config should deserialize")
    }
}

/// OAuth endpoints and client credentials.
///
/// Client id/secret are read from the environment variables named here, so
/// secrets never live in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OAuthConfig {
    #[serde(default = "defaults::oauth_auth_url")]
    pub auth_url: String,

    #[serde(default = "defaults::oauth_token_url")]
    pub token_url: String,

    #[serde(default = "defaults::oauth_userinfo_url")]
    pub userinfo_url: String,

    /// Environment variable holding the OAuth client id.
    #[serde(default = "defaults::client_id_env")]
    pub client_id_env: String,

    /// Environment variable holding the OAuth client secret.
    #[serde(default = "defaults::client_secret_env")]
    pub client_secret_env: String,

    /// Skip the eligibility probe during onboarding and synthesize a project
    /// id directly (default: false).
    #[serde(default)]
    pub skip_project_probe: bool,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty oauth config should deserialize")
    }
}

impl OAuthConfig {
    pub fn client_id(&self) -> Option<String> {
        std::env::var(&self.client_id_env).ok().filter(|v| !v.is_empty())
    }

    pub fn client_secret(&self) -> Option<String> {
        std::env::var(&self.client_secret_env).ok().filter(|v| !v.is_empty())
    }
}

/// Default generation parameters, merged under whatever the caller supplies.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct GenerationDefaults {
    #[serde(default = "defaults::max_tokens")]
    pub max_tokens: u64,

    #[serde(default = "defaults::temperature")]
    pub temperature: f64,

    #[serde(default = "defaults::top_p")]
    pub top_p: f64,

    #[serde(default = "defaults::top_k")]
    pub top_k: u64,

    /// Thinking budget applied when the caller enables thinking without
    /// specifying one.
    #[serde(default = "defaults::thinking_budget")]
    pub thinking_budget: u64,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        toml::from_str("").expect("empty defaults should deserialize")
    }
}

/// Startup rotation policy; mutable at runtime via `PUT /admin/rotation`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RotationSettings {
    #[serde(default)]
    pub strategy: RotationStrategy,

    /// Consecutive calls served by one account under the `request_count`
    /// strategy before the cursor advances.
    #[serde(default = "defaults::request_count")]
    pub request_count: u32,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self { strategy: RotationStrategy::default(), request_count: defaults::request_count() }
    }
}

mod defaults {
    pub fn client_port() -> u16 { 8080 }
    pub fn admin_port() -> u16 { 8081 }
    pub fn accounts_path() -> String { "/var/lib/gemini-gateway/accounts.json".into() }
    pub fn heartbeat_interval_ms() -> u64 { 15_000 }
    pub fn max_retries() -> u32 { 3 }
    pub fn timeout_ms() -> u64 { 300_000 }
    pub fn upstream_base_url() -> String {
        "https://daily-cloudcode-pa.sandbox.googleapis.com".into()
    }
    pub fn user_agent() -> String { "gemini-gateway/0.1".into() }
    pub fn oauth_auth_url() -> String { "https://accounts.google.com/o/oauth2/v2/auth".into() }
    pub fn oauth_token_url() -> String { "https://oauth2.googleapis.com/token".into() }
    pub fn oauth_userinfo_url() -> String { "https://www.googleapis.com/oauth2/v2/userinfo".into() }
    pub fn client_id_env() -> String { "GGW_OAUTH_CLIENT_ID".into() }
    pub fn client_secret_env() -> String { "GGW_OAUTH_CLIENT_SECRET".into() }
    pub fn max_tokens() -> u64 { 32_000 }
    pub fn temperature() -> f64 { 1.0 }
    pub fn top_p() -> f64 { 0.85 }
    pub fn top_k() -> u64 { 50 }
    pub fn thinking_budget() -> u64 { 1_024 }
    pub fn request_count() -> u32 { 10 }
}
