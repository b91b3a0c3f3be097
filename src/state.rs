//! Shared state handed to every handler on both routers.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::{
    config::Config,
    oauth::OAuthClient,
    pool::TokenPool,
    quota::QuotaCache,
    store::AccountStore,
    upstream::UpstreamClient,
};

pub struct AppState {
    /// Hot-swappable config: the file watcher replaces the `Arc` wholesale,
    /// in-flight requests keep the snapshot they started with.
    config: RwLock<Arc<Config>>,
    pub config_path: PathBuf,
    pub pool: Arc<TokenPool>,
    pub quota: Arc<QuotaCache>,
    pub upstream: Arc<UpstreamClient>,
    pub oauth: Arc<OAuthClient>,
    /// Resolved admin bearer token; `None` disables admin auth.
    pub admin_token: Option<String>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config, config_path: PathBuf) -> anyhow::Result<Arc<Self>> {
        let oauth = Arc::new(OAuthClient::new(&config)?);
        let upstream = Arc::new(UpstreamClient::new(&config)?);
        let store = Arc::new(AccountStore::new(&config.gateway.accounts_path));
        let pool = Arc::new(TokenPool::new(store, Arc::clone(&oauth), config.rotation));
        let admin_token = config
            .gateway
            .admin_token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|v| !v.is_empty());

        Ok(Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            config_path,
            pool,
            quota: Arc::new(QuotaCache::new()),
            upstream,
            oauth,
            admin_token,
            started_at: Instant::now(),
        }))
    }

    /// Current config snapshot.
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read().expect("config lock poisoned"))
    }

    /// Replace the config snapshot (file watcher and admin reload).
    pub fn swap_config(&self, config: Config) {
        *self.config.write().expect("config lock poisoned") = Arc::new(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<AppState> {
        let mut config: Config = toml::from_str("").unwrap();
        config.gateway.accounts_path = std::env::temp_dir()
            .join(format!("ggw-state-{}.json", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .into_owned();
        AppState::new(config, PathBuf::from("/dev/null")).unwrap()
    }

    #[test]
    fn swap_config_replaces_the_snapshot() {
        let state = state();
        assert_eq!(state.config().gateway.heartbeat_interval_ms, 15_000);

        let mut updated: Config = toml::from_str("").unwrap();
        updated.gateway.heartbeat_interval_ms = 30_000;
        state.swap_config(updated);
        assert_eq!(state.config().gateway.heartbeat_interval_ms, 30_000);
    }

    #[test]
    fn admin_token_resolves_from_the_named_env_var() {
        std::env::set_var("GGW_TEST_ADMIN_TOKEN", "sekrit");
        let mut config: Config = toml::from_str("").unwrap();
        config.gateway.admin_token_env = Some("GGW_TEST_ADMIN_TOKEN".into());
        let state = AppState::new(config, PathBuf::from("/dev/null")).unwrap();
        assert_eq!(state.admin_token.as_deref(), Some("sekrit"));
    }
}
