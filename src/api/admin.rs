//! Admin surface: token CRUD, refresh/reload, rotation policy, per-account
//! quota inspection, OAuth onboarding, and config reload.
//!
//! Every response uses the `{ success, data?, message? }` envelope. Note the
//! quota endpoint's status discipline: an expired *upstream* credential that
//! cannot be refreshed is a 400, never a 401 — 401 is reserved for the admin
//! session itself (see `admin_auth`), and conflating the two auth domains
//! makes dashboards log operators out over a dead Google token.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    account::{Account, RotationStrategy},
    config::Config,
    error::GatewayError,
    pool::{NewToken, TokenUpdate},
    quota::{to_beijing_time, ModelQuota},
    state::AppState,
};

fn ok(data: Value) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

fn ok_message(message: &str) -> Response {
    Json(json!({ "success": true, "message": message })).into_response()
}

fn fail(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "success": false, "message": message }))).into_response()
}

fn fail_err(err: GatewayError) -> Response {
    fail(err.status(), err.to_string())
}

// ---------------------------------------------------------------------------
// Token CRUD
// ---------------------------------------------------------------------------

pub async fn list_tokens(State(state): State<Arc<AppState>>) -> Response {
    let accounts = state.pool.get_token_list().await;
    ok(json!(accounts))
}

pub async fn add_token(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewToken>,
) -> Response {
    match state.pool.add_token(new).await {
        Ok(account) => {
            info!(email = ?account.email, "token added");
            ok(json!(account))
        }
        Err(e) => fail_err(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateTokenBody {
    pub refresh_token: String,
    #[serde(flatten)]
    pub update: TokenUpdate,
}

pub async fn update_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateTokenBody>,
) -> Response {
    match state.pool.update_token(&body.refresh_token, body.update).await {
        Ok(account) => ok(json!(account)),
        Err(e) => fail_err(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenIdentity {
    pub refresh_token: String,
}

pub async fn delete_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TokenIdentity>,
) -> Response {
    match state.pool.delete_token(&body.refresh_token).await {
        Ok(()) => {
            state.quota.remove(&body.refresh_token);
            ok_message("token deleted")
        }
        Err(e) => fail_err(e),
    }
}

pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TokenIdentity>,
) -> Response {
    match state.pool.refresh(&body.refresh_token).await {
        Ok(account) => ok(json!(account)),
        Err(e) => fail_err(e),
    }
}

pub async fn reload_tokens(State(state): State<Arc<AppState>>) -> Response {
    match state.pool.reload().await {
        Ok(count) => ok(json!({ "count": count })),
        Err(e) => fail_err(e),
    }
}

// ---------------------------------------------------------------------------
// Rotation policy
// ---------------------------------------------------------------------------

pub async fn get_rotation(State(state): State<Arc<AppState>>) -> Response {
    ok(json!(state.pool.get_rotation_config().await))
}

#[derive(Debug, Deserialize)]
pub struct RotationBody {
    pub strategy: Option<String>,
    pub request_count: Option<u32>,
}

pub async fn set_rotation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RotationBody>,
) -> Response {
    let strategy = match body.strategy.as_deref() {
        Some(raw) => match raw.parse::<RotationStrategy>() {
            Ok(strategy) => Some(strategy),
            Err(message) => return fail(StatusCode::BAD_REQUEST, message),
        },
        None => None,
    };
    match state
        .pool
        .update_rotation_config(strategy, body.request_count)
        .await
    {
        Ok(settings) => ok(json!(settings)),
        Err(e) => fail_err(e),
    }
}

// ---------------------------------------------------------------------------
// Quotas
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct QuotaQuery {
    #[serde(default)]
    pub force: bool,
}

fn expand_models(models: &HashMap<String, ModelQuota>) -> Value {
    let expanded: serde_json::Map<String, Value> = models
        .iter()
        .map(|(name, q)| {
            (
                name.clone(),
                json!({
                    "remaining": q.remaining,
                    "resetTime": to_beijing_time(q.reset_epoch),
                    "resetTimeRaw": q.reset_epoch,
                }),
            )
        })
        .collect();
    Value::Object(expanded)
}

fn quota_row(account: &Account, models: Value, cached: bool) -> Value {
    json!({
        "refreshToken": account.refresh_token,
        "email": account.email,
        "projectId": account.project_id,
        "enabled": account.enabled,
        "hasQuota": account.has_quota,
        "cached": cached,
        "models": models,
    })
}

/// Per-account quota snapshots, served from the cache unless `force=true`.
///
/// Cache misses trigger a live model listing, refreshing the account's
/// access token first when it is near expiry. A credential that cannot be
/// refreshed fails the whole request with 400.
pub async fn quotas(
    State(state): State<Arc<AppState>>,
    Query(query): Query<QuotaQuery>,
) -> Response {
    let accounts = state.pool.get_token_list().await;
    let mut rows = Vec::with_capacity(accounts.len());

    for account in &accounts {
        if !query.force {
            if let Some(entry) = state.quota.get(&account.refresh_token) {
                rows.push(quota_row(account, expand_models(&entry.models), true));
                continue;
            }
        }

        let account = if account.is_expired() {
            match state.pool.refresh(&account.refresh_token).await {
                Ok(account) => account,
                Err(e) => {
                    return fail(
                        StatusCode::BAD_REQUEST,
                        format!("upstream credential expired and refresh failed: {e}"),
                    );
                }
            }
        } else {
            account.clone()
        };

        match state.upstream.fetch_models(&account).await {
            Ok(models) => {
                let snapshot: HashMap<String, ModelQuota> = models
                    .iter()
                    .filter_map(|m| {
                        m.quota.map(|q| {
                            (m.name.clone(), ModelQuota { remaining: q.r, reset_epoch: q.t })
                        })
                    })
                    .collect();
                state.quota.update(&account.refresh_token, snapshot.clone());
                rows.push(quota_row(&account, expand_models(&snapshot), false));
            }
            Err(e) => {
                warn!(email = ?account.email, error = %e, "quota lookup failed");
                return fail_err(e);
            }
        }
    }
    ok(json!(rows))
}

// ---------------------------------------------------------------------------
// OAuth onboarding
// ---------------------------------------------------------------------------

const DEFAULT_CALLBACK_PORT: u16 = 8085;

#[derive(Debug, Default, Deserialize)]
pub struct OAuthUrlQuery {
    pub port: Option<u16>,
}

pub async fn oauth_url(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OAuthUrlQuery>,
) -> Response {
    let oauth_state = uuid::Uuid::new_v4().to_string();
    let port = query.port.unwrap_or(DEFAULT_CALLBACK_PORT);
    match state.oauth.auth_url(port, &oauth_state) {
        Ok(url) => ok(json!({ "url": url, "state": oauth_state, "port": port })),
        Err(e) => fail_err(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct OAuthExchangeBody {
    pub code: String,
    pub port: Option<u16>,
}

pub async fn oauth_exchange(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OAuthExchangeBody>,
) -> Response {
    let port = body.port.unwrap_or(DEFAULT_CALLBACK_PORT);
    let account = match state.oauth.authenticate(&state.upstream, &body.code, port).await {
        Ok(account) => account,
        Err(e) => return fail_err(e),
    };
    if let Err(e) = state.pool.insert(account.clone()).await {
        return fail_err(e);
    }
    info!(email = ?account.email, has_quota = account.has_quota, "account onboarded");
    ok(json!({
        "account": account,
        // True when the eligibility probe was skipped over a failure and a
        // synthetic project id was substituted.
        "fallbackMode": !account.has_quota,
    }))
}

// ---------------------------------------------------------------------------
// Health + config reload
// ---------------------------------------------------------------------------

/// Authenticated health view with pool counts; the unauthenticated probe
/// lives at `/healthz`.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let accounts = state.pool.get_token_list().await;
    let enabled = accounts.iter().filter(|a| a.enabled).count();
    ok(json!({
        "accounts": accounts.len(),
        "enabled": enabled,
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

pub async fn reload_config(State(state): State<Arc<AppState>>) -> Response {
    match Config::load(&state.config_path) {
        Ok(config) => {
            state.swap_config(config);
            info!("config reloaded via admin API");
            ok_message("config reloaded")
        }
        Err(e) => fail(StatusCode::BAD_REQUEST, format!("config reload failed: {e}")),
    }
}
