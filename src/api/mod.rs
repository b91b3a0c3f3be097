//! HTTP surface: the OpenAI-compatible client router and the admin router,
//! served on separate ports. Tracing and request-id middleware are attached
//! in `main`.

pub mod admin;
pub mod admin_auth;
pub mod client;
pub mod health;
pub mod request_id;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Router for the OpenAI-compatible client port.
pub fn client_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/v1/models", get(client::list_models))
        .route("/v1/chat/completions", post(client::chat_completions))
        .route("/v1/responses", post(client::responses))
        .with_state(state)
}

/// Router for the admin port. Everything under `/admin` sits behind the
/// bearer-token middleware; the health probe does not.
pub fn admin_router(state: Arc<AppState>) -> Router {
    let admin_routes = Router::new()
        .route(
            "/admin/tokens",
            get(admin::list_tokens)
                .post(admin::add_token)
                .put(admin::update_token)
                .delete(admin::delete_token),
        )
        .route("/admin/tokens/refresh", post(admin::refresh_token))
        .route("/admin/tokens/reload", post(admin::reload_tokens))
        .route("/admin/rotation", get(admin::get_rotation).put(admin::set_rotation))
        .route("/admin/quotas", get(admin::quotas))
        .route("/admin/oauth/url", get(admin::oauth_url))
        .route("/admin/oauth/exchange", post(admin::oauth_exchange))
        .route("/admin/config/reload", post(admin::reload_config))
        .route("/admin/health", get(admin::health))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            admin_auth::require_admin_token,
        ));

    Router::new()
        .route("/healthz", get(health::healthz))
        .merge(admin_routes)
        .with_state(state)
}
