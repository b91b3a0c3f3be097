//! Bearer-token authentication for the admin router.
//!
//! When no admin token is configured the middleware passes everything
//! through; that mode is only meant for deployments where the admin port is
//! firewalled off.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use crate::state::AppState;

pub async fn require_admin_token(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        return next.run(req).await;
    };

    let supplied = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match supplied {
        Some(token) if token == expected => next.run(req).await,
        _ => {
            warn!(uri = %req.uri(), "admin request rejected: bad or missing bearer token");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "success": false, "message": "unauthorized" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::{body::Body, http::Request as HttpRequest, routing::get, Router};
    use tower::ServiceExt;

    fn state_with_token(token: Option<&str>) -> Arc<AppState> {
        if let Some(token) = token {
            std::env::set_var("GGW_TEST_AUTH_TOKEN", token);
        }
        let mut config: Config = toml::from_str("").unwrap();
        config.gateway.accounts_path = std::env::temp_dir()
            .join(format!("ggw-auth-{}.json", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .into_owned();
        config.gateway.admin_token_env = token.map(|_| "GGW_TEST_AUTH_TOKEN".into());
        AppState::new(config, "/dev/null".into()).unwrap()
    }

    fn app(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/admin/tokens", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(state, require_admin_token))
    }

    #[tokio::test]
    async fn rejects_missing_and_wrong_tokens() {
        let app = app(state_with_token(Some("right")));
        let response = app
            .clone()
            .oneshot(HttpRequest::get("/admin/tokens").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                HttpRequest::get("/admin/tokens")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn accepts_the_configured_token() {
        let app = app(state_with_token(Some("right")));
        let response = app
            .oneshot(
                HttpRequest::get("/admin/tokens")
                    .header("authorization", "Bearer right")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn passes_through_when_no_token_is_configured() {
        let app = app(state_with_token(None));
        let response = app
            .oneshot(HttpRequest::get("/admin/tokens").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
