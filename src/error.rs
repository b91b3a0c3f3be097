//! Unified error taxonomy for gateway request handlers.
//!
//! [`GatewayError`] is the single error type that flows out of the pool, the
//! upstream client, and the translators. It converts into an appropriate HTTP
//! response automatically via [`IntoResponse`], so every handler that can
//! fail returns `Result<T, GatewayError>` and propagates errors with `?` —
//! no manual `map_err`, no boilerplate.
//!
//! Status mapping:
//!
//! | Variant | Status |
//! |---|---|
//! | `Validation` | 400 |
//! | `NotFound` | 404 |
//! | `RateLimited` | 429 |
//! | `RefreshFailed` | 502 |
//! | `NoTokenAvailable` | 503 |
//! | `Upstream` | upstream status (500 when unknown) |
//! | `Internal` | 500 |

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Everything that can go wrong while serving a gateway request.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed or missing required fields in an inbound request body.
    #[error("{0}")]
    Validation(String),

    /// Unknown refresh-token identity on a CRUD operation.
    #[error("{0}")]
    NotFound(String),

    /// The pool has no enabled account to hand out.
    #[error("no available token, add an account via the admin API first")]
    NoTokenAvailable,

    /// The upstream OAuth endpoint rejected a refresh. The stale account is
    /// retained in the pool; only the triggering caller sees this.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// Upstream returned HTTP 429. Drives retry + rotation; only surfaced
    /// when every retry attempt has been spent.
    #[error("upstream rate limited: {message}")]
    RateLimited { message: String },

    /// Any other upstream failure, passed through with its status.
    #[error("upstream returned HTTP {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Internal failures (I/O, JSON, unexpected states).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// The HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NoTokenAvailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::RefreshFailed(_) => StatusCode::BAD_GATEWAY,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error type for the JSON envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_request_error",
            Self::NotFound(_) => "not_found_error",
            Self::NoTokenAvailable => "no_token_available",
            Self::RefreshFailed(_) => "refresh_failed",
            Self::RateLimited { .. } => "rate_limit_error",
            Self::Upstream { .. } => "upstream_error",
            Self::Internal(_) => "api_error",
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        Self::Internal(anyhow::Error::new(e))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(anyhow::Error::new(e))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, "handler error");
        }
        (
            status,
            Json(json!({
                "error": {
                    "message": self.to_string(),
                    "type": self.kind(),
                    "code": status.as_u16(),
                }
            })),
        )
            .into_response()
    }
}
