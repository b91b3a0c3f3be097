//! OAuth client: authorization URLs, code exchange, token refresh, and the
//! full onboarding flow that turns an authorization code into a pool-ready
//! [`Account`].
//!
//! Onboarding degrades gracefully: the email lookup and the project
//! eligibility probe are best-effort. A failed probe yields a synthetic
//! project id and `has_quota = false` instead of an error, so an account is
//! always produced once the code exchange itself succeeds.

use anyhow::Context;
use reqwest::Url;
use serde::Deserialize;
use tracing::warn;

use crate::{
    account::Account,
    config::{Config, OAuthConfig},
    error::GatewayError,
    upstream::UpstreamClient,
};

const SCOPES: &str = "https://www.googleapis.com/auth/cloud-platform \
                      https://www.googleapis.com/auth/userinfo.email \
                      https://www.googleapis.com/auth/userinfo.profile";

/// Token endpoint response. `refresh_token` is only present on the initial
/// code exchange, never on a refresh.
#[derive(Debug, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: u64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

pub struct OAuthClient {
    http: reqwest::Client,
    cfg: OAuthConfig,
}

impl OAuthClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.gateway.timeout_ms))
            .user_agent(config.upstream.user_agent.clone())
            .build()
            .context("building OAuth HTTP client")?;
        Ok(Self { http, cfg: config.oauth.clone() })
    }

    fn redirect_uri(port: u16) -> String {
        format!("http://localhost:{port}/oauth-callback")
    }

    /// Authorization URL for the browser step of onboarding.
    ///
    /// `access_type=offline` + `prompt=consent` force the token endpoint to
    /// return a refresh token on exchange.
    pub fn auth_url(&self, redirect_port: u16, state: &str) -> Result<String, GatewayError> {
        let client_id = self.cfg.client_id().ok_or_else(|| {
            GatewayError::Validation(format!("{} is not set", self.cfg.client_id_env))
        })?;
        let url = Url::parse_with_params(
            &self.cfg.auth_url,
            &[
                ("client_id", client_id.as_str()),
                ("redirect_uri", &Self::redirect_uri(redirect_port)),
                ("response_type", "code"),
                ("scope", SCOPES),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("building auth url: {e}")))?;
        Ok(url.to_string())
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_port: u16,
    ) -> Result<TokenGrant, GatewayError> {
        let response = self
            .http
            .post(&self.cfg.token_url)
            .form(&[
                ("client_id", self.cfg.client_id().unwrap_or_default()),
                ("client_secret", self.cfg.client_secret().unwrap_or_default()),
                ("code", code.to_string()),
                ("grant_type", "authorization_code".to_string()),
                ("redirect_uri", Self::redirect_uri(redirect_port)),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Validation(format!(
                "code exchange failed with HTTP {status}: {body}"
            )));
        }
        Ok(response.json().await?)
    }

    /// Exchange a refresh token for a fresh access token.
    pub async fn refresh(&self, refresh_token: &str) -> anyhow::Result<TokenGrant> {
        let response = self
            .http
            .post(&self.cfg.token_url)
            .form(&[
                ("client_id", self.cfg.client_id().unwrap_or_default()),
                ("client_secret", self.cfg.client_secret().unwrap_or_default()),
                ("refresh_token", refresh_token.to_string()),
                ("grant_type", "refresh_token".to_string()),
            ])
            .send()
            .await
            .context("token endpoint unreachable")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("token endpoint returned HTTP {status}: {body}");
        }
        response.json().await.context("parsing token response")
    }

    /// Best-effort email lookup. Failures are logged and swallowed.
    pub async fn fetch_email(&self, access_token: &str) -> Option<String> {
        #[derive(Deserialize)]
        struct UserInfo {
            email: Option<String>,
        }

        let result = self
            .http
            .get(&self.cfg.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match result {
            Ok(response) => match response.json::<UserInfo>().await {
                Ok(info) => info.email,
                Err(e) => {
                    warn!(error = %e, "userinfo response malformed — continuing without email");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "userinfo lookup failed — continuing without email");
                None
            }
        }
    }

    /// Full onboarding flow: exchange the code, look up the email, probe
    /// project eligibility, and assemble the account.
    ///
    /// Only the code exchange can fail. The probe stage never does: with
    /// `skip_project_probe` a synthetic project id is assigned directly
    /// (`has_quota = true`); otherwise a successful probe yields the real
    /// project id, and a failed or ineligible probe yields a synthetic id
    /// with `has_quota = false`.
    pub async fn authenticate(
        &self,
        upstream: &UpstreamClient,
        code: &str,
        redirect_port: u16,
    ) -> Result<Account, GatewayError> {
        let grant = self.exchange_code(code, redirect_port).await?;
        let refresh_token = grant.refresh_token.ok_or_else(|| {
            GatewayError::Validation(
                "token endpoint returned no refresh_token, re-consent is required".into(),
            )
        })?;

        let email = self.fetch_email(&grant.access_token).await;

        let (project_id, has_quota) = if self.cfg.skip_project_probe {
            (synthetic_project_id(), true)
        } else {
            match upstream.probe_project(&grant.access_token).await {
                Ok(Some(project_id)) => (project_id, true),
                Ok(None) => {
                    warn!("account has no provisioned project — marking as no-quota");
                    (synthetic_project_id(), false)
                }
                Err(e) => {
                    warn!(error = %e, "eligibility probe failed — marking as no-quota");
                    (synthetic_project_id(), false)
                }
            }
        };

        Ok(Account {
            access_token: grant.access_token,
            refresh_token,
            expires_in: grant.expires_in,
            issued_at: chrono::Utc::now().timestamp_millis(),
            enabled: true,
            project_id: Some(project_id),
            email,
            has_quota,
        })
    }
}

fn synthetic_project_id() -> String {
    format!("synthetic-{}", uuid::Uuid::new_v4())
}
