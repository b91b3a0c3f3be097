//! HTTP client for the generative backend.
//!
//! Every generation call is wrapped in the backend's envelope —
//! `{ "model", "project", "request" }` — with the per-account project id
//! injected here at call time, so translators build the inner `request`
//! once regardless of which account ends up serving it.
//!
//! Two reqwest clients are held: a default one with the configured timeout
//! for short calls (probe, model listing), and one with no timeout for
//! generation, whose latency is unbounded by design of the upstream API.

use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{account::Account, config::Config, error::GatewayError};

/// One semantic unit of upstream streaming output, already unwrapped from
/// the SSE/JSON chunk framing.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Visible answer text.
    Content(String),

    /// Thinking text, with the opaque thought signature when present.
    Reasoning { text: String, signature: Option<String> },

    /// A function call requested by the model. The backend assigns no call
    /// ids; translators generate their own.
    ToolCall { name: String, args: Value },

    /// Token accounting, usually on the final chunk.
    Usage(Usage),
}

/// Token usage in OpenAI field names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Aggregated result of a non-streaming generation call.
#[derive(Debug, Default)]
pub struct GenerateOutcome {
    pub content: String,
    pub reasoning: String,
    pub signature: Option<String>,
    pub tool_calls: Vec<(String, Value)>,
    pub usage: Option<Usage>,
}

/// A model row from the availability listing, quota snapshot included.
#[derive(Debug, Clone, Deserialize)]
pub struct AvailableModel {
    pub name: String,

    #[serde(default)]
    pub quota: Option<CompactQuota>,

    #[serde(default, rename = "displayName")]
    pub display_name: Option<String>,
}

/// Compact quota fields as the backend sends them: `r` is the remaining
/// fraction, `t` the reset time in epoch seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CompactQuota {
    pub r: f64,
    pub t: i64,
}

pub struct UpstreamClient {
    /// Timeout-bounded client for short calls.
    client: reqwest::Client,
    /// No overall timeout; generation latency is unbounded.
    long_client: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let user_agent = config.upstream.user_agent.clone();
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.gateway.timeout_ms))
            .user_agent(user_agent.clone())
            .build()?;
        let long_client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self {
            client,
            long_client,
            base_url: config.upstream.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, op: &str) -> String {
        format!("{}/v1internal:{op}", self.base_url)
    }

    fn envelope(account: &Account, model: &str, request: Value) -> Value {
        json!({
            "model": model,
            "project": account.project_id,
            "request": request,
        })
    }

    /// Eligibility probe used during onboarding. `Ok(None)` means the
    /// account authenticated fine but has no provisioned project.
    pub async fn probe_project(&self, access_token: &str) -> Result<Option<String>, GatewayError> {
        let response = self
            .client
            .post(self.endpoint("loadCodeAssist"))
            .bearer_auth(access_token)
            .json(&json!({ "metadata": { "pluginType": "GEMINI" } }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }
        let body: Value = response.json().await?;
        Ok(body
            .get("cloudaicompanionProject")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// List available models with their per-account quota snapshots.
    pub async fn fetch_models(&self, account: &Account) -> Result<Vec<AvailableModel>, GatewayError> {
        let response = self
            .client
            .post(self.endpoint("fetchAvailableModels"))
            .bearer_auth(&account.access_token)
            .json(&json!({ "project": account.project_id }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }

        #[derive(Deserialize)]
        struct Listing {
            #[serde(default)]
            models: Vec<AvailableModel>,
        }
        let listing: Listing = response.json().await?;
        Ok(listing.models)
    }

    /// Non-streaming generation. Aggregates the single response into a
    /// [`GenerateOutcome`].
    pub async fn generate(
        &self,
        account: &Account,
        model: &str,
        request: Value,
    ) -> Result<GenerateOutcome, GatewayError> {
        let response = self
            .long_client
            .post(self.endpoint("generateContent"))
            .bearer_auth(&account.access_token)
            .json(&Self::envelope(account, model, request))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }

        let body: Value = response.json().await?;
        let mut outcome = GenerateOutcome::default();
        for event in parse_chunk(&body) {
            match event {
                UpstreamEvent::Content(text) => outcome.content.push_str(&text),
                UpstreamEvent::Reasoning { text, signature } => {
                    outcome.reasoning.push_str(&text);
                    if signature.is_some() {
                        outcome.signature = signature;
                    }
                }
                UpstreamEvent::ToolCall { name, args } => outcome.tool_calls.push((name, args)),
                UpstreamEvent::Usage(usage) => outcome.usage = Some(usage),
            }
        }
        Ok(outcome)
    }

    /// Streaming generation. The HTTP status is checked before any event is
    /// emitted, so a 429 here is always safe to retry on another account.
    ///
    /// Returns a channel of already-parsed [`UpstreamEvent`]s; the channel
    /// closes when the upstream stream ends. Chunks that fail to parse are
    /// logged and skipped rather than aborting the stream.
    pub async fn stream_generate(
        &self,
        account: &Account,
        model: &str,
        request: Value,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, GatewayError> {
        let response = self
            .long_client
            .post(format!("{}?alt=sse", self.endpoint("streamGenerateContent")))
            .bearer_auth(&account.access_token)
            .json(&Self::envelope(account, model, request))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }

        let (tx, rx) = mpsc::channel::<UpstreamEvent>(32);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buf = String::new();
            while let Some(chunk) = stream.next().await {
                let chunk: Bytes = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(error = %e, "upstream stream aborted");
                        break;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() || data == "[DONE]" {
                        continue;
                    }
                    match serde_json::from_str::<Value>(data) {
                        Ok(value) => {
                            for event in parse_chunk(&value) {
                                if tx.send(event).await.is_err() {
                                    // Receiver gone; tear down the upstream read.
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "skipping unparseable stream chunk");
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

async fn upstream_error(response: reqwest::Response) -> GatewayError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    if status == 429 {
        GatewayError::RateLimited { message }
    } else {
        GatewayError::Upstream { status, message }
    }
}

/// Decompose one response chunk into semantic events. Handles both the
/// enveloped (`{"response": {...}}`) and bare chunk shapes.
fn parse_chunk(value: &Value) -> Vec<UpstreamEvent> {
    let response = value.get("response").unwrap_or(value);
    let mut events = Vec::new();

    let parts = response
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array);
    if let Some(parts) = parts {
        for part in parts {
            if let Some(call) = part.get("functionCall") {
                let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
                let args = call.get("args").cloned().unwrap_or(Value::Null);
                events.push(UpstreamEvent::ToolCall { name: name.to_string(), args });
            } else if let Some(text) = part.get("text").and_then(Value::as_str) {
                if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                    let signature = part
                        .get("thoughtSignature")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    events.push(UpstreamEvent::Reasoning { text: text.to_string(), signature });
                } else {
                    events.push(UpstreamEvent::Content(text.to_string()));
                }
            }
        }
    }

    if let Some(meta) = response.get("usageMetadata") {
        let prompt = meta.get("promptTokenCount").and_then(Value::as_u64);
        let completion = meta.get("candidatesTokenCount").and_then(Value::as_u64);
        let total = meta.get("totalTokenCount").and_then(Value::as_u64);
        if prompt.is_some() || completion.is_some() || total.is_some() {
            let prompt_tokens = prompt.unwrap_or(0);
            let completion_tokens = completion.unwrap_or(0);
            events.push(UpstreamEvent::Usage(Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: total.unwrap_or(prompt_tokens + completion_tokens),
            }));
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> UpstreamClient {
        let mut config: Config = toml::from_str("").unwrap();
        config.upstream.base_url = server.uri();
        UpstreamClient::new(&config).unwrap()
    }

    fn account() -> Account {
        Account {
            access_token: "at-1".into(),
            refresh_token: "rt-1".into(),
            expires_in: 3600,
            issued_at: chrono::Utc::now().timestamp_millis(),
            enabled: true,
            project_id: Some("project-1".into()),
            email: None,
            has_quota: true,
        }
    }

    // -----------------------------------------------------------------------
    // Chunk parsing
    // -----------------------------------------------------------------------

    #[test]
    fn parse_chunk_splits_text_thought_and_tool_parts() {
        let chunk = json!({
            "response": {
                "candidates": [{
                    "content": {
                        "parts": [
                            { "text": "pondering...", "thought": true, "thoughtSignature": "sig-1" },
                            { "text": "Hello" },
                            { "functionCall": { "name": "get_weather", "args": { "city": "Oslo" } } },
                        ]
                    }
                }],
                "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 5, "totalTokenCount": 15 }
            }
        });
        let events = parse_chunk(&chunk);
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            UpstreamEvent::Reasoning { text: "pondering...".into(), signature: Some("sig-1".into()) }
        );
        assert_eq!(events[1], UpstreamEvent::Content("Hello".into()));
        assert_eq!(
            events[2],
            UpstreamEvent::ToolCall { name: "get_weather".into(), args: json!({ "city": "Oslo" }) }
        );
        assert_eq!(
            events[3],
            UpstreamEvent::Usage(Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 })
        );
    }

    #[test]
    fn parse_chunk_accepts_bare_unenveloped_shape() {
        let chunk = json!({
            "candidates": [{ "content": { "parts": [{ "text": "bare" }] } }]
        });
        assert_eq!(parse_chunk(&chunk), vec![UpstreamEvent::Content("bare".into())]);
    }

    #[test]
    fn parse_chunk_totals_usage_when_total_is_absent() {
        let chunk = json!({
            "usageMetadata": { "promptTokenCount": 7, "candidatesTokenCount": 3 }
        });
        assert_eq!(
            parse_chunk(&chunk),
            vec![UpstreamEvent::Usage(Usage { prompt_tokens: 7, completion_tokens: 3, total_tokens: 10 })]
        );
    }

    // -----------------------------------------------------------------------
    // Probe + models
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn probe_project_returns_project_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:loadCodeAssist"))
            .and(header("authorization", "Bearer at-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "cloudaicompanionProject": "project-77",
            })))
            .mount(&server)
            .await;

        let project = client_for(&server).probe_project("at-1").await.unwrap();
        assert_eq!(project.as_deref(), Some("project-77"));
    }

    #[tokio::test]
    async fn probe_project_without_project_field_is_ineligible() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:loadCodeAssist"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        assert!(client_for(&server).probe_project("at-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_models_parses_compact_quota() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:fetchAvailableModels"))
            .and(body_partial_json(json!({ "project": "project-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [
                    { "name": "gemini-2.5-pro", "quota": { "r": 0.42, "t": 1_755_000_000 } },
                    { "name": "gemini-2.5-flash" },
                ]
            })))
            .mount(&server)
            .await;

        let models = client_for(&server).fetch_models(&account()).await.unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].quota.unwrap().r, 0.42);
        assert!(models[1].quota.is_none());
    }

    // -----------------------------------------------------------------------
    // Generation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn generate_wraps_request_in_envelope_and_aggregates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:generateContent"))
            .and(body_partial_json(json!({
                "model": "gemini-2.5-pro",
                "project": "project-1",
                "request": { "contents": [] },
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": {
                    "candidates": [{
                        "content": { "parts": [
                            { "text": "thinking", "thought": true },
                            { "text": "Hi " },
                            { "text": "there" },
                        ]}
                    }],
                    "usageMetadata": { "promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6 }
                }
            })))
            .mount(&server)
            .await;

        let outcome = client_for(&server)
            .generate(&account(), "gemini-2.5-pro", json!({ "contents": [] }))
            .await
            .unwrap();
        assert_eq!(outcome.content, "Hi there");
        assert_eq!(outcome.reasoning, "thinking");
        assert_eq!(outcome.usage.unwrap().total_tokens, 6);
    }

    #[tokio::test]
    async fn generate_maps_429_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:generateContent"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota exceeded"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .generate(&account(), "gemini-2.5-pro", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn generate_passes_other_statuses_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:generateContent"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .generate(&account(), "gemini-2.5-pro", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Upstream { status: 403, .. }));
    }

    #[tokio::test]
    async fn stream_generate_emits_parsed_events_in_order() {
        let body = concat!(
            "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"mull\",\"thought\":true}]}}]}}\n\n",
            "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hello\"}]}}]}}\n\n",
            "data: {\"response\":{\"usageMetadata\":{\"promptTokenCount\":1,\"candidatesTokenCount\":1,\"totalTokenCount\":2}}}\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let mut rx = client_for(&server)
            .stream_generate(&account(), "gemini-2.5-pro", json!({ "contents": [] }))
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                UpstreamEvent::Reasoning { text: "mull".into(), signature: None },
                UpstreamEvent::Content("Hello".into()),
                UpstreamEvent::Usage(Usage { prompt_tokens: 1, completion_tokens: 1, total_tokens: 2 }),
            ]
        );
    }

    #[tokio::test]
    async fn stream_generate_fails_before_emitting_on_429() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:streamGenerateContent"))
            .respond_with(ResponseTemplate::new(429).set_body_string("exhausted"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .stream_generate(&account(), "gemini-2.5-pro", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
    }
}
