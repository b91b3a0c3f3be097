//! OpenAI-compatible client surface: model listing, Chat Completions, and
//! the Responses API.
//!
//! Both generation endpoints share the same shape: normalize the inbound
//! body to the canonical upstream request, run it through the pool-backed
//! rate-limit retry loop, and render the result back into the caller's wire
//! format. Streaming responses hand the connection to a single pump task
//! that multiplexes upstream events with the heartbeat timer; a failed send
//! on either path means the client is gone and tears both down.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    error::GatewayError,
    quota::ModelQuota,
    state::AppState,
    stream::{sse_channel, with_rate_limit_retry, StreamWriter},
    transform,
    upstream::{Usage, UpstreamEvent},
};

fn sse_response(body: axum::body::Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        body,
    )
        .into_response()
}

fn require_model(body: &Value) -> Result<String, GatewayError> {
    body.get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .ok_or_else(|| GatewayError::Validation("model is required".into()))
}

// ---------------------------------------------------------------------------
// GET /v1/models
// ---------------------------------------------------------------------------

pub async fn list_models(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, GatewayError> {
    let account = state.pool.acquire().await?;
    let models = state.upstream.fetch_models(&account).await?;

    // Model listings double as quota snapshots; cache them while we're here.
    let quotas: std::collections::HashMap<String, ModelQuota> = models
        .iter()
        .filter_map(|m| {
            m.quota.map(|q| {
                (m.name.clone(), ModelQuota { remaining: q.r, reset_epoch: q.t })
            })
        })
        .collect();
    if !quotas.is_empty() {
        state.quota.update(&account.refresh_token, quotas);
    }

    let created = chrono::Utc::now().timestamp();
    let data: Vec<Value> = models
        .iter()
        .map(|m| {
            json!({
                "id": m.name,
                "object": "model",
                "created": created,
                "owned_by": "google",
            })
        })
        .collect();
    Ok(Json(json!({ "object": "list", "data": data })))
}

// ---------------------------------------------------------------------------
// POST /v1/chat/completions
// ---------------------------------------------------------------------------

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Response, GatewayError> {
    let config = state.config();
    let model = require_model(&body)?;
    let request = transform::build_upstream_request(
        &body,
        &model,
        &config.defaults,
        config.gateway.system_instruction.as_deref(),
    )?;
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let id = transform::new_completion_id();
    let created = chrono::Utc::now().timestamp();

    if !stream {
        let outcome = {
            let upstream = Arc::clone(&state.upstream);
            let model = model.clone();
            with_rate_limit_retry(&state.pool, config.gateway.max_retries, move |account| {
                let upstream = Arc::clone(&upstream);
                let model = model.clone();
                let request = request.clone();
                Box::pin(async move { upstream.generate(&account, &model, request).await })
            })
            .await?
        };
        let body = transform::chat_response(
            &id,
            created,
            &model,
            &outcome,
            config.gateway.pass_signature_to_client,
        );
        return Ok(Json(body).into_response());
    }

    // Connection-time retry only: once the first byte is parsed, a 429 can
    // no longer be retried without duplicating deltas.
    let events = {
        let upstream = Arc::clone(&state.upstream);
        let model = model.clone();
        with_rate_limit_retry(&state.pool, config.gateway.max_retries, move |account| {
            let upstream = Arc::clone(&upstream);
            let model = model.clone();
            let request = request.clone();
            Box::pin(async move { upstream.stream_generate(&account, &model, request).await })
        })
        .await?
    };

    let (writer, body) = sse_channel();
    let heartbeat = Duration::from_millis(config.gateway.heartbeat_interval_ms);
    let pass_signature = config.gateway.pass_signature_to_client;
    tokio::spawn(pump_chat_stream(
        writer,
        events,
        id,
        created,
        model,
        heartbeat,
        pass_signature,
    ));
    Ok(sse_response(body))
}

async fn pump_chat_stream(
    writer: StreamWriter,
    mut events: mpsc::Receiver<UpstreamEvent>,
    id: String,
    created: i64,
    model: String,
    heartbeat: Duration,
    pass_signature: bool,
) {
    let chunk = |delta: Value, finish: Option<&str>, usage: Option<Usage>| {
        transform::chat_chunk(&id, created, &model, delta, finish, usage)
    };

    if !writer.data(&chunk(json!({ "role": "assistant" }), None, None)).await {
        return;
    }

    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // consume the immediate first tick

    let mut tool_index = 0usize;
    let mut saw_tool_calls = false;
    let mut usage = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !writer.heartbeat().await {
                    return;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                let delta = match event {
                    UpstreamEvent::Content(text) => json!({ "content": text }),
                    UpstreamEvent::Reasoning { text, signature } => {
                        let mut delta = json!({ "reasoning_content": text });
                        if pass_signature {
                            if let Some(signature) = signature {
                                delta["reasoning_signature"] = json!(signature);
                            }
                        }
                        delta
                    }
                    UpstreamEvent::ToolCall { name, args } => {
                        saw_tool_calls = true;
                        let delta = transform::tool_call_delta(
                            tool_index,
                            &transform::new_call_id(),
                            &name,
                            &args,
                        );
                        tool_index += 1;
                        delta
                    }
                    UpstreamEvent::Usage(u) => {
                        usage = Some(u);
                        continue;
                    }
                };
                if !writer.data(&chunk(delta, None, None)).await {
                    return;
                }
            }
        }
    }

    let finish = if saw_tool_calls { "tool_calls" } else { "stop" };
    if writer.data(&chunk(json!({}), Some(finish), usage)).await {
        writer.done().await;
    }
    debug!(finish, "chat stream finished");
}

// ---------------------------------------------------------------------------
// POST /v1/responses
// ---------------------------------------------------------------------------

/// The Responses surface has its own error envelope, so the handler renders
/// errors itself instead of letting [`GatewayError`] do it.
fn responses_error(err: GatewayError) -> Response {
    let status = err.status();
    if status.is_server_error() {
        tracing::warn!(error = %err, "responses handler error");
    }
    (
        status,
        Json(json!({
            "type": "error",
            "error": { "type": err.kind(), "message": err.to_string() },
        })),
    )
        .into_response()
}

pub async fn responses(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Response {
    match responses_inner(state, body).await {
        Ok(response) => response,
        Err(err) => responses_error(err),
    }
}

async fn responses_inner(
    state: Arc<AppState>,
    body: Value,
) -> Result<Response, GatewayError> {
    let config = state.config();
    let chat_body = transform::responses_to_chat(&body)?;
    let model = require_model(&chat_body)?;
    let request = transform::build_upstream_request(
        &chat_body,
        &model,
        &config.defaults,
        config.gateway.system_instruction.as_deref(),
    )?;
    let stream = chat_body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let id = transform::new_response_id();
    let created = chrono::Utc::now().timestamp();

    if !stream {
        let outcome = {
            let upstream = Arc::clone(&state.upstream);
            let model = model.clone();
            with_rate_limit_retry(&state.pool, config.gateway.max_retries, move |account| {
                let upstream = Arc::clone(&upstream);
                let model = model.clone();
                let request = request.clone();
                Box::pin(async move { upstream.generate(&account, &model, request).await })
            })
            .await?
        };
        return Ok(Json(transform::responses_response(&id, created, &model, &outcome))
            .into_response());
    }

    let events = {
        let upstream = Arc::clone(&state.upstream);
        let model = model.clone();
        with_rate_limit_retry(&state.pool, config.gateway.max_retries, move |account| {
            let upstream = Arc::clone(&upstream);
            let model = model.clone();
            let request = request.clone();
            Box::pin(async move { upstream.stream_generate(&account, &model, request).await })
        })
        .await?
    };

    let (writer, body) = sse_channel();
    let heartbeat = Duration::from_millis(config.gateway.heartbeat_interval_ms);
    let builder = transform::ResponsesEvents { id, model, created_at: created };
    tokio::spawn(pump_responses_stream(writer, events, builder, heartbeat));
    Ok(sse_response(body))
}

async fn pump_responses_stream(
    writer: StreamWriter,
    mut events: mpsc::Receiver<UpstreamEvent>,
    builder: transform::ResponsesEvents,
    heartbeat: Duration,
) {
    // Exactly one created event, then the fixed item/part preamble.
    for event in [
        builder.created(),
        builder.output_item_added(),
        builder.content_part_added(),
    ] {
        if !writer.data(&event).await {
            return;
        }
    }

    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut text = String::new();
    let mut usage = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !writer.heartbeat().await {
                    return;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    UpstreamEvent::Content(delta) => {
                        text.push_str(&delta);
                        if !writer.data(&builder.text_delta(&delta)).await {
                            return;
                        }
                    }
                    UpstreamEvent::Usage(u) => usage = Some(u),
                    // Reasoning and tool calls have no event mapping on this
                    // surface; only answer text is streamed.
                    UpstreamEvent::Reasoning { .. } | UpstreamEvent::ToolCall { .. } => {}
                }
            }
        }
    }

    for event in [
        builder.text_done(&text),
        builder.content_part_done(&text),
        builder.output_item_done(&text),
        builder.done(&text, usage),
    ] {
        if !writer.data(&event).await {
            return;
        }
    }
    info!(chars = text.len(), "responses stream finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::config::Config;
    use crate::store::AccountStore;
    use axum::{
        body::{to_bytes, Body},
        http::Request,
        routing::{get, post},
        Router,
    };
    use tower::ServiceExt;
    use wiremock::matchers::{body_partial_json, header as mock_header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn account(refresh_token: &str) -> Account {
        Account {
            access_token: format!("access-{refresh_token}"),
            refresh_token: refresh_token.into(),
            expires_in: 3600,
            issued_at: chrono::Utc::now().timestamp_millis(),
            enabled: true,
            project_id: Some("project-1".into()),
            email: None,
            has_quota: true,
        }
    }

    async fn state_for(server: &MockServer, accounts: &[Account]) -> Arc<AppState> {
        let accounts_path = std::env::temp_dir()
            .join(format!("ggw-client-{}.json", uuid::Uuid::new_v4()));
        AccountStore::new(&accounts_path).write_all(accounts).await.unwrap();

        let mut config: Config = toml::from_str("").unwrap();
        config.upstream.base_url = server.uri();
        config.gateway.accounts_path = accounts_path.to_string_lossy().into_owned();
        let state = AppState::new(config, "/dev/null".into()).unwrap();
        state.pool.load().await.unwrap();
        state
    }

    fn app(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/v1/models", get(list_models))
            .route("/v1/chat/completions", post(chat_completions))
            .route("/v1/responses", post(responses))
            .with_state(state)
    }

    async fn json_body(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn generation_response() -> Value {
        json!({
            "response": {
                "candidates": [{
                    "content": { "parts": [
                        { "text": "brooding", "thought": true },
                        { "text": "Hello!" },
                    ]}
                }],
                "usageMetadata": { "promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5 }
            }
        })
    }

    #[tokio::test]
    async fn models_returns_openai_list_and_caches_quota() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:fetchAvailableModels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{ "name": "gemini-2.5-pro", "quota": { "r": 0.5, "t": 1_755_000_000 } }]
            })))
            .mount(&server)
            .await;

        let state = state_for(&server, &[account("rt-1")]).await;
        let response = app(Arc::clone(&state))
            .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"][0]["id"], "gemini-2.5-pro");

        let cached = state.quota.get("rt-1").expect("quota cached from listing");
        assert_eq!(cached.models["gemini-2.5-pro"].remaining, 0.5);
    }

    #[tokio::test]
    async fn models_without_accounts_is_503() {
        let server = MockServer::start().await;
        let state = state_for(&server, &[]).await;
        let response = app(state)
            .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn chat_non_streaming_happy_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:generateContent"))
            .and(body_partial_json(json!({ "model": "gemini-2.5-pro", "project": "project-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(generation_response()))
            .mount(&server)
            .await;

        let state = state_for(&server, &[account("rt-1")]).await;
        let response = app(state)
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({
                    "model": "gemini-2.5-pro",
                    "messages": [{ "role": "user", "content": "hi" }],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello!");
        assert_eq!(body["choices"][0]["message"]["reasoning_content"], "brooding");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["total_tokens"], 5);
    }

    #[tokio::test]
    async fn chat_without_model_is_400() {
        let server = MockServer::start().await;
        let state = state_for(&server, &[account("rt-1")]).await;
        let response = app(state)
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({ "messages": [{ "role": "user", "content": "hi" }] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn chat_retries_on_429_with_the_next_account() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:generateContent"))
            .and(mock_header("authorization", "Bearer access-rt-1"))
            .respond_with(ResponseTemplate::new(429).set_body_string("exhausted"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1internal:generateContent"))
            .and(mock_header("authorization", "Bearer access-rt-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(generation_response()))
            .expect(1)
            .mount(&server)
            .await;

        let state = state_for(&server, &[account("rt-1"), account("rt-2")]).await;
        let response = app(state)
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({
                    "model": "gemini-2.5-pro",
                    "messages": [{ "role": "user", "content": "hi" }],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn chat_surfaces_429_when_every_account_is_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:generateContent"))
            .respond_with(ResponseTemplate::new(429).set_body_string("exhausted"))
            .mount(&server)
            .await;

        let state = state_for(&server, &[account("rt-1")]).await;
        let response = app(state)
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({
                    "model": "gemini-2.5-pro",
                    "messages": [{ "role": "user", "content": "hi" }],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn chat_streaming_emits_deltas_sentinel_and_done() {
        let sse = concat!(
            "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}}\n\n",
            "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]}}],",
            "\"usageMetadata\":{\"promptTokenCount\":1,\"candidatesTokenCount\":1,\"totalTokenCount\":2}}}\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:streamGenerateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let state = state_for(&server, &[account("rt-1")]).await;
        let response = app(state)
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({
                    "model": "gemini-2.5-pro",
                    "stream": true,
                    "messages": [{ "role": "user", "content": "hi" }],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let chunks: Vec<Value> = text
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .filter(|d| *d != "[DONE]")
            .map(|d| serde_json::from_str(d).unwrap())
            .collect();

        // Role preamble, two content deltas, sentinel.
        assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "Hel");
        assert_eq!(chunks[2]["choices"][0]["delta"]["content"], "lo");
        let last = chunks.last().unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert_eq!(last["usage"]["total_tokens"], 2);
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn chat_streaming_tool_calls_are_indexed_and_finish_with_tool_calls() {
        let sse = concat!(
            "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[",
            "{\"functionCall\":{\"name\":\"get_weather\",\"args\":{\"city\":\"Beijing\"}}},",
            "{\"functionCall\":{\"name\":\"get_news\",\"args\":{\"topic\":\"Tech\"}}}",
            "]}}]}}\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:streamGenerateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let state = state_for(&server, &[account("rt-1")]).await;
        let response = app(state)
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({
                    "model": "gemini-2.5-pro",
                    "stream": true,
                    "messages": [{ "role": "user", "content": "weather and news" }],
                }),
            ))
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let chunks: Vec<Value> = text
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .filter(|d| *d != "[DONE]")
            .map(|d| serde_json::from_str(d).unwrap())
            .collect();

        assert_eq!(chunks[1]["choices"][0]["delta"]["tool_calls"][0]["index"], 0);
        assert_eq!(
            chunks[1]["choices"][0]["delta"]["tool_calls"][0]["function"]["name"],
            "get_weather"
        );
        assert_eq!(chunks[2]["choices"][0]["delta"]["tool_calls"][0]["index"], 1);
        assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "tool_calls");
    }

    #[tokio::test]
    async fn responses_non_streaming_converts_input_and_renders_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:generateContent"))
            .and(body_partial_json(json!({
                "request": { "systemInstruction": { "parts": [{ "text": "Be brief." }] } }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(generation_response()))
            .mount(&server)
            .await;

        let state = state_for(&server, &[account("rt-1")]).await;
        let response = app(state)
            .oneshot(post_json(
                "/v1/responses",
                json!({
                    "model": "gemini-2.5-pro",
                    "input": "hi",
                    "instructions": "Be brief.",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["object"], "response");
        assert_eq!(body["status"], "completed");
        assert_eq!(body["output"][0]["content"][0]["text"], "Hello!");
        assert_eq!(body["usage"]["input_tokens"], 3);
    }

    #[tokio::test]
    async fn responses_errors_use_the_responses_envelope() {
        let server = MockServer::start().await;
        let state = state_for(&server, &[account("rt-1")]).await;
        let response = app(state)
            .oneshot(post_json("/v1/responses", json!({ "model": "gemini-2.5-pro" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn responses_streaming_emits_the_ordered_event_sequence() {
        let sse = concat!(
            "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}}\n\n",
            "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]}}],",
            "\"usageMetadata\":{\"promptTokenCount\":1,\"candidatesTokenCount\":1,\"totalTokenCount\":2}}}\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:streamGenerateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let state = state_for(&server, &[account("rt-1")]).await;
        let response = app(state)
            .oneshot(post_json(
                "/v1/responses",
                json!({ "model": "gemini-2.5-pro", "input": "hi", "stream": true }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let types: Vec<String> = text
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .map(|d| serde_json::from_str::<Value>(d).unwrap()["type"]
                .as_str()
                .unwrap()
                .to_string())
            .collect();
        assert_eq!(
            types,
            vec![
                "response.created",
                "response.output_item.added",
                "response.content_part.added",
                "response.output_text.delta",
                "response.output_text.delta",
                "response.output_text.done",
                "response.content_part.done",
                "response.output_item.done",
                "response.done",
            ]
        );

        // The done event aggregates the full text; deltas were incremental.
        let done: Value = text
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .map(|d| serde_json::from_str::<Value>(d).unwrap())
            .find(|v| v["type"] == "response.done")
            .unwrap();
        assert_eq!(done["response"]["output"][0]["content"][0]["text"], "Hello");
        assert_eq!(done["response"]["usage"]["total_tokens"], 2);
    }
}
