//! Protocol translation between the OpenAI-compatible surfaces and the
//! upstream canonical request shape.
//!
//! Inbound, three wire formats are accepted — OpenAI Chat, OpenAI Responses
//! (converted to the Chat shape first), and Gemini-style bodies — and all of
//! them collapse into one canonical `request` object: `contents` turns, an
//! optional `systemInstruction`, a `generationConfig`, and optional function
//! declarations. Outbound, upstream output is rendered back into OpenAI
//! Chat bodies/chunks and Responses bodies/events.
//!
//! The role/tool-call turn construction is the most failure-prone part of
//! the gateway and is pinned down by literal fixtures in the tests below.

use serde_json::{json, Map, Value};

use crate::{
    config::GenerationDefaults,
    error::GatewayError,
    upstream::{GenerateOutcome, Usage},
};

// ---------------------------------------------------------------------------
// Content normalization
// ---------------------------------------------------------------------------

/// Flatten any supported content value to a single string.
///
/// Strings pass through; arrays concatenate their normalized elements in
/// order; objects unwrap their `text` field depth-first. Anything else
/// normalizes to the empty string.
pub fn normalize_content(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(normalize_content).collect(),
        Value::Object(obj) => obj.get("text").map(normalize_content).unwrap_or_default(),
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Canonical turn construction
// ---------------------------------------------------------------------------

/// Build the canonical `contents` turn array plus the extracted system text.
///
/// Role mapping: `user`→user, `assistant`→model, `tool`→user (one turn per
/// tool result, never merged), `system`→pulled out of the sequence entirely
/// and returned separately for the `systemInstruction` slot.
pub fn build_contents(messages: &[Value]) -> Result<(Vec<Value>, Option<String>), GatewayError> {
    let mut contents = Vec::new();
    let mut system_parts: Vec<String> = Vec::new();
    // tool_call_id -> function name, for matching functionResponse turns.
    let mut call_names: std::collections::HashMap<String, String> = std::collections::HashMap::new();

    for message in messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        match role {
            "system" | "developer" => {
                system_parts.push(normalize_content(message.get("content").unwrap_or(&Value::Null)));
            }
            "assistant" => {
                let tool_calls = message.get("tool_calls").and_then(Value::as_array);
                match tool_calls {
                    Some(calls) if !calls.is_empty() => {
                        // One model turn with one functionCall part per call,
                        // in array order. Any text content is not merged in.
                        let mut parts = Vec::with_capacity(calls.len());
                        for call in calls {
                            let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
                            let function = call.get("function").unwrap_or(&Value::Null);
                            let name = function
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string();
                            let args = function
                                .get("arguments")
                                .and_then(Value::as_str)
                                .and_then(|s| serde_json::from_str::<Value>(s).ok())
                                .unwrap_or_else(|| json!({}));
                            if !id.is_empty() {
                                call_names.insert(id.to_string(), name.clone());
                            }
                            parts.push(json!({ "functionCall": { "name": name, "args": args } }));
                        }
                        contents.push(json!({ "role": "model", "parts": parts }));
                    }
                    _ => {
                        let text = normalize_content(message.get("content").unwrap_or(&Value::Null));
                        contents.push(json!({ "role": "model", "parts": [{ "text": text }] }));
                    }
                }
            }
            "tool" => {
                // Each tool result is its own user turn with exactly one
                // functionResponse part, matched by tool_call_id.
                let id = message
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let name = call_names.get(id).cloned().unwrap_or_default();
                let text = normalize_content(message.get("content").unwrap_or(&Value::Null));
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "id": id,
                            "name": name,
                            "response": { "result": text },
                        }
                    }]
                }));
            }
            _ => {
                let text = normalize_content(message.get("content").unwrap_or(&Value::Null));
                contents.push(json!({ "role": "user", "parts": [{ "text": text }] }));
            }
        }
    }

    let system = if system_parts.is_empty() { None } else { Some(system_parts.join("\n\n")) };
    Ok((contents, system))
}

// ---------------------------------------------------------------------------
// Parameter normalization
// ---------------------------------------------------------------------------

/// Generation parameters after merging the caller's values onto defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u64,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u64,
    /// Resolved thinking budget. Zero means thinking is disabled outright.
    pub thinking_budget: u64,
    pub stop: Vec<String>,
}

fn effort_to_budget(effort: &str) -> Option<u64> {
    match effort {
        "low" => Some(1_024),
        "medium" => Some(16_000),
        "high" => Some(32_000),
        _ => None,
    }
}

/// Merge the caller's parameters — in any of the three wire spellings —
/// onto the configured defaults.
pub fn resolve_params(body: &Value, defaults: &GenerationDefaults) -> GenerationParams {
    let gen_cfg = body.get("generationConfig").cloned().unwrap_or(Value::Null);

    let max_tokens = body
        .get("max_tokens")
        .and_then(Value::as_u64)
        .or_else(|| body.get("max_completion_tokens").and_then(Value::as_u64))
        .or_else(|| body.get("maxOutputTokens").and_then(Value::as_u64))
        .or_else(|| gen_cfg.get("maxOutputTokens").and_then(Value::as_u64))
        .unwrap_or(defaults.max_tokens);
    let temperature = body
        .get("temperature")
        .and_then(Value::as_f64)
        .or_else(|| gen_cfg.get("temperature").and_then(Value::as_f64))
        .unwrap_or(defaults.temperature);
    let top_p = body
        .get("top_p")
        .and_then(Value::as_f64)
        .or_else(|| body.get("topP").and_then(Value::as_f64))
        .or_else(|| gen_cfg.get("topP").and_then(Value::as_f64))
        .unwrap_or(defaults.top_p);
    let top_k = body
        .get("top_k")
        .and_then(Value::as_u64)
        .or_else(|| body.get("topK").and_then(Value::as_u64))
        .or_else(|| gen_cfg.get("topK").and_then(Value::as_u64))
        .unwrap_or(defaults.top_k);

    let stop = match body.get("stop") {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };

    GenerationParams {
        max_tokens,
        temperature,
        top_p,
        top_k,
        thinking_budget: resolve_thinking_budget(body, &gen_cfg, defaults),
        stop,
    }
}

/// Resolve the thinking budget across the three format-specific controls.
///
/// Claude's `thinking` object and Gemini's `thinkingConfig` are checked
/// before the OpenAI spellings; within OpenAI, an explicit `thinking_budget`
/// beats `reasoning_effort` — in particular an explicit zero disables
/// thinking even when an effort is also set.
fn resolve_thinking_budget(body: &Value, gen_cfg: &Value, defaults: &GenerationDefaults) -> u64 {
    if let Some(thinking) = body.get("thinking").filter(|v| v.is_object()) {
        let kind = thinking.get("type").and_then(Value::as_str).unwrap_or("enabled");
        if kind == "disabled" {
            return 0;
        }
        return thinking
            .get("budget_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(defaults.thinking_budget);
    }

    let thinking_cfg = body
        .get("thinkingConfig")
        .or_else(|| gen_cfg.get("thinkingConfig"))
        .filter(|v| v.is_object());
    if let Some(cfg) = thinking_cfg {
        if cfg.get("includeThoughts").and_then(Value::as_bool) == Some(false) {
            return 0;
        }
        return cfg
            .get("thinkingBudget")
            .and_then(Value::as_u64)
            .unwrap_or(defaults.thinking_budget);
    }

    if let Some(budget) = body.get("thinking_budget").and_then(Value::as_u64) {
        return budget;
    }
    if let Some(budget) = body
        .get("reasoning_effort")
        .and_then(Value::as_str)
        .and_then(effort_to_budget)
    {
        return budget;
    }
    defaults.thinking_budget
}

/// Render the merged parameters into the upstream `generationConfig`.
///
/// A zero budget disables thinking outright. For the claude model family
/// with thinking enabled, `topP` is omitted entirely (upstream rejects the
/// combination).
pub fn to_generation_config(params: &GenerationParams, model: &str) -> Value {
    let thinking_enabled = params.thinking_budget > 0;
    let mut config = Map::new();
    config.insert("temperature".into(), json!(params.temperature));
    config.insert("topK".into(), json!(params.top_k));
    config.insert("maxOutputTokens".into(), json!(params.max_tokens));
    config.insert("candidateCount".into(), json!(1));

    if !(thinking_enabled && model.contains("claude")) {
        config.insert("topP".into(), json!(params.top_p));
    }
    if thinking_enabled {
        config.insert(
            "thinkingConfig".into(),
            json!({ "includeThoughts": true, "thinkingBudget": params.thinking_budget }),
        );
    }
    if !params.stop.is_empty() {
        config.insert("stopSequences".into(), json!(params.stop));
    }
    Value::Object(config)
}

// ---------------------------------------------------------------------------
// Tool declarations
// ---------------------------------------------------------------------------

/// Convert OpenAI `tools` into upstream function declarations. Entries
/// already in declaration form pass through unchanged.
pub fn convert_tools(tools: &Value) -> Option<Value> {
    let tools = tools.as_array()?;
    if tools.is_empty() {
        return None;
    }
    if tools.iter().any(|t| t.get("functionDeclarations").is_some()) {
        return Some(Value::Array(tools.clone()));
    }

    let declarations: Vec<Value> = tools
        .iter()
        .filter_map(|tool| {
            let function = tool.get("function")?;
            let name = function.get("name").and_then(Value::as_str)?;
            let mut decl = Map::new();
            decl.insert("name".into(), json!(name));
            if let Some(description) = function.get("description") {
                decl.insert("description".into(), description.clone());
            }
            if let Some(parameters) = function.get("parameters") {
                decl.insert("parameters".into(), parameters.clone());
            }
            Some(Value::Object(decl))
        })
        .collect();
    if declarations.is_empty() {
        None
    } else {
        Some(json!([{ "functionDeclarations": declarations }]))
    }
}

// ---------------------------------------------------------------------------
// Full inbound request assembly
// ---------------------------------------------------------------------------

/// Assemble the canonical upstream `request` object from a Chat-shaped body.
///
/// `fallback_system` is applied only when the messages carry no system turn
/// of their own.
pub fn build_upstream_request(
    body: &Value,
    model: &str,
    defaults: &GenerationDefaults,
    fallback_system: Option<&str>,
) -> Result<Value, GatewayError> {
    let messages = body
        .get("messages")
        .and_then(Value::as_array)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            GatewayError::Validation("messages is required and must be a non-empty array".into())
        })?;

    let (contents, system) = build_contents(messages)?;
    let params = resolve_params(body, defaults);

    let mut request = Map::new();
    request.insert("contents".into(), Value::Array(contents));
    let system = system.or_else(|| fallback_system.map(str::to_string));
    if let Some(system) = system {
        request.insert("systemInstruction".into(), json!({ "parts": [{ "text": system }] }));
    }
    request.insert("generationConfig".into(), to_generation_config(&params, model));
    if let Some(tools) = body.get("tools").and_then(|t| convert_tools(t)) {
        request.insert("tools".into(), tools);
    }
    Ok(Value::Object(request))
}

/// Convert a Responses-API body into the Chat shape.
///
/// Bodies already carrying `messages` pass through untouched. Otherwise
/// `instructions` becomes a leading system message and `input` — a string,
/// an array of strings, or an array of role items — becomes the message
/// list. All other fields are preserved.
pub fn responses_to_chat(body: &Value) -> Result<Value, GatewayError> {
    if body.get("messages").is_some() {
        return Ok(body.clone());
    }

    let mut messages: Vec<Value> = Vec::new();
    if let Some(instructions) = body.get("instructions").and_then(Value::as_str) {
        if !instructions.is_empty() {
            messages.push(json!({ "role": "system", "content": instructions }));
        }
    }

    match body.get("input") {
        Some(Value::String(text)) => {
            messages.push(json!({ "role": "user", "content": text }));
        }
        Some(Value::Array(items)) => {
            for item in items {
                match item {
                    Value::String(text) => {
                        messages.push(json!({ "role": "user", "content": text }));
                    }
                    Value::Object(obj) => {
                        let role = obj.get("role").and_then(Value::as_str).unwrap_or("user");
                        let content =
                            normalize_content(obj.get("content").unwrap_or(&Value::Null));
                        messages.push(json!({ "role": role, "content": content }));
                    }
                    _ => {}
                }
            }
        }
        _ => {
            return Err(GatewayError::Validation(
                "either messages or input is required".into(),
            ));
        }
    }

    let mut chat = body.as_object().cloned().unwrap_or_default();
    chat.remove("input");
    chat.remove("instructions");
    chat.insert("messages".into(), Value::Array(messages));
    Ok(Value::Object(chat))
}

// ---------------------------------------------------------------------------
// Outbound: OpenAI Chat
// ---------------------------------------------------------------------------

pub fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

pub fn new_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

pub fn new_response_id() -> String {
    format!("resp_{}", uuid::Uuid::new_v4().simple())
}

/// Non-streaming Chat completion body.
pub fn chat_response(
    id: &str,
    created: i64,
    model: &str,
    outcome: &GenerateOutcome,
    pass_signature: bool,
) -> Value {
    let mut message = Map::new();
    message.insert("role".into(), json!("assistant"));
    message.insert("content".into(), json!(outcome.content));
    if !outcome.reasoning.is_empty() {
        message.insert("reasoning_content".into(), json!(outcome.reasoning));
        if pass_signature {
            if let Some(signature) = &outcome.signature {
                message.insert("reasoning_signature".into(), json!(signature));
            }
        }
    }
    let finish_reason = if outcome.tool_calls.is_empty() { "stop" } else { "tool_calls" };
    if !outcome.tool_calls.is_empty() {
        let calls: Vec<Value> = outcome
            .tool_calls
            .iter()
            .enumerate()
            .map(|(index, (name, args))| {
                json!({
                    "index": index,
                    "id": new_call_id(),
                    "type": "function",
                    "function": { "name": name, "arguments": args.to_string() },
                })
            })
            .collect();
        message.insert("tool_calls".into(), Value::Array(calls));
    }

    json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": finish_reason,
        }],
        "usage": outcome.usage.unwrap_or_default(),
    })
}

/// One streaming Chat chunk wrapping `delta`.
pub fn chat_chunk(
    id: &str,
    created: i64,
    model: &str,
    delta: Value,
    finish_reason: Option<&str>,
    usage: Option<Usage>,
) -> Value {
    let mut chunk = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    });
    if let Some(usage) = usage {
        chunk["usage"] = json!(usage);
    }
    chunk
}

/// Delta payload for a streamed tool call, tagged with its sequential index.
pub fn tool_call_delta(index: usize, call_id: &str, name: &str, args: &Value) -> Value {
    json!({
        "tool_calls": [{
            "index": index,
            "id": call_id,
            "type": "function",
            "function": { "name": name, "arguments": args.to_string() },
        }]
    })
}

// ---------------------------------------------------------------------------
// Outbound: OpenAI Responses
// ---------------------------------------------------------------------------

fn responses_usage(usage: Option<Usage>) -> Value {
    let usage = usage.unwrap_or_default();
    json!({
        "input_tokens": usage.prompt_tokens,
        "output_tokens": usage.completion_tokens,
        "total_tokens": usage.total_tokens,
    })
}

/// Non-streaming Responses body.
pub fn responses_response(id: &str, created: i64, model: &str, outcome: &GenerateOutcome) -> Value {
    json!({
        "id": id,
        "object": "response",
        "created_at": created,
        "status": "completed",
        "model": model,
        "output": [{
            "type": "message",
            "id": format!("{id}-msg0"),
            "role": "assistant",
            "status": "completed",
            "content": [{ "type": "output_text", "text": outcome.content }],
        }],
        "usage": responses_usage(outcome.usage),
    })
}

/// Event builders for the Responses streaming sequence. Exactly one
/// `created` and one `done` per request; deltas carry only incremental text.
pub struct ResponsesEvents {
    pub id: String,
    pub model: String,
    pub created_at: i64,
}

impl ResponsesEvents {
    pub fn created(&self) -> Value {
        json!({
            "type": "response.created",
            "response": {
                "id": self.id,
                "object": "response",
                "created_at": self.created_at,
                "status": "in_progress",
                "model": self.model,
                "output": [],
            }
        })
    }

    pub fn output_item_added(&self) -> Value {
        json!({
            "type": "response.output_item.added",
            "output_index": 0,
            "item": {
                "type": "message",
                "id": format!("{}-msg0", self.id),
                "role": "assistant",
                "status": "in_progress",
                "content": [],
            }
        })
    }

    pub fn content_part_added(&self) -> Value {
        json!({
            "type": "response.content_part.added",
            "item_id": format!("{}-msg0", self.id),
            "output_index": 0,
            "content_index": 0,
            "part": { "type": "output_text", "text": "" },
        })
    }

    pub fn text_delta(&self, delta: &str) -> Value {
        json!({
            "type": "response.output_text.delta",
            "item_id": format!("{}-msg0", self.id),
            "output_index": 0,
            "content_index": 0,
            "delta": delta,
        })
    }

    pub fn text_done(&self, text: &str) -> Value {
        json!({
            "type": "response.output_text.done",
            "item_id": format!("{}-msg0", self.id),
            "output_index": 0,
            "content_index": 0,
            "text": text,
        })
    }

    pub fn content_part_done(&self, text: &str) -> Value {
        json!({
            "type": "response.content_part.done",
            "item_id": format!("{}-msg0", self.id),
            "output_index": 0,
            "content_index": 0,
            "part": { "type": "output_text", "text": text },
        })
    }

    pub fn output_item_done(&self, text: &str) -> Value {
        json!({
            "type": "response.output_item.done",
            "output_index": 0,
            "item": {
                "type": "message",
                "id": format!("{}-msg0", self.id),
                "role": "assistant",
                "status": "completed",
                "content": [{ "type": "output_text", "text": text }],
            }
        })
    }

    pub fn done(&self, text: &str, usage: Option<Usage>) -> Value {
        json!({
            "type": "response.done",
            "response": {
                "id": self.id,
                "object": "response",
                "created_at": self.created_at,
                "status": "completed",
                "model": self.model,
                "output": [{
                    "type": "message",
                    "id": format!("{}-msg0", self.id),
                    "role": "assistant",
                    "status": "completed",
                    "content": [{ "type": "output_text", "text": text }],
                }],
                "usage": responses_usage(usage),
            }
        })
    }
}
