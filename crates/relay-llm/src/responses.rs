use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use relay_core::backend::{Backend, BackendRequest, BackendResponse, ResponseOutput, ToolChoice};
use relay_core::errors::BackendError;
use relay_core::ids::{ContinuationToken, ToolCallId};
use relay_core::messages::{ConversationTurn, Role, ToolCall, TurnContent};
use relay_core::tokens::TokenUsage;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Clone, Debug)]
pub struct ResponsesConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub model: String,
    /// `minimal` / `low` / `medium` / `high`; omitted when `None`.
    pub reasoning_effort: Option<String>,
    /// Ask the backend for reasoning summaries alongside the answer.
    pub reasoning_summary: bool,
    pub max_output_tokens: Option<u32>,
}

impl ResponsesConfig {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key,
            model: model.into(),
            reasoning_effort: None,
            reasoning_summary: false,
            max_output_tokens: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_reasoning(mut self, effort: impl Into<String>, summary: bool) -> Self {
        self.reasoning_effort = Some(effort.into());
        self.reasoning_summary = summary;
        self
    }

    pub fn with_max_output_tokens(mut self, n: u32) -> Self {
        self.max_output_tokens = Some(n);
        self
    }
}

/// Backend speaking the Responses API over HTTPS.
///
/// Conversation state lives server-side: each response id is returned as the
/// continuation token and sent back as `previous_response_id`.
pub struct ResponsesBackend {
    client: Client,
    config: ResponsesConfig,
    endpoint: String,
}

impl ResponsesBackend {
    pub fn new(config: ResponsesConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        let endpoint = format!("{}/responses", config.base_url);
        Ok(Self {
            client,
            config,
            endpoint,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl Backend for ResponsesBackend {
    fn name(&self) -> &str {
        "responses"
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[instrument(skip_all, fields(model = %self.config.model))]
    async fn call(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let body = build_request_body(&self.config, request);

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.config.api_key.expose_secret())
            .header("accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::NetworkError(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(match BackendError::from_status(status, text) {
                BackendError::RateLimited { .. } => BackendError::RateLimited { retry_after },
                other => other,
            });
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
        let parsed = parse_response_body(&json)?;
        debug!(
            response_id = %parsed.continuation_token,
            input_tokens = parsed.usage.input_tokens,
            output_tokens = parsed.usage.output_tokens,
            "responses call complete"
        );
        Ok(parsed)
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Build the JSON body for `POST /responses`.
pub fn build_request_body(config: &ResponsesConfig, request: &BackendRequest) -> Value {
    let mut body = json!({
        "model": config.model,
        "instructions": request.instructions,
        "input": request.input.iter().map(input_item).collect::<Vec<_>>(),
        "store": true,
        "truncation": "auto",
    });

    if let Some(tools) = &request.tools {
        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                        "strict": false,
                    })
                })
                .collect();
        }
    }
    if request.tool_choice == ToolChoice::None {
        body["tool_choice"] = json!("none");
    }
    if let Some(token) = &request.continuation_token {
        body["previous_response_id"] = json!(token.as_str());
    }
    if let Some(schema) = &request.output_schema {
        body["text"] = json!({
            "format": {
                "type": "json_schema",
                "name": schema.name,
                "schema": schema.schema,
                "strict": schema.strict,
            }
        });
    }
    if let Some(effort) = &config.reasoning_effort {
        let mut reasoning = json!({ "effort": effort });
        if config.reasoning_summary {
            reasoning["summary"] = json!("auto");
        }
        body["reasoning"] = reasoning;
    }
    if let Some(n) = config.max_output_tokens {
        body["max_output_tokens"] = json!(n);
    }
    body
}

fn input_item(turn: &ConversationTurn) -> Value {
    let role = match turn.role {
        Role::User | Role::Tool => "user",
        Role::Assistant => "assistant",
    };
    match &turn.content {
        TurnContent::Text { text } => json!({ "role": role, "content": text }),
        TurnContent::Structured { value } => json!({ "role": role, "content": value.to_string() }),
        TurnContent::ToolCall(call) => json!({
            "type": "function_call",
            "call_id": call.id.as_str(),
            "name": call.name,
            "arguments": call.arguments.to_string(),
        }),
        TurnContent::ToolResult(result) => json!({
            "type": "function_call_output",
            "call_id": result.call_id.as_str(),
            "output": result.payload().to_string(),
        }),
    }
}

/// Interpret a Responses API body. Tool calls take precedence over text.
pub fn parse_response_body(body: &Value) -> Result<BackendResponse, BackendError> {
    if body.get("status").and_then(Value::as_str) == Some("failed") {
        let message = body
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("response failed");
        return Err(BackendError::ServerError {
            status: 500,
            body: message.to_string(),
        });
    }

    let id = body
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::MalformedResponse("response has no id".into()))?;
    let items = body
        .get("output")
        .and_then(Value::as_array)
        .ok_or_else(|| BackendError::MalformedResponse("response has no output array".into()))?;

    let mut calls = Vec::new();
    let mut text = String::new();
    let mut reasoning = Vec::new();

    for item in items {
        match item.get("type").and_then(Value::as_str) {
            Some("function_call") => calls.push(parse_function_call(item)?),
            Some("message") => {
                for part in item.get("content").and_then(Value::as_array).into_iter().flatten() {
                    if part.get("type").and_then(Value::as_str) == Some("output_text") {
                        if let Some(t) = part.get("text").and_then(Value::as_str) {
                            text.push_str(t);
                        }
                    }
                }
            }
            Some("reasoning") => {
                for part in item.get("summary").and_then(Value::as_array).into_iter().flatten() {
                    if let Some(t) = part.get("text").and_then(Value::as_str) {
                        reasoning.push(t.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    let output = if !calls.is_empty() {
        ResponseOutput::ToolCalls { calls }
    } else {
        ResponseOutput::Text { text }
    };

    let incomplete = (body.get("status").and_then(Value::as_str) == Some("incomplete")).then(|| {
        body.pointer("/incomplete_details/reason")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    });
    if let Some(reason) = &incomplete {
        warn!(response_id = id, reason = %reason, "response incomplete");
    }

    Ok(BackendResponse {
        continuation_token: ContinuationToken::from_backend(id),
        output,
        reasoning,
        usage: parse_usage(body.get("usage")),
        incomplete,
    })
}

fn parse_function_call(item: &Value) -> Result<ToolCall, BackendError> {
    let call_id = item
        .get("call_id")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::MalformedResponse("function_call without call_id".into()))?;
    let name = item
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::MalformedResponse("function_call without name".into()))?;

    // Arguments arrive as a JSON-encoded string; empty means no arguments.
    let raw = item
        .get("arguments")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim();
    let (arguments, malformed_arguments) = if raw.is_empty() {
        (json!({}), None)
    } else {
        match serde_json::from_str(raw) {
            Ok(value) => (value, None),
            Err(e) => {
                warn!(call_id, tool = name, error = %e, "function_call arguments are not valid JSON");
                (Value::String(raw.to_string()), Some(e.to_string()))
            }
        }
    };

    Ok(ToolCall {
        id: ToolCallId::from_raw(call_id),
        name: name.to_string(),
        arguments,
        turn_index: 0,
        malformed_arguments,
    })
}

fn parse_usage(usage: Option<&Value>) -> TokenUsage {
    let Some(u) = usage else {
        return TokenUsage::default();
    };
    let count = |ptr: &str| u.pointer(ptr).and_then(Value::as_u64).unwrap_or(0);
    TokenUsage {
        input_tokens: count("/input_tokens"),
        output_tokens: count("/output_tokens"),
        cached_tokens: count("/input_tokens_details/cached_tokens"),
        reasoning_tokens: count("/output_tokens_details/reasoning_tokens"),
    }
}
