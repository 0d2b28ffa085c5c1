use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::BackendError;
use crate::ids::ContinuationToken;
use crate::messages::{ConversationTurn, ToolCall};
use crate::schema::SchemaSpec;
use crate::tokens::TokenUsage;
use crate::tools::ToolDefinition;

/// Whether the backend may answer with tool calls this round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
}

/// One round of the conversation as sent to the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendRequest {
    pub instructions: String,
    pub input: Vec<ConversationTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default)]
    pub tool_choice: ToolChoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<ContinuationToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<SchemaSpec>,
}

impl BackendRequest {
    pub fn new(instructions: impl Into<String>, input: Vec<ConversationTurn>) -> Self {
        Self {
            instructions: instructions.into(),
            input,
            tools: None,
            tool_choice: ToolChoice::Auto,
            continuation_token: None,
            output_schema: None,
        }
    }
}

/// What the backend decided this round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseOutput {
    Text { text: String },
    Structured { value: serde_json::Value },
    ToolCalls { calls: Vec<ToolCall> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    /// Always present: the handle for the next round if the conversation continues.
    pub continuation_token: ContinuationToken,
    pub output: ResponseOutput,
    /// Reasoning summaries, when the backend exposes them.
    #[serde(default)]
    pub reasoning: Vec<String>,
    #[serde(default)]
    pub usage: TokenUsage,
    /// Set when the backend stopped early (e.g. `max_output_tokens`). The
    /// output is partial and the round does not count as an answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete: Option<String>,
}

/// A remote language-model endpoint able to run one conversation round.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Key for circuit-breaker bookkeeping. Slots sharing an endpoint share a breaker.
    fn endpoint(&self) -> &str;

    async fn call(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError>;
}
