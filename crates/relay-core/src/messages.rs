use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;

/// Author of a conversation turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// A single input item sent to the backend. Built and consumed within one
/// orchestration call; only the continuation token outlives it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: TurnContent,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnContent {
    Text { text: String },
    Structured { value: serde_json::Value },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

/// A tool invocation requested by the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub name: String,
    /// Schema-less key/value mapping; `{}` when the backend sent nothing.
    pub arguments: serde_json::Value,
    /// Iteration of the orchestration loop that produced this call (1-based).
    #[serde(default)]
    pub turn_index: u32,
    /// Parse error when the backend's arguments were not valid JSON. The raw
    /// text is kept in `arguments` and the call is answered with an error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malformed_arguments: Option<String>,
}

/// Outcome of one tool call, matched to its call by id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: ToolCallId,
    pub output: ToolOutput,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutput {
    Ok { value: serde_json::Value },
    Error { kind: ToolFailure, message: String },
}

/// Why a tool call produced an error payload instead of a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailure {
    UnknownTool,
    InvalidArguments,
    Execution,
    Panicked,
    Timeout,
    Cancelled,
}

// --- Convenience constructors ---

impl ConversationTurn {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: TurnContent::Text { text: text.into() },
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: TurnContent::Text { text: text.into() },
        }
    }

    pub fn tool_result(result: ToolResult) -> Self {
        Self {
            role: Role::Tool,
            content: TurnContent::ToolResult(result),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            TurnContent::Text { text } => Some(text),
            _ => None,
        }
    }
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: ToolCallId::new(),
            name: name.into(),
            arguments,
            turn_index: 0,
            malformed_arguments: None,
        }
    }
}

impl ToolResult {
    pub fn ok(call_id: ToolCallId, value: serde_json::Value) -> Self {
        Self {
            call_id,
            output: ToolOutput::Ok { value },
        }
    }

    pub fn error(call_id: ToolCallId, kind: ToolFailure, message: impl Into<String>) -> Self {
        Self {
            call_id,
            output: ToolOutput::Error {
                kind,
                message: message.into(),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.output, ToolOutput::Error { .. })
    }

    /// The JSON the model sees: the tool's value, or `{"error": message}`.
    pub fn payload(&self) -> serde_json::Value {
        match &self.output {
            ToolOutput::Ok { value } => value.clone(),
            ToolOutput::Error { message, .. } => serde_json::json!({ "error": message }),
        }
    }
}
