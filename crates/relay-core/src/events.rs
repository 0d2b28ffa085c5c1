use serde::{Deserialize, Serialize};

/// Progress notification emitted by the orchestration loop.
///
/// Wire form: `{"type": "progress"|"result"|"error", "message"?, "stage"?, "data"?}`.
/// Every call's stream ends with exactly one `result` or `error`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<ProgressStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Progress,
    Result,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Iteration,
    Reasoning,
    Tools,
    ToolStart,
    ToolEnd,
    Complete,
}

impl ProgressStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Iteration => "iteration",
            Self::Reasoning => "reasoning",
            Self::Tools => "tools",
            Self::ToolStart => "tool_start",
            Self::ToolEnd => "tool_end",
            Self::Complete => "complete",
        }
    }
}

impl ProgressEvent {
    pub fn progress(stage: ProgressStage, message: impl Into<String>) -> Self {
        Self {
            kind: ProgressKind::Progress,
            message: Some(message.into()),
            stage: Some(stage),
            data: None,
        }
    }

    pub fn result(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: ProgressKind::Result,
            message: Some(message.into()),
            stage: Some(ProgressStage::Complete),
            data: Some(data),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ProgressKind::Error,
            message: Some(message.into()),
            stage: None,
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, ProgressKind::Result | ProgressKind::Error)
    }
}
