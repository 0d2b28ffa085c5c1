//! Shared types for the relay conversation engine: identifiers, the backend
//! contract, conversation turns, tool and progress types, and error taxonomy.

pub mod backend;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod schema;
pub mod tokens;
pub mod tools;

pub use backend::{Backend, BackendRequest, BackendResponse, ResponseOutput, ToolChoice};
pub use errors::BackendError;
pub use events::{ProgressEvent, ProgressKind, ProgressStage};
pub use ids::{ContinuationToken, RunId, SessionId, ToolCallId};
pub use messages::{
    ConversationTurn, Role, ToolCall, ToolFailure, ToolOutput, ToolResult, TurnContent,
};
pub use schema::{OutputSchema, SchemaError, SchemaSpec, TypedSchema};
pub use tokens::TokenUsage;
pub use tools::{Tool, ToolDefinition, ToolError};
