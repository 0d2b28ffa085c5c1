use relay_core::schema::SchemaError;
use relay_llm::PoolError;
use relay_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("backend error: {0}")]
    Backend(#[from] PoolError),

    #[error("max iterations exceeded: {0}")]
    MaxIterationsExceeded(u32),

    #[error("structured output validation failed: {0}")]
    StructuredOutput(#[from] SchemaError),

    #[error("cancelled")]
    Cancelled,
}

impl OrchestrationError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Backend(e) => e.error_kind(),
            Self::MaxIterationsExceeded(_) => "max_iterations_exceeded",
            Self::StructuredOutput(_) => "structured_output_invalid",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
}

impl ServiceError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Store(e) => e.error_kind(),
            Self::Orchestration(e) => e.error_kind(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid tool name {0:?}: expected 1-64 of [a-zA-Z0-9_-]")]
    InvalidName(String),

    #[error("tool already registered: {0}")]
    Duplicate(String),

    #[error("invalid parameters schema for {name}: {reason}")]
    InvalidSchema { name: String, reason: String },
}
