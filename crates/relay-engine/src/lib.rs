//! The orchestration engine: the backend ⇄ tool loop, tool registry and
//! dispatch, progress delivery, and the session-aware conversation service.

pub mod dispatcher;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod service;
pub mod truncate;

pub use dispatcher::{DispatchConfig, ToolDispatcher};
pub use error::{OrchestrationError, RegistryError, ServiceError};
pub use orchestrator::{FinalOutput, FinalResult, Orchestrator, OrchestratorConfig, RunRequest};
pub use progress::{
    CallbackSink, ConsoleSink, EmitterConfig, NoopSink, OverflowPolicy, ProgressCallback,
    ProgressEmitter, ProgressSink, ProtocolProgress, QueueSink,
};
pub use registry::{Executor, ToolFn, ToolRegistry};
pub use service::{AgentSpec, ConversationService};
