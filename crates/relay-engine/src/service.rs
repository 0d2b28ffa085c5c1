use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use relay_core::events::ProgressEvent;
use relay_core::ids::SessionId;
use relay_core::messages::ConversationTurn;
use relay_core::schema::OutputSchema;
use relay_store::SessionStore;

use crate::error::ServiceError;
use crate::orchestrator::{FinalResult, Orchestrator, RunRequest};
use crate::progress::ProgressSink;
use crate::registry::ToolRegistry;

/// Everything that defines one kind of agent. Conversation state is kept per
/// `(session, agent_type)`.
#[derive(Clone)]
pub struct AgentSpec {
    pub agent_type: String,
    pub instructions: String,
    pub tools: Arc<ToolRegistry>,
    pub output_schema: Option<Arc<dyn OutputSchema>>,
    pub max_iterations: Option<u32>,
    pub max_parallel_tools: Option<usize>,
    /// Keep the final output in the session's result slot for other agents.
    pub share_result: bool,
}

impl AgentSpec {
    pub fn new(agent_type: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            instructions: instructions.into(),
            tools: Arc::new(ToolRegistry::new()),
            output_schema: None,
            max_iterations: None,
            max_parallel_tools: None,
            share_result: false,
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    pub fn with_output_schema(mut self, schema: Arc<dyn OutputSchema>) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = Some(n);
        self
    }

    pub fn with_max_parallel_tools(mut self, n: usize) -> Self {
        self.max_parallel_tools = Some(n);
        self
    }

    pub fn with_shared_result(mut self) -> Self {
        self.share_result = true;
        self
    }
}

impl std::fmt::Debug for AgentSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSpec")
            .field("agent_type", &self.agent_type)
            .field("tools", &self.tools.names())
            .field("output_schema", &self.output_schema.as_ref().map(|s| s.name()))
            .field("max_iterations", &self.max_iterations)
            .finish_non_exhaustive()
    }
}

/// Session-aware entry point: serializes calls per session and carries the
/// continuation token from one call to the next.
pub struct ConversationService {
    store: Arc<SessionStore>,
    orchestrator: Arc<Orchestrator>,
}

impl ConversationService {
    pub fn new(store: Arc<SessionStore>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Run one call for `spec.agent_type` in the given session.
    ///
    /// Fails fast with `SessionBusy` when another call holds the session. The
    /// stored token only advances on success.
    #[instrument(skip_all, fields(session_id = %session_id, agent_type = %spec.agent_type))]
    pub async fn send(
        &self,
        session_id: &SessionId,
        spec: &AgentSpec,
        input: Vec<ConversationTurn>,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<FinalResult, ServiceError> {
        let mut guard = match self.store.lock(session_id) {
            Ok(guard) => guard,
            Err(e) => {
                // The orchestrator never ran, so the stream still needs its terminal event.
                sink.report(ProgressEvent::error(e.to_string()).with_data(json!({ "kind": e.error_kind() })))
                    .await;
                return Err(e.into());
            }
        };

        let token = guard.continuation_token(&spec.agent_type).cloned();
        let mut request = RunRequest::new(spec.instructions.clone(), input)
            .with_tools(&spec.tools)
            .with_continuation(token);
        if let Some(schema) = &spec.output_schema {
            request = request.with_output_schema(schema.as_ref());
        }
        if let Some(n) = spec.max_iterations {
            request = request.with_max_iterations(n);
        }
        if let Some(n) = spec.max_parallel_tools {
            request = request.with_max_parallel_tools(n);
        }

        let result = self.orchestrator.run(request, sink, cancel).await?;

        let schema_name = spec.output_schema.as_ref().map(|s| s.name());
        guard.agent_mut(&spec.agent_type).record_success(
            result.continuation_token.clone(),
            result.iterations,
            &result.usage,
            schema_name,
        );
        if spec.share_result {
            let mut metadata = serde_json::Map::new();
            metadata.insert("iterations".into(), json!(result.iterations));
            if let Some(name) = schema_name {
                metadata.insert("schema".into(), json!(name));
            }
            guard.store_result(&spec.agent_type, result.output.to_value(), metadata);
        }
        info!(iterations = result.iterations, "conversation turn stored");
        Ok(result)
    }

    /// Convenience for a single user message.
    pub async fn send_text(
        &self,
        session_id: &SessionId,
        spec: &AgentSpec,
        text: impl Into<String>,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<FinalResult, ServiceError> {
        self.send(session_id, spec, vec![ConversationTurn::user_text(text)], sink, cancel)
            .await
    }

    /// Forget one agent's conversation in a session.
    pub fn reset_agent(&self, session_id: &SessionId, agent_type: &str) -> Result<bool, ServiceError> {
        let mut guard = self.store.lock(session_id)?;
        Ok(guard.reset_agent(agent_type))
    }

    /// Drop every agent's state and shared results in a session.
    pub fn clear_conversation(&self, session_id: &SessionId) -> Result<(), ServiceError> {
        let mut guard = self.store.lock(session_id)?;
        guard.clear_conversation();
        Ok(())
    }
}
