use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use relay_core::backend::{BackendRequest, ResponseOutput, ToolChoice};
use relay_core::events::{ProgressEvent, ProgressStage};
use relay_core::ids::{ContinuationToken, RunId};
use relay_core::messages::ConversationTurn;
use relay_core::schema::OutputSchema;
use relay_core::tokens::TokenUsage;
use relay_llm::ClientPool;
use relay_telemetry::{names, MetricsRecorder};

use crate::dispatcher::{DispatchConfig, ToolDispatcher};
use crate::error::OrchestrationError;
use crate::progress::{EmitterConfig, ProgressEmitter, ProgressSink};
use crate::registry::ToolRegistry;

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Used when a run does not set its own limit.
    pub max_iterations: u32,
    pub dispatch: DispatchConfig,
    pub emitter: EmitterConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            dispatch: DispatchConfig::default(),
            emitter: EmitterConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n.max(1);
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_emitter(mut self, emitter: EmitterConfig) -> Self {
        self.emitter = emitter;
        self
    }
}

/// Inputs for one orchestration call.
pub struct RunRequest<'a> {
    pub instructions: String,
    pub input: Vec<ConversationTurn>,
    pub tools: Option<&'a ToolRegistry>,
    /// Forwarded unchanged on the first round; `None` starts fresh.
    pub continuation_token: Option<ContinuationToken>,
    pub output_schema: Option<&'a dyn OutputSchema>,
    pub max_iterations: Option<u32>,
    pub max_parallel_tools: Option<usize>,
}

impl<'a> RunRequest<'a> {
    pub fn new(instructions: impl Into<String>, input: Vec<ConversationTurn>) -> Self {
        Self {
            instructions: instructions.into(),
            input,
            tools: None,
            continuation_token: None,
            output_schema: None,
            max_iterations: None,
            max_parallel_tools: None,
        }
    }

    pub fn with_tools(mut self, tools: &'a ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_continuation(mut self, token: Option<ContinuationToken>) -> Self {
        self.continuation_token = token;
        self
    }

    pub fn with_output_schema(mut self, schema: &'a dyn OutputSchema) -> Self {
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
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FinalOutput {
    Text(String),
    /// Already validated against the run's output schema.
    Structured(serde_json::Value),
}

impl FinalOutput {
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Self::Text(text) => serde_json::Value::String(text.clone()),
            Self::Structured(value) => value.clone(),
        }
    }

    /// Human-readable form used as the `result` event message.
    pub fn summary(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured(value) => value.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub output: FinalOutput,
    pub continuation_token: ContinuationToken,
    /// Backend rounds used, including the final one.
    pub iterations: u32,
    pub usage: TokenUsage,
    pub tool_calls: u32,
}

/// Drives the backend ⇄ tool loop for one call.
pub struct Orchestrator {
    pool: Arc<ClientPool>,
    dispatcher: ToolDispatcher,
    config: OrchestratorConfig,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Orchestrator {
    pub fn new(pool: Arc<ClientPool>, config: OrchestratorConfig) -> Self {
        Self {
            pool,
            dispatcher: ToolDispatcher::new(config.dispatch.clone()),
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        self.dispatcher = ToolDispatcher::new(self.config.dispatch.clone()).with_metrics(metrics.clone());
        self.metrics = metrics;
        self
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run until the backend produces a final answer or the call fails.
    ///
    /// The sink receives progress events in program order and exactly one
    /// terminal `result` or `error`. Cancelling `cancel` (or dropping the
    /// returned future) releases the pool slot and stops tool dispatch.
    #[instrument(skip_all, fields(run_id = %RunId::new()))]
    pub async fn run(
        &self,
        request: RunRequest<'_>,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<FinalResult, OrchestrationError> {
        let emitter = ProgressEmitter::spawn(sink, self.config.emitter.clone());

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(OrchestrationError::Cancelled),
            result = self.drive(&request, &emitter, cancel) => result,
        };

        match &outcome {
            Ok(result) => {
                info!(
                    iterations = result.iterations,
                    tool_calls = result.tool_calls,
                    tokens = result.usage.total(),
                    "orchestration complete"
                );
                if let Some(m) = &self.metrics {
                    m.histogram_observe(
                        names::ORCHESTRATION_ITERATIONS,
                        &[("outcome", "completed")],
                        f64::from(result.iterations),
                    );
                }
                let data = json!({
                    "output": result.output.to_value(),
                    "continuation_token": result.continuation_token,
                    "iterations": result.iterations,
                    "usage": result.usage,
                });
                emitter
                    .emit(ProgressEvent::result(result.output.summary(), data))
                    .await;
            }
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "orchestration failed");
                if let (Some(m), OrchestrationError::MaxIterationsExceeded(n)) = (&self.metrics, e) {
                    m.histogram_observe(
                        names::ORCHESTRATION_ITERATIONS,
                        &[("outcome", "max_iterations")],
                        f64::from(*n),
                    );
                }
                emitter
                    .emit(ProgressEvent::error(e.to_string()).with_data(json!({ "kind": e.error_kind() })))
                    .await;
            }
        }

        let dropped = emitter.finish().await;
        if dropped > 0 {
            warn!(dropped, "progress events dropped on overflow");
        }
        outcome
    }

    async fn drive(
        &self,
        req: &RunRequest<'_>,
        emitter: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Result<FinalResult, OrchestrationError> {
        let max_iterations = req.max_iterations.unwrap_or(self.config.max_iterations).max(1);
        let max_parallel = req
            .max_parallel_tools
            .unwrap_or(self.config.dispatch.max_parallel)
            .max(1);
        let empty = ToolRegistry::new();
        let registry = req.tools.unwrap_or(&empty);
        let tool_defs = (!registry.is_empty()).then(|| registry.definitions());
        let schema_spec = req.output_schema.map(|s| s.spec());

        let mut input = req.input.clone();
        let mut token = req.continuation_token.clone();
        let mut usage = TokenUsage::default();
        let mut tool_calls = 0u32;

        for iteration in 1..=max_iterations {
            emitter
                .emit(
                    ProgressEvent::progress(
                        ProgressStage::Iteration,
                        format!("Processing iteration {iteration}/{max_iterations}"),
                    )
                    .with_data(json!({ "iteration": iteration, "max_iterations": max_iterations })),
                )
                .await;

            let mut request = BackendRequest::new(req.instructions.clone(), std::mem::take(&mut input));
            request.continuation_token = token.take();
            request.output_schema = schema_spec.clone();
            if let Some(defs) = &tool_defs {
                request.tools = Some(defs.clone());
                if iteration == max_iterations && schema_spec.is_some() {
                    // Last round: the model has to produce the structured answer.
                    request.tool_choice = ToolChoice::None;
                }
            }

            let response = self.pool.call(&request).await?;
            debug!(iteration, "backend responded");

            for summary in &response.reasoning {
                emitter
                    .emit(ProgressEvent::progress(ProgressStage::Reasoning, summary.clone()))
                    .await;
            }
            usage.accumulate(&response.usage);

            if let Some(reason) = response.incomplete {
                if iteration == max_iterations {
                    warn!(max_iterations, reason = %reason, "iteration limit reached on an incomplete response");
                    return Err(OrchestrationError::MaxIterationsExceeded(max_iterations));
                }
                warn!(iteration, reason = %reason, "response incomplete, continuing");
                emitter
                    .emit(
                        ProgressEvent::progress(
                            ProgressStage::Iteration,
                            format!("Response incomplete ({reason}), continuing"),
                        )
                        .with_data(json!({ "iteration": iteration, "incomplete": reason })),
                    )
                    .await;
                // Same input again, chained to the partial response.
                input = std::mem::take(&mut request.input);
                token = Some(response.continuation_token);
                continue;
            }

            let output = match response.output {
                ResponseOutput::Text { text } => match req.output_schema {
                    Some(schema) => FinalOutput::Structured(schema.parse(&text)?),
                    None => FinalOutput::Text(text),
                },
                ResponseOutput::Structured { value } => {
                    if let Some(schema) = req.output_schema {
                        schema.check(&value)?;
                    }
                    FinalOutput::Structured(value)
                }
                ResponseOutput::ToolCalls { mut calls } => {
                    if iteration == max_iterations {
                        warn!(
                            max_iterations,
                            pending = calls.len(),
                            "iteration limit reached with tool calls pending"
                        );
                        return Err(OrchestrationError::MaxIterationsExceeded(max_iterations));
                    }
                    for call in &mut calls {
                        call.turn_index = iteration;
                    }
                    tool_calls += calls.len() as u32;

                    emitter
                        .emit(ProgressEvent::progress(
                            ProgressStage::Tools,
                            format!("Executing {} tool call(s)", calls.len()),
                        ))
                        .await;
                    let results = self
                        .dispatcher
                        .dispatch(&calls, registry, max_parallel, emitter, cancel)
                        .await;
                    if cancel.is_cancelled() {
                        return Err(OrchestrationError::Cancelled);
                    }

                    // Later rounds carry only the tool results, chained by token.
                    input = results.into_iter().map(ConversationTurn::tool_result).collect();
                    token = Some(response.continuation_token);
                    continue;
                }
            };

            return Ok(FinalResult {
                output,
                continuation_token: response.continuation_token,
                iterations: iteration,
                usage,
                tool_calls,
            });
        }

        Err(OrchestrationError::MaxIterationsExceeded(max_iterations))
    }
}
