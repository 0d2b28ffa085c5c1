use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use relay_core::events::{ProgressEvent, ProgressStage};
use relay_core::messages::{ToolCall, ToolFailure, ToolResult};
use relay_core::tools::ToolError;
use relay_telemetry::{names, MetricsRecorder};

use crate::progress::ProgressEmitter;
use crate::registry::ToolRegistry;
use crate::truncate::truncate_message;

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Default concurrency when the caller does not set one.
    pub max_parallel: usize,
    /// Deadline for one batch, independent of the backend call timeout.
    pub batch_timeout: Duration,
    /// Cap on error messages fed back to the model.
    pub max_error_len: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_parallel: 5,
            batch_timeout: Duration::from_secs(120),
            max_error_len: 2000,
        }
    }
}

impl DispatchConfig {
    pub fn with_max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = n.max(1);
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn with_max_error_len(mut self, len: usize) -> Self {
        self.max_error_len = len;
        self
    }
}

/// Runs the tool calls of one backend response against a registry.
///
/// Calls are split into batches of at most `max_parallel`, run concurrently
/// within a batch. Every call yields exactly one [`ToolResult`], in call order;
/// failures of any kind become error payloads rather than errors.
pub struct ToolDispatcher {
    config: DispatchConfig,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl ToolDispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    #[instrument(skip_all, fields(calls = calls.len(), max_parallel = max_parallel))]
    pub async fn dispatch(
        &self,
        calls: &[ToolCall],
        registry: &ToolRegistry,
        max_parallel: usize,
        emitter: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        let max_parallel = max_parallel.max(1);
        let mut results = Vec::with_capacity(calls.len());

        for batch in calls.chunks(max_parallel) {
            if cancel.is_cancelled() {
                debug!(skipped = batch.len(), "dispatch cancelled, skipping batch");
                results.extend(batch.iter().map(|call| self.cancelled(call)));
                continue;
            }
            let deadline = Instant::now() + self.config.batch_timeout;
            let batch_results = join_all(
                batch
                    .iter()
                    .map(|call| self.run_call(call, registry, deadline, emitter, cancel)),
            )
            .await;
            results.extend(batch_results);
        }
        results
    }

    async fn run_call(
        &self,
        call: &ToolCall,
        registry: &ToolRegistry,
        deadline: Instant,
        emitter: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> ToolResult {
        emitter
            .emit(
                ProgressEvent::progress(ProgressStage::ToolStart, format!("Executing {}", call.name))
                    .with_data(json!({ "tool": call.name, "call_id": call.id })),
            )
            .await;
        let start = Instant::now();

        let result = match (registry.get(&call.name), call.malformed_arguments.as_deref()) {
            (None, _) => {
                warn!(tool = %call.name, "backend requested unknown tool");
                self.failure(call, ToolFailure::UnknownTool, format!("Unknown tool: {}", call.name))
            }
            (Some(_), Some(reason)) => {
                warn!(tool = %call.name, reason, "tool arguments are not valid JSON; not executing");
                self.failure(
                    call,
                    ToolFailure::InvalidArguments,
                    format!("Invalid arguments for {}: not valid JSON ({reason})", call.name),
                )
            }
            (Some(executor), None) => {
                let args = call.arguments.clone();
                // Closure executors run user code before their future exists.
                let exec = AssertUnwindSafe(async move { executor.execute(args).await }).catch_unwind();
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => self.cancelled(call),
                    outcome = tokio::time::timeout_at(deadline, exec) => match outcome {
                        Ok(Ok(Ok(value))) => ToolResult::ok(call.id.clone(), value),
                        Ok(Ok(Err(e))) => {
                            debug!(tool = %call.name, error = %e, "tool returned error");
                            self.failure(call, failure_kind(&e), e.to_string())
                        }
                        Ok(Err(panic)) => {
                            let msg = panic_message(&panic);
                            error!(tool = %call.name, panic = %msg, "tool panicked during execution");
                            self.failure(call, ToolFailure::Panicked, format!("Tool {} panicked: {msg}", call.name))
                        }
                        Err(_) => {
                            warn!(tool = %call.name, timeout = ?self.config.batch_timeout, "tool batch deadline reached");
                            self.failure(
                                call,
                                ToolFailure::Timeout,
                                format!("Tool {} timed out after {:?}", call.name, self.config.batch_timeout),
                            )
                        }
                    },
                }
            }
        };

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        if let Some(metrics) = &self.metrics {
            metrics.histogram_observe(names::TOOL_DURATION_MS, &[("tool", call.name.as_str())], elapsed_ms);
        }
        let status = if result.is_error() { "error" } else { "ok" };
        emitter
            .emit(
                ProgressEvent::progress(ProgressStage::ToolEnd, format!("Finished {}", call.name))
                    .with_data(json!({
                        "tool": call.name,
                        "call_id": call.id,
                        "status": status,
                        "duration_ms": elapsed_ms.round() as u64,
                    })),
            )
            .await;
        result
    }

    fn failure(&self, call: &ToolCall, kind: ToolFailure, message: String) -> ToolResult {
        ToolResult::error(
            call.id.clone(),
            kind,
            truncate_message(&message, self.config.max_error_len),
        )
    }

    fn cancelled(&self, call: &ToolCall) -> ToolResult {
        self.failure(call, ToolFailure::Cancelled, format!("Tool {} cancelled", call.name))
    }
}

fn failure_kind(err: &ToolError) -> ToolFailure {
    match err {
        ToolError::InvalidArguments(_) => ToolFailure::InvalidArguments,
        ToolError::ExecutionFailed(_) => ToolFailure::Execution,
        ToolError::Timeout(_) => ToolFailure::Timeout,
        ToolError::Cancelled => ToolFailure::Cancelled,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use relay_core::events::ProgressKind;
    use relay_core::messages::ToolOutput;
    use serde_json::Value;

    use crate::progress::{EmitterConfig, NoopSink, QueueSink};

    fn schema() -> Value {
        json!({"type": "object", "properties": {}})
    }

    fn noop_emitter() -> ProgressEmitter {
        ProgressEmitter::spawn(Arc::new(NoopSink), EmitterConfig::default())
    }

    fn error_of(result: &ToolResult) -> (ToolFailure, String) {
        match &result.output {
            ToolOutput::Error { kind, message } => (*kind, message.clone()),
            ToolOutput::Ok { value } => panic!("expected error, got {value}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_bounded_and_order_preserved() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        {
            let in_flight = Arc::clone(&in_flight);
            let high_water = Arc::clone(&high_water);
            registry
                .register_fn("slow_echo", "Echo after a pause", schema(), move |args: Value| {
                    let in_flight = Arc::clone(&in_flight);
                    let high_water = Arc::clone(&high_water);
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        high_water.fetch_max(now, Ordering::SeqCst);
                        // Later calls finish first.
                        let n = args["n"].as_u64().unwrap_or(0);
                        tokio::time::sleep(Duration::from_millis(100 - n * 10)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(json!(n))
                    }
                })
                .unwrap();
        }

        let calls: Vec<ToolCall> = (0..5)
            .map(|n| ToolCall::new("slow_echo", json!({ "n": n })))
            .collect();
        let dispatcher = ToolDispatcher::new(DispatchConfig::default());
        let emitter = noop_emitter();
        let results = dispatcher
            .dispatch(&calls, &registry, 2, &emitter, &CancellationToken::new())
            .await;

        assert_eq!(high_water.load(Ordering::SeqCst), 2);
        assert_eq!(results.len(), 5);
        for (n, (call, result)) in calls.iter().zip(&results).enumerate() {
            assert_eq!(result.call_id, call.id);
            assert_eq!(result.payload(), json!(n));
        }
    }

    #[tokio::test]
    async fn unknown_tool_becomes_payload() {
        let registry = ToolRegistry::new();
        let calls = vec![ToolCall::new("missing_tool", json!({}))];
        let results = ToolDispatcher::new(DispatchConfig::default())
            .dispatch(&calls, &registry, 5, &noop_emitter(), &CancellationToken::new())
            .await;
        let (kind, message) = error_of(&results[0]);
        assert_eq!(kind, ToolFailure::UnknownTool);
        assert_eq!(message, "Unknown tool: missing_tool");
        assert_eq!(results[0].payload(), json!({"error": "Unknown tool: missing_tool"}));
    }

    #[tokio::test]
    async fn malformed_arguments_skip_execution() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        {
            let runs = Arc::clone(&runs);
            registry
                .register_fn("delete_file", "Delete a file", schema(), move |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    async { Ok(json!("deleted")) }
                })
                .unwrap();
        }

        let mut bad = ToolCall::new("delete_file", json!("{\"path\": \"/tmp/x\""));
        bad.malformed_arguments = Some("EOF while parsing an object".into());
        let calls = vec![bad, ToolCall::new("delete_file", json!({"path": "/tmp/y"}))];
        let results = ToolDispatcher::new(DispatchConfig::default())
            .dispatch(&calls, &registry, 5, &noop_emitter(), &CancellationToken::new())
            .await;

        let (kind, message) = error_of(&results[0]);
        assert_eq!(kind, ToolFailure::InvalidArguments);
        assert!(message.starts_with("Invalid arguments for delete_file"), "got: {message}");
        assert!(message.contains("EOF while parsing"));
        assert_eq!(results[1].payload(), json!("deleted"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panics_and_errors_are_contained() {
        let mut registry = ToolRegistry::new();
        registry
            .register_fn("explode", "Panics", schema(), |_| async {
                if true {
                    panic!("boom");
                }
                Ok(json!(null))
            })
            .unwrap();
        registry
            .register_fn("explode_early", "Panics before returning a future", schema(), |_: Value| -> std::future::Ready<Result<Value, ToolError>> {
                panic!("too early")
            })
            .unwrap();
        registry
            .register_fn("noisy", "Fails with a long message", schema(), |_| async {
                Err(ToolError::failed("x".repeat(5000)))
            })
            .unwrap();
        registry
            .register_fn("ok", "Succeeds", schema(), |_| async { Ok(json!("fine")) })
            .unwrap();

        let calls = vec![
            ToolCall::new("explode", json!({})),
            ToolCall::new("explode_early", json!({})),
            ToolCall::new("noisy", json!({})),
            ToolCall::new("ok", json!({})),
        ];
        let dispatcher =
            ToolDispatcher::new(DispatchConfig::default().with_max_error_len(100));
        let results = dispatcher
            .dispatch(&calls, &registry, 5, &noop_emitter(), &CancellationToken::new())
            .await;

        let (kind, message) = error_of(&results[0]);
        assert_eq!(kind, ToolFailure::Panicked);
        assert!(message.contains("boom"));

        let (kind, message) = error_of(&results[1]);
        assert_eq!(kind, ToolFailure::Panicked);
        assert!(message.contains("too early"));

        let (kind, message) = error_of(&results[2]);
        assert_eq!(kind, ToolFailure::Execution);
        assert!(message.len() < 200);
        assert!(message.contains("[truncated"));

        assert_eq!(results[3].payload(), json!("fine"));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_deadline_times_out_stragglers() {
        let mut registry = ToolRegistry::new();
        registry
            .register_fn("fast", "Quick", schema(), |_| async { Ok(json!(1)) })
            .unwrap();
        registry
            .register_fn("stuck", "Never finishes in time", schema(), |_| async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(json!(2))
            })
            .unwrap();

        let calls = vec![
            ToolCall::new("stuck", json!({})),
            ToolCall::new("fast", json!({})),
        ];
        let dispatcher = ToolDispatcher::new(
            DispatchConfig::default().with_batch_timeout(Duration::from_secs(1)),
        );
        let started = Instant::now();
        let results = dispatcher
            .dispatch(&calls, &registry, 5, &noop_emitter(), &CancellationToken::new())
            .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(error_of(&results[0]).0, ToolFailure::Timeout);
        assert_eq!(results[1].payload(), json!(1));
    }

    #[tokio::test]
    async fn tool_error_kinds_are_preserved() {
        let mut registry = ToolRegistry::new();
        registry
            .register_fn("picky", "Rejects input", schema(), |_| async {
                Err(ToolError::InvalidArguments("city is required".into()))
            })
            .unwrap();
        let calls = vec![ToolCall::new("picky", json!({}))];
        let results = ToolDispatcher::new(DispatchConfig::default())
            .dispatch(&calls, &registry, 1, &noop_emitter(), &CancellationToken::new())
            .await;
        let (kind, message) = error_of(&results[0]);
        assert_eq!(kind, ToolFailure::InvalidArguments);
        assert_eq!(message, "invalid arguments: city is required");
    }

    #[tokio::test]
    async fn cancellation_stops_further_batches() {
        let executed = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let mut registry = ToolRegistry::new();
        {
            let executed = Arc::clone(&executed);
            let cancel = cancel.clone();
            registry
                .register_fn("cancel_after", "Cancels the run", schema(), move |_| {
                    let executed = Arc::clone(&executed);
                    let cancel = cancel.clone();
                    async move {
                        executed.fetch_add(1, Ordering::SeqCst);
                        cancel.cancel();
                        Ok(json!("done"))
                    }
                })
                .unwrap();
        }

        let calls: Vec<ToolCall> = (0..3)
            .map(|_| ToolCall::new("cancel_after", json!({})))
            .collect();
        let results = ToolDispatcher::new(DispatchConfig::default())
            .dispatch(&calls, &registry, 1, &noop_emitter(), &cancel)
            .await;

        assert_eq!(executed.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].payload(), json!("done"));
        assert_eq!(error_of(&results[1]).0, ToolFailure::Cancelled);
        assert_eq!(error_of(&results[2]).0, ToolFailure::Cancelled);
    }

    #[tokio::test]
    async fn emits_start_and_end_per_call() {
        let mut registry = ToolRegistry::new();
        registry
            .register_fn("get_current_time", "Time", schema(), |_| async {
                Ok(json!({"time": "12:00"}))
            })
            .unwrap();
        let (sink, mut rx) = QueueSink::channel(QueueSink::DEFAULT_CAPACITY);
        let emitter = ProgressEmitter::spawn(Arc::new(sink), EmitterConfig::default());
        let calls = vec![ToolCall::new("get_current_time", json!({}))];
        let metrics = Arc::new(MetricsRecorder::new());
        ToolDispatcher::new(DispatchConfig::default())
            .with_metrics(Some(Arc::clone(&metrics)))
            .dispatch(&calls, &registry, 5, &emitter, &CancellationToken::new())
            .await;
        emitter
            .emit(ProgressEvent::result("done", json!({})))
            .await;
        emitter.finish().await;

        let start = rx.recv().await.unwrap();
        assert_eq!(start.stage, Some(ProgressStage::ToolStart));
        assert_eq!(start.data.as_ref().unwrap()["tool"], "get_current_time");
        let end = rx.recv().await.unwrap();
        assert_eq!(end.stage, Some(ProgressStage::ToolEnd));
        assert_eq!(end.data.as_ref().unwrap()["status"], "ok");
        assert_eq!(rx.recv().await.unwrap().kind, ProgressKind::Result);

        let summary =
            metrics.histogram_summary(names::TOOL_DURATION_MS, &[("tool", "get_current_time")]);
        assert_eq!(summary.count, 1);
    }
}
