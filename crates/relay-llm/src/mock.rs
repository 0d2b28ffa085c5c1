use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use relay_core::backend::{Backend, BackendRequest, BackendResponse, ResponseOutput};
use relay_core::errors::BackendError;
use relay_core::ids::ContinuationToken;
use relay_core::messages::ToolCall;
use relay_core::tokens::TokenUsage;

/// Pre-programmed outcomes for deterministic testing without network calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    Text(String),
    Structured(serde_json::Value),
    /// `(tool name, arguments)` pairs; call ids are generated.
    ToolCalls(Vec<(String, serde_json::Value)>),
    /// Fully specified response; the continuation token is used as given.
    Full(BackendResponse),
    Error(BackendError),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
    /// Never resolves. For cancellation and timeout tests.
    Hang,
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    pub fn tool_call(name: &str, arguments: serde_json::Value) -> Self {
        Self::ToolCalls(vec![(name.to_string(), arguments)])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    pub fn server_error() -> Self {
        Self::Error(BackendError::ServerError {
            status: 500,
            body: "internal".into(),
        })
    }
}

/// Backend that replays scripted responses in order.
///
/// Once the script is exhausted the `repeat` response (if any) is returned for
/// every further call; otherwise the call fails with `InvalidRequest`.
pub struct MockBackend {
    name: String,
    endpoint: String,
    script: Mutex<VecDeque<MockResponse>>,
    repeat: Option<MockResponse>,
    requests: Mutex<Vec<BackendRequest>>,
    call_count: AtomicUsize,
}

impl MockBackend {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            name: "mock".into(),
            endpoint: "mock://backend".into(),
            script: Mutex::new(responses.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// A backend that answers every call with `response`.
    pub fn always(response: MockResponse) -> Self {
        Self::new(Vec::new()).repeating(response)
    }

    pub fn repeating(mut self, response: MockResponse) -> Self {
        self.repeat = Some(response);
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<BackendRequest> {
        self.requests.lock().last().cloned()
    }

    fn next_response(&self) -> Option<MockResponse> {
        self.script
            .lock()
            .pop_front()
            .or_else(|| self.repeat.clone())
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let Some(mut current) = self.next_response() else {
            return Err(BackendError::InvalidRequest(format!(
                "MockBackend: no response configured for call {idx}"
            )));
        };

        // Nested delays unrolled iteratively.
        loop {
            match current {
                MockResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
                MockResponse::Hang => std::future::pending::<()>().await,
                MockResponse::Error(e) => return Err(e),
                MockResponse::Full(response) => return Ok(response),
                MockResponse::Text(text) => return Ok(respond(idx, ResponseOutput::Text { text })),
                MockResponse::Structured(value) => {
                    return Ok(respond(idx, ResponseOutput::Structured { value }))
                }
                MockResponse::ToolCalls(calls) => {
                    let calls = calls
                        .into_iter()
                        .map(|(name, args)| ToolCall::new(name, args))
                        .collect();
                    return Ok(respond(idx, ResponseOutput::ToolCalls { calls }));
                }
            }
        }
    }
}

fn respond(idx: usize, output: ResponseOutput) -> BackendResponse {
    BackendResponse {
        continuation_token: ContinuationToken::from_backend(format!("resp_mock_{idx}")),
        output,
        reasoning: Vec::new(),
        usage: TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        },
        incomplete: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::messages::ConversationTurn;

    fn request() -> BackendRequest {
        BackendRequest::new("test", vec![ConversationTurn::user_text("hi")])
    }

    #[tokio::test]
    async fn replays_in_order() {
        let mock = MockBackend::new(vec![
            MockResponse::text("one"),
            MockResponse::tool_call("get_current_time", serde_json::json!({})),
        ]);

        let first = mock.call(&request()).await.unwrap();
        assert_eq!(first.output, ResponseOutput::Text { text: "one".into() });
        assert_eq!(first.continuation_token.as_str(), "resp_mock_0");

        let second = mock.call(&request()).await.unwrap();
        match second.output {
            ResponseOutput::ToolCalls { calls } => assert_eq!(calls[0].name, "get_current_time"),
            other => panic!("expected tool calls, got {other:?}"),
        }
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_script_errors() {
        let mock = MockBackend::new(vec![]);
        let err = mock.call(&request()).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn repeat_after_script() {
        let mock = MockBackend::new(vec![MockResponse::server_error()])
            .repeating(MockResponse::text("steady"));
        assert!(mock.call(&request()).await.is_err());
        for _ in 0..3 {
            assert!(mock.call(&request()).await.is_ok());
        }
        assert_eq!(mock.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_then_respond() {
        let mock = MockBackend::new(vec![MockResponse::delayed(
            Duration::from_secs(5),
            MockResponse::text("late"),
        )]);
        let start = tokio::time::Instant::now();
        mock.call(&request()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn hang_never_resolves() {
        let mock = MockBackend::new(vec![MockResponse::Hang]);
        let res = tokio::time::timeout(Duration::from_secs(60), mock.call(&request())).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn records_requests() {
        let mock = MockBackend::always(MockResponse::text("ok"));
        let mut req = request();
        req.continuation_token = Some(ContinuationToken::from_backend("resp_prev"));
        mock.call(&req).await.unwrap();

        let seen = mock.last_request().unwrap();
        assert_eq!(seen.continuation_token.unwrap().as_str(), "resp_prev");
        assert_eq!(mock.requests().len(), 1);
    }
}
