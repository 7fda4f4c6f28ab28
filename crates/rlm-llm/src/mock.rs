//! Mock LLM provider for deterministic testing.
//!
//! Returns pre-configured responses without making any HTTP calls. Responses
//! can be queued in order, or computed from the request by a responder closure
//! when the call order is not deterministic (concurrent batches).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::provider::*;
use rlm_core::{Result, RlmError};

type Responder = Arc<dyn Fn(&LlmRequest) -> MockResponse + Send + Sync>;

/// A mock LLM provider that returns pre-configured responses.
///
/// # Example
/// ```
/// use rlm_llm::mock::MockProvider;
/// let provider = MockProvider::new("mock")
///     .with_response("Hello, world!");
/// ```
pub struct MockProvider {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    responder: Option<Responder>,
    /// Track all requests received (for assertions in tests).
    pub requests: Arc<Mutex<Vec<LlmRequest>>>,
    name: String,
}

/// A pre-configured response from the mock provider.
#[derive(Clone)]
pub struct MockResponse {
    pub text: String,
    pub stop_reason: StopReason,
    pub usage: Usage,
    /// Simulated latency before the response is returned.
    pub delay: Option<Duration>,
    /// If set, the provider will return this error instead.
    pub error: Option<String>,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            text: String::new(),
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 100,
                output_tokens: 50,
                estimated_cost_usd: 0.001,
            },
            delay: None,
            error: None,
        }
    }
}

impl MockResponse {
    /// Create a text response.
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    /// Create an error response.
    pub fn error(msg: &str) -> Self {
        Self {
            error: Some(msg.to_string()),
            ..Default::default()
        }
    }

    /// Delay this response by `delay`.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            responder: None,
            requests: Arc::new(Mutex::new(vec![])),
            name: name.into(),
        }
    }

    /// Queue a simple text response.
    pub fn with_response(self, text: &str) -> Self {
        self.responses.lock().push_back(MockResponse::text(text));
        self
    }

    /// Queue an error response.
    pub fn with_error(self, error: &str) -> Self {
        self.responses.lock().push_back(MockResponse::error(error));
        self
    }

    /// Queue a fully custom response.
    pub fn with_mock_response(self, resp: MockResponse) -> Self {
        self.responses.lock().push_back(resp);
        self
    }

    /// Compute responses from the request once the queue is drained.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&LlmRequest) -> MockResponse + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Get all requests that were made to this provider.
    pub fn recorded_requests(&self) -> Arc<Mutex<Vec<LlmRequest>>> {
        Arc::clone(&self.requests)
    }

    /// Number of requests seen so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Pop the next queued response, fall back to the responder, or return a
    /// default "no response queued" message.
    fn next_response(&self, request: &LlmRequest) -> MockResponse {
        if let Some(resp) = self.responses.lock().pop_front() {
            return resp;
        }
        match &self.responder {
            Some(responder) => responder(request),
            None => MockResponse::text("(mock: no more queued responses)"),
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn models(&self) -> Vec<String> {
        vec!["mock-model".to_string()]
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.requests.lock().push(request.clone());
        let mock = self.next_response(request);

        if let Some(delay) = mock.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = mock.error {
            return Err(RlmError::Backend(error));
        }

        Ok(LlmResponse {
            text: mock.text,
            usage: mock.usage,
            stop_reason: mock.stop_reason,
        })
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
