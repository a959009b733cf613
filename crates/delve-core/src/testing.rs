//! Test utilities shared across the workspace.
//! Only compiled when running tests or with the `testing` feature.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::Error;
use crate::message::{Message, Usage};
use crate::provider::{CompletionRequest, CompletionResponse, FinishReason, Provider};

type Responder = Box<dyn Fn(&CompletionRequest) -> Result<CompletionResponse, Error> + Send + Sync>;

/// Build a plain assistant reply.
pub fn text_response(content: &str, usage: Option<Usage>) -> CompletionResponse {
    CompletionResponse {
        message: Message::assistant(content),
        usage,
        model: "mock-model".to_string(),
        finish_reason: FinishReason::Stop,
        metadata: serde_json::Value::Null,
    }
}

/// A mock provider that returns pre-configured responses.
///
/// Queued outcomes are consumed first (FIFO); once the queue is empty the
/// responder, if any, answers every call.
pub struct MockProvider {
    outcomes: Mutex<Vec<Result<CompletionResponse, Error>>>,
    responder: Option<Responder>,
    delay: Option<Duration>,
    /// Captured requests (for assertion).
    pub captured_requests: Mutex<Vec<CompletionRequest>>,
    pub name: String,
    pub default_model: Option<String>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(Vec::new()),
            responder: None,
            delay: None,
            captured_requests: Mutex::new(Vec::new()),
            name: "mock".to_string(),
            default_model: Some("mock-model".to_string()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_default_model(mut self, model: Option<&str>) -> Self {
        self.default_model = model.map(str::to_string);
        self
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<CompletionResponse, Error> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Sleep this long after capturing each request, before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a response to be returned by the next complete() call.
    pub fn queue_response(&self, content: &str) {
        self.queue_raw_response(text_response(content, None));
    }

    pub fn queue_response_with_usage(&self, content: &str, input: u32, output: u32) {
        self.queue_raw_response(text_response(content, Some(Usage::new(input, output))));
    }

    pub fn queue_raw_response(&self, response: CompletionResponse) {
        self.outcomes.lock().unwrap().insert(0, Ok(response));
    }

    pub fn queue_error(&self, error: Error) {
        self.outcomes.lock().unwrap().insert(0, Err(error));
    }

    /// Get the number of captured requests.
    pub fn request_count(&self) -> usize {
        self.captured_requests.lock().unwrap().len()
    }

    /// Get the last captured request.
    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.captured_requests.lock().unwrap().last().cloned()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        self.captured_requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(outcome) = self.outcomes.lock().unwrap().pop() {
            return outcome;
        }
        match &self.responder {
            Some(responder) => responder(&request),
            None => Err(Error::Unknown("No mock response queued".to_string())),
        }
    }
}
