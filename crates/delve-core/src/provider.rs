use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::accounting::{extract_usage, TokenCounts};
use crate::error::Error;
use crate::message::{Message, Usage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub stop: Vec<String>,
    /// Extra generation parameters passed through to the API (e.g. seed, top_k)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
    /// Request bookkeeping (trace ids, run ids, callback tags). Never sent to
    /// the provider and never part of the cache key.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            model: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
            stop: Vec::new(),
            extra: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub message: Message,
    /// Usage as reported in the provider's typed response, when it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub model: String,
    pub finish_reason: FinishReason,
    /// Provider-specific response fragments that may carry usage data in
    /// non-standard places.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl CompletionResponse {
    pub fn text(&self) -> &str {
        &self.message.content
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Error,
}

/// The LLM client capability every call site depends on.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Get the default model, if one is configured.
    /// Returns None if no default model is set (API will use its own default).
    fn default_model(&self) -> Option<&str>;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error>;

    /// The model a request will actually run against: request > provider default.
    fn model_identifier(&self, request: &CompletionRequest) -> Option<String> {
        request
            .model
            .clone()
            .or_else(|| self.default_model().map(str::to_string))
    }

    fn token_usage_of(&self, response: &CompletionResponse) -> Option<TokenCounts> {
        extract_usage(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedOnly(Option<String>);

    #[async_trait]
    impl Provider for NamedOnly {
        fn name(&self) -> &str {
            "named"
        }

        fn default_model(&self) -> Option<&str> {
            self.0.as_deref()
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, Error> {
            Err(Error::Unknown("not callable".to_string()))
        }
    }

    #[test]
    fn test_completion_request_builder() {
        let request = CompletionRequest::new(vec![Message::user("Hello")])
            .with_model("gpt-4")
            .with_temperature(0.7)
            .with_max_tokens(1000)
            .with_metadata("run_id", serde_json::json!("abc"));

        assert_eq!(request.model, Some("gpt-4".to_string()));
        assert_eq!(request.temperature, Some(0.7));
        assert_eq!(request.max_tokens, Some(1000));
        assert!(request.metadata.contains_key("run_id"));
    }

    #[test]
    fn test_model_identifier_prefers_request() {
        let provider = NamedOnly(Some("default-model".to_string()));
        let request = CompletionRequest::new(vec![Message::user("Hi")]);
        assert_eq!(provider.model_identifier(&request).as_deref(), Some("default-model"));

        let request = request.with_model("explicit");
        assert_eq!(provider.model_identifier(&request).as_deref(), Some("explicit"));

        let provider = NamedOnly(None);
        let request = CompletionRequest::new(vec![Message::user("Hi")]);
        assert_eq!(provider.model_identifier(&request), None);
    }

    #[test]
    fn test_response_round_trips_through_json() {
        let response = CompletionResponse {
            message: Message::assistant("done"),
            usage: Some(Usage::new(3, 1)),
            model: "m".to_string(),
            finish_reason: FinishReason::Stop,
            metadata: serde_json::Value::Null,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("metadata"));
        let back: CompletionResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.text(), "done");
        assert_eq!(back.usage, Some(Usage::new(3, 1)));
    }
}
