use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use delve_core::{CompletionRequest, CompletionResponse, Error, FinishReason, Message, Provider, Role};

use crate::{outbound_params, transport_error};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const FALLBACK_MODEL: &str = "gemini-2.5-flash";

pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: Option<String>,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    /// Gemini puts the model in the URL, so one must always be chosen.
    fn resolve_model(&self, request: &CompletionRequest) -> String {
        request
            .model
            .clone()
            .or_else(|| self.default_model.clone())
            .unwrap_or_else(|| FALLBACK_MODEL.to_string())
    }

    fn build_request(&self, request: &CompletionRequest) -> GeminiRequest {
        let mut system_instruction: Option<GeminiContent> = None;
        let mut contents: Vec<GeminiContent> = Vec::new();

        for msg in &request.messages {
            if msg.content.is_empty() {
                continue;
            }
            let part = GeminiPart {
                text: msg.content.clone(),
            };
            match msg.role {
                Role::System => system_instruction
                    .get_or_insert_with(|| GeminiContent {
                        role: None, // system_instruction has no role
                        parts: Vec::new(),
                    })
                    .parts
                    .push(part),
                Role::User => contents.push(GeminiContent {
                    role: Some("user".to_string()),
                    parts: vec![part],
                }),
                Role::Assistant => contents.push(GeminiContent {
                    role: Some("model".to_string()),
                    parts: vec![part],
                }),
            }
        }

        let generation_config = GeminiGenerationConfig {
            temperature: request.temperature,
            top_p: request.top_p,
            max_output_tokens: request.max_tokens,
            stop_sequences: request.stop.clone(),
            extra: outbound_params(&request.extra),
        };

        GeminiRequest {
            contents: merge_adjacent_contents(contents),
            system_instruction,
            generation_config: Some(generation_config),
        }
    }

    fn parse_response(&self, response: GeminiResponse, model: &str) -> Result<CompletionResponse, Error> {
        let GeminiResponse {
            candidates,
            usage_metadata,
            prompt_feedback,
            model_version,
        } = response;

        let candidate = candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| {
                // Check if this was a safety filter
                if let Some(reason) = prompt_feedback.as_ref().and_then(|f| f.block_reason.as_ref()) {
                    return Error::api(400, format!("Blocked by safety filter: {}", reason));
                }
                Error::api(500, "No candidates in Gemini response")
            })?;

        let content_text = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        let finish_reason = match candidate.finish_reason.as_deref() {
            Some("STOP") => FinishReason::Stop,
            Some("MAX_TOKENS") => FinishReason::Length,
            Some("SAFETY") | Some("RECITATION") | Some("BLOCKLIST") => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        };

        // Usage stays in Gemini's own shape; the accounting extractors read it
        // from there.
        let metadata = serde_json::json!({ "usageMetadata": usage_metadata });

        Ok(CompletionResponse {
            message: Message::assistant(content_text),
            usage: None,
            model: model_version.unwrap_or_else(|| model.to_string()),
            finish_reason,
            metadata,
        })
    }

    fn parse_error(&self, status: u16, body: &str) -> Error {
        #[derive(Deserialize)]
        struct ErrorResponse {
            error: ErrorDetail,
        }

        #[derive(Deserialize)]
        struct ErrorDetail {
            message: String,
            #[allow(dead_code)]
            status: Option<String>,
        }

        if let Ok(err) = serde_json::from_str::<ErrorResponse>(body) {
            match status {
                401 | 403 => Error::auth(err.error.message),
                429 => Error::rate_limit(err.error.message),
                400 => Error::invalid_request(err.error.message),
                _ => Error::api(status, err.error.message),
            }
        } else {
            Error::api(status, body.to_string())
        }
    }
}

/// Merge adjacent contents with the same role
fn merge_adjacent_contents(contents: Vec<GeminiContent>) -> Vec<GeminiContent> {
    let mut merged: Vec<GeminiContent> = Vec::new();

    for content in contents {
        if let Some(last) = merged.last_mut() {
            if last.role == content.role {
                last.parts.extend(content.parts);
                continue;
            }
        }
        merged.push(content);
    }

    merged
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    fn model_identifier(&self, request: &CompletionRequest) -> Option<String> {
        Some(self.resolve_model(request))
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let model = self.resolve_model(&request);
        let api_request = self.build_request(&request);

        debug!(
            model = %model,
            content_count = api_request.contents.len(),
            "Gemini request"
        );
        trace!(request = %serde_json::to_string(&api_request).unwrap_or_default(), "Gemini request payload");

        let response = self
            .client
            .post(format!("{}/models/{}:generateContent", self.base_url, model))
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %error_text, "Gemini request failed");
            return Err(self.parse_error(status.as_u16(), &error_text));
        }

        let response_text = response
            .text()
            .await
            .map_err(|e| Error::serialization(e.to_string()))?;

        trace!(response = %response_text, "Gemini response payload");

        let api_response: GeminiResponse = serde_json::from_str(&response_text)?;
        let parsed = self.parse_response(api_response, &model)?;

        debug!(
            model = %parsed.model,
            finish_reason = ?parsed.finish_reason,
            content_len = parsed.text().len(),
            "Gemini response"
        );

        Ok(parsed)
    }
}

// ── Gemini API types ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    /// Sampling knobs without a typed field (topK, seed, ...)
    #[serde(flatten)]
    extra: HashMap<String, serde_json::Value>,
}

// ── Response types ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(default)]
    usage_metadata: Option<serde_json::Value>,
    #[serde(default)]
    prompt_feedback: Option<GeminiPromptFeedback>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_creation() {
        let provider = GeminiProvider::new("test-key");
        assert_eq!(provider.name(), "gemini");
        assert_eq!(provider.default_model(), None);
    }

    #[test]
    fn test_provider_with_custom_url() {
        let provider = GeminiProvider::new("test-key")
            .with_base_url("https://custom.proxy.com/v1beta");
        assert_eq!(provider.base_url, "https://custom.proxy.com/v1beta");
    }

    #[test]
    fn test_build_request_basic() {
        let provider = GeminiProvider::new("test-key")
            .with_default_model("gemini-2.5-flash");
        let request = CompletionRequest::new(vec![Message::user("Hello")]);
        let api_request = provider.build_request(&request);

        assert_eq!(api_request.contents.len(), 1);
        assert_eq!(api_request.contents[0].role, Some("user".to_string()));
        assert!(api_request.system_instruction.is_none());
    }

    #[test]
    fn test_build_request_system_instruction() {
        let provider = GeminiProvider::new("test-key");
        let request = CompletionRequest::new(vec![
            Message::system("You are helpful."),
            Message::user("Hello"),
            Message::assistant("Hi"),
        ])
        .with_stop(vec!["STOP".to_string()])
        .with_extra("topK", serde_json::json!(20));
        let api_request = provider.build_request(&request);

        let system = api_request.system_instruction.as_ref().unwrap();
        assert!(system.role.is_none());
        assert_eq!(system.parts[0].text, "You are helpful.");
        assert_eq!(api_request.contents.len(), 2);
        assert_eq!(api_request.contents[1].role, Some("model".to_string()));

        let body = serde_json::to_value(&api_request).unwrap();
        assert_eq!(body["generationConfig"]["stopSequences"][0], "STOP");
        assert_eq!(body["generationConfig"]["topK"], 20);
    }

    #[test]
    fn test_parse_response_text() {
        let provider = GeminiProvider::new("test-key");
        let body = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hello!"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5, "totalTokenCount": 15}
        }"#;
        let response: GeminiResponse = serde_json::from_str(body).unwrap();

        let parsed = provider.parse_response(response, "gemini-2.5-flash").unwrap();
        assert_eq!(parsed.text(), "Hello!");
        assert_eq!(parsed.finish_reason, FinishReason::Stop);
        assert_eq!(parsed.model, "gemini-2.5-flash");

        let counts = provider.token_usage_of(&parsed).unwrap();
        assert_eq!((counts.input, counts.output, counts.total), (10, 5, 15));
    }

    #[test]
    fn test_parse_response_empty_candidates() {
        let provider = GeminiProvider::new("test-key");
        let response = GeminiResponse {
            candidates: None,
            usage_metadata: None,
            prompt_feedback: Some(GeminiPromptFeedback {
                block_reason: Some("SAFETY".to_string()),
            }),
            model_version: None,
        };

        let err = provider.parse_response(response, "gemini-2.5-flash").unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("safety filter"));
    }

    #[test]
    fn test_parse_error_auth() {
        let provider = GeminiProvider::new("test-key");
        let body = r#"{"error": {"message": "API key not valid", "status": "PERMISSION_DENIED"}}"#;
        let err = provider.parse_error(403, body);
        assert!(err.is_auth_error());
    }

    #[test]
    fn test_parse_error_rate_limit() {
        let provider = GeminiProvider::new("test-key");
        let body = r#"{"error": {"message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED"}}"#;
        let err = provider.parse_error(429, body);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_merge_adjacent_contents() {
        let text = |t: &str| GeminiPart { text: t.to_string() };
        let contents = vec![
            GeminiContent {
                role: Some("user".to_string()),
                parts: vec![text("Hello")],
            },
            GeminiContent {
                role: Some("user".to_string()),
                parts: vec![text("More context")],
            },
            GeminiContent {
                role: Some("model".to_string()),
                parts: vec![text("Here you go")],
            },
        ];

        let merged = merge_adjacent_contents(contents);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].role, Some("user".to_string()));
        assert_eq!(merged[0].parts.len(), 2);
        assert_eq!(merged[1].role, Some("model".to_string()));
    }

    #[test]
    fn test_resolve_model_default() {
        let provider = GeminiProvider::new("test-key");
        let request = CompletionRequest::new(vec![Message::user("Hello")]);
        assert_eq!(provider.resolve_model(&request), "gemini-2.5-flash");
        assert_eq!(provider.model_identifier(&request).as_deref(), Some("gemini-2.5-flash"));
    }

    #[test]
    fn test_resolve_model_from_request() {
        let provider = GeminiProvider::new("test-key")
            .with_default_model("gemini-2.5-pro");
        let request = CompletionRequest::new(vec![Message::user("Hello")])
            .with_model("gemini-2.0-flash");
        assert_eq!(provider.resolve_model(&request), "gemini-2.0-flash");
    }
}
