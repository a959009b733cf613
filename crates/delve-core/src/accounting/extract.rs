//! Token usage extraction from heterogeneous response shapes.
//!
//! Providers report usage in different places and under different names.
//! Each [`UsageExtractor`] knows one shape; they are tried in order and the
//! first one that yields a complete triple wins.

use serde_json::Value;
use tracing::debug;

use crate::provider::CompletionResponse;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenCounts {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            total: input.saturating_add(output),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageExtractor {
    /// The typed `usage` field filled in by the provider adapter.
    ReportedUsage,
    /// `usage_metadata { input_tokens, output_tokens, total_tokens }`
    UsageMetadata,
    /// `llm_output.token_usage { prompt_tokens, completion_tokens, total_tokens }`
    LlmOutputTokenUsage,
    /// `usageMetadata { promptTokenCount, candidatesTokenCount, totalTokenCount }`
    GeminiUsageMetadata,
    /// `additional_kwargs.usage`, either naming scheme.
    AdditionalKwargs,
    /// `response_metadata.usage` or `response_metadata.token_usage`.
    ResponseMetadata,
    /// Top-level `usage`, either naming scheme.
    ProviderUsage,
}

pub const DEFAULT_EXTRACTORS: &[UsageExtractor] = &[
    UsageExtractor::ReportedUsage,
    UsageExtractor::UsageMetadata,
    UsageExtractor::LlmOutputTokenUsage,
    UsageExtractor::GeminiUsageMetadata,
    UsageExtractor::AdditionalKwargs,
    UsageExtractor::ResponseMetadata,
    UsageExtractor::ProviderUsage,
];

const INPUT_OUTPUT: (&str, &str, &str) = ("input_tokens", "output_tokens", "total_tokens");
const PROMPT_COMPLETION: (&str, &str, &str) = ("prompt_tokens", "completion_tokens", "total_tokens");
const GEMINI_COUNTS: (&str, &str, &str) = (
    "promptTokenCount",
    "candidatesTokenCount",
    "totalTokenCount",
);

impl UsageExtractor {
    pub fn name(&self) -> &'static str {
        match self {
            UsageExtractor::ReportedUsage => "reported_usage",
            UsageExtractor::UsageMetadata => "usage_metadata",
            UsageExtractor::LlmOutputTokenUsage => "llm_output.token_usage",
            UsageExtractor::GeminiUsageMetadata => "usageMetadata",
            UsageExtractor::AdditionalKwargs => "additional_kwargs.usage",
            UsageExtractor::ResponseMetadata => "response_metadata",
            UsageExtractor::ProviderUsage => "usage",
        }
    }

    pub fn extract(&self, response: &CompletionResponse) -> Option<TokenCounts> {
        let meta = &response.metadata;
        match self {
            UsageExtractor::ReportedUsage => response.usage.map(|u| TokenCounts {
                input: u64::from(u.prompt_tokens),
                output: u64::from(u.completion_tokens),
                total: u64::from(u.total_tokens),
            }),
            UsageExtractor::UsageMetadata => triple(meta.get("usage_metadata")?, INPUT_OUTPUT),
            UsageExtractor::LlmOutputTokenUsage => triple(
                meta.get("llm_output")?.get("token_usage")?,
                PROMPT_COMPLETION,
            ),
            UsageExtractor::GeminiUsageMetadata => {
                triple(meta.get("usageMetadata")?, GEMINI_COUNTS)
            }
            UsageExtractor::AdditionalKwargs => {
                either_naming(meta.get("additional_kwargs")?.get("usage")?)
            }
            UsageExtractor::ResponseMetadata => {
                let rm = meta.get("response_metadata")?;
                rm.get("usage")
                    .and_then(either_naming)
                    .or_else(|| rm.get("token_usage").and_then(either_naming))
            }
            UsageExtractor::ProviderUsage => either_naming(meta.get("usage")?),
        }
    }
}

/// Run the default extractor chain.
pub fn extract_usage(response: &CompletionResponse) -> Option<TokenCounts> {
    extract_with(DEFAULT_EXTRACTORS, response)
}

pub fn extract_with(
    extractors: &[UsageExtractor],
    response: &CompletionResponse,
) -> Option<TokenCounts> {
    for extractor in extractors {
        if let Some(counts) = extractor.extract(response) {
            debug!(shape = extractor.name(), input = counts.input, output = counts.output, "Extracted token usage");
            return Some(counts);
        }
    }

    let keys: Vec<&str> = response
        .metadata
        .as_object()
        .map(|m| m.keys().map(String::as_str).collect())
        .unwrap_or_default();
    debug!(model = %response.model, metadata_keys = ?keys, "No token usage found in response");
    None
}

fn either_naming(value: &Value) -> Option<TokenCounts> {
    triple(value, INPUT_OUTPUT).or_else(|| triple(value, PROMPT_COMPLETION))
}

/// Input and output are required; a missing total is derived from them.
fn triple(value: &Value, (input, output, total): (&str, &str, &str)) -> Option<TokenCounts> {
    let input = value.get(input)?.as_u64()?;
    let output = value.get(output)?.as_u64()?;
    let total = match value.get(total) {
        Some(t) => t.as_u64()?,
        None => input.saturating_add(output),
    };
    Some(TokenCounts {
        input,
        output,
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Usage};
    use crate::provider::FinishReason;
    use serde_json::json;

    fn response(usage: Option<Usage>, metadata: Value) -> CompletionResponse {
        CompletionResponse {
            message: Message::assistant("ok"),
            usage,
            model: "test-model".to_string(),
            finish_reason: FinishReason::Stop,
            metadata,
        }
    }

    #[test]
    fn test_typed_usage_wins() {
        let resp = response(
            Some(Usage::new(10, 5)),
            json!({"usage": {"prompt_tokens": 99, "completion_tokens": 99, "total_tokens": 198}}),
        );
        assert_eq!(extract_usage(&resp), Some(TokenCounts::new(10, 5)));
    }

    #[test]
    fn test_usage_metadata_shape() {
        let resp = response(
            None,
            json!({"usage_metadata": {"input_tokens": 120, "output_tokens": 30, "total_tokens": 150}}),
        );
        assert_eq!(extract_usage(&resp), Some(TokenCounts::new(120, 30)));
    }

    #[test]
    fn test_llm_output_token_usage_shape() {
        let resp = response(
            None,
            json!({"llm_output": {"token_usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}}}),
        );
        assert_eq!(
            UsageExtractor::LlmOutputTokenUsage.extract(&resp),
            Some(TokenCounts::new(7, 3))
        );
        assert_eq!(extract_usage(&resp), Some(TokenCounts::new(7, 3)));
    }

    #[test]
    fn test_gemini_shape() {
        let resp = response(
            None,
            json!({"usageMetadata": {"promptTokenCount": 40, "candidatesTokenCount": 8, "totalTokenCount": 48}}),
        );
        assert_eq!(extract_usage(&resp), Some(TokenCounts::new(40, 8)));
    }

    #[test]
    fn test_nested_shapes_either_naming() {
        let resp = response(
            None,
            json!({"additional_kwargs": {"usage": {"input_tokens": 4, "output_tokens": 2}}}),
        );
        assert_eq!(extract_usage(&resp), Some(TokenCounts::new(4, 2)));

        let resp = response(
            None,
            json!({"response_metadata": {"token_usage": {"prompt_tokens": 6, "completion_tokens": 1, "total_tokens": 7}}}),
        );
        assert_eq!(extract_usage(&resp), Some(TokenCounts::new(6, 1)));
    }

    #[test]
    fn test_incomplete_shape_falls_through() {
        // usage_metadata lacks output_tokens, so the top-level usage is used.
        let resp = response(
            None,
            json!({
                "usage_metadata": {"input_tokens": 1},
                "usage": {"input_tokens": 11, "output_tokens": 22}
            }),
        );
        assert_eq!(extract_usage(&resp), Some(TokenCounts::new(11, 22)));
    }

    #[test]
    fn test_huge_counts_saturate() {
        let meta = json!({"usage": {"input_tokens": u64::MAX, "output_tokens": 7}});
        let counts = extract_usage(&response(None, meta)).unwrap();
        assert_eq!(counts.input, u64::MAX);
        assert_eq!(counts.total, u64::MAX);
        assert_eq!(TokenCounts::new(u64::MAX, u64::MAX).total, u64::MAX);
    }

    #[test]
    fn test_no_usage_anywhere() {
        let resp = response(None, json!({"id": "msg_1"}));
        assert_eq!(extract_usage(&resp), None);
        assert_eq!(extract_usage(&response(None, Value::Null)), None);
    }

    #[test]
    fn test_custom_order() {
        let resp = response(
            Some(Usage::new(1, 1)),
            json!({"usage": {"input_tokens": 50, "output_tokens": 5}}),
        );
        let counts = extract_with(&[UsageExtractor::ProviderUsage], &resp);
        assert_eq!(counts, Some(TokenCounts::new(50, 5)));
    }
}
