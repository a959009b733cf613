//! delve-providers: LLM provider implementations for delve
//!
//! This crate provides implementations of the Provider trait for the
//! Anthropic, Gemini and OpenAI-compatible chat APIs. The OpenAI adapter
//! also serves local llama.cpp and Ollama servers.

use std::collections::HashMap;

use delve_core::normalize::VOLATILE_PARAMS;
use delve_core::Error;

pub mod anthropic;
pub mod gemini;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAIProvider;

/// Extra parameters that are safe to put on the wire. Bookkeeping keys such
/// as run ids and callback tags never leave the process.
pub(crate) fn outbound_params(
    extra: &HashMap<String, serde_json::Value>,
) -> HashMap<String, serde_json::Value> {
    extra
        .iter()
        .filter(|(key, _)| !VOLATILE_PARAMS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Timeouts stay distinguishable from other transport failures.
pub(crate) fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(err.to_string())
    } else {
        Error::network(err.to_string())
    }
}
