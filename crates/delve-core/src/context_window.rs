use std::collections::HashMap;

use tracing::warn;

use crate::error::Error;

/// Window assumed for models nobody told us about.
pub const DEFAULT_CONTEXT_WINDOW: usize = 8_192;

/// Share of the window a single chunk may occupy.
pub const DEFAULT_CHUNK_FRACTION: f64 = 0.5;

/// Look up the known context window size (in tokens) for a model by name.
///
/// Uses prefix matching on the lowercased model name for forward-compatibility
/// with date-suffixed variants (e.g., `claude-sonnet-4-20250514`). Local model
/// names are matched by family anywhere in the name, since GGUF files and
/// Ollama tags decorate them freely (`Qwen2.5-7B-Instruct-Q4_K_M.gguf`).
///
/// Returns `None` for unknown models.
pub fn known_context_window(model: &str) -> Option<usize> {
    let lowered = model.to_lowercase();
    let model = lowered.rsplit('/').next().unwrap_or(&lowered);

    // Claude models, all 200K
    if model.starts_with("claude-") {
        return Some(200_000);
    }

    // Gemini models
    if model.starts_with("gemini-2.5-") || model.starts_with("gemini-2.0-") {
        return Some(1_000_000);
    }
    if model.starts_with("gemini-1.5-pro") {
        return Some(2_000_000);
    }
    if model.starts_with("gemini-1.5-flash") {
        return Some(1_000_000);
    }

    // OpenAI o-series reasoning models
    if model.starts_with("o4-mini") || model.starts_with("o3") {
        return Some(200_000);
    }
    if model.starts_with("o1-mini") {
        return Some(128_000);
    }
    if model == "o1" || model.starts_with("o1-2") {
        return Some(200_000);
    }

    if model.starts_with("gpt-4o") || model.starts_with("chatgpt-4o") || model.starts_with("gpt-4-turbo") {
        return Some(128_000);
    }
    if model == "gpt-4" || model.starts_with("gpt-4-0") {
        return Some(8_192);
    }
    if model.starts_with("gpt-3.5-turbo") {
        return Some(16_385);
    }

    // Local families
    if model.contains("yarn-mistral") {
        return Some(if model.contains("128k") { 131_072 } else { 65_536 });
    }
    if model.contains("deepseek-r1-distill") || model.contains("deepseek-r1:") {
        return Some(32_768);
    }
    if model.contains("qwen2.5") || model.contains("qwen-2.5") {
        return Some(32_768);
    }
    if model.contains("llama-3.") || model.contains("llama3.") {
        return Some(128_000);
    }
    if model.contains("mistral-7b") || model.starts_with("mistral:") {
        return Some(32_768);
    }

    None
}

/// Model name to usable context size and recommended chunk size.
#[derive(Debug, Clone)]
pub struct ContextWindowOracle {
    overrides: HashMap<String, usize>,
    default_window: usize,
    chunk_fraction: f64,
}

impl Default for ContextWindowOracle {
    fn default() -> Self {
        Self {
            overrides: HashMap::new(),
            default_window: DEFAULT_CONTEXT_WINDOW,
            chunk_fraction: DEFAULT_CHUNK_FRACTION,
        }
    }
}

impl ContextWindowOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a model's window, taking precedence over the built-in table.
    pub fn with_override(mut self, model: impl AsRef<str>, window: usize) -> Self {
        self.overrides
            .insert(model.as_ref().to_lowercase(), window.max(2));
        self
    }

    pub fn with_overrides<I, S>(self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: AsRef<str>,
    {
        overrides
            .into_iter()
            .fold(self, |oracle, (model, window)| oracle.with_override(model, window))
    }

    pub fn with_default_window(mut self, window: usize) -> Self {
        self.default_window = window.max(2);
        self
    }

    pub fn with_chunk_fraction(mut self, fraction: f64) -> Self {
        self.chunk_fraction = fraction;
        self
    }

    pub fn default_window(&self) -> usize {
        self.default_window
    }

    /// The window if the model is known, without falling back.
    pub fn lookup(&self, model: &str) -> Result<usize, Error> {
        self.overrides
            .get(&model.to_lowercase())
            .copied()
            .or_else(|| known_context_window(model))
            .ok_or_else(|| Error::unknown_model(model))
    }

    pub fn context_window_for(&self, model: &str) -> usize {
        self.lookup(model).unwrap_or_else(|e| {
            warn!(error = %e, default = self.default_window, "Assuming default context window");
            self.default_window
        })
    }

    /// A fraction of the model's window, always in `1..window`.
    pub fn recommended_chunk_size(&self, model: &str) -> usize {
        let window = self.context_window_for(model);
        let size = (window as f64 * self.chunk_fraction).floor() as usize;
        size.clamp(1, window - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_models() {
        assert_eq!(known_context_window("claude-sonnet-4-20250514"), Some(200_000));
        assert_eq!(known_context_window("gemini-2.0-flash"), Some(1_000_000));
        assert_eq!(known_context_window("gemini-1.5-pro-latest"), Some(2_000_000));
        assert_eq!(known_context_window("gpt-4o-mini"), Some(128_000));
        assert_eq!(known_context_window("gpt-4"), Some(8_192));
        assert_eq!(known_context_window("o1-mini-2024-09-12"), Some(128_000));
        assert_eq!(known_context_window("models/gemini-2.5-flash"), Some(1_000_000));
    }

    #[test]
    fn test_local_families() {
        assert_eq!(known_context_window("Qwen2.5-7B-Instruct-Q4_K_M.gguf"), Some(32_768));
        assert_eq!(known_context_window("qwen2.5:14b"), Some(32_768));
        assert_eq!(known_context_window("DeepSeek-R1-Distill-Qwen-7B"), Some(32_768));
        assert_eq!(known_context_window("llama-3.1-70b"), Some(128_000));
        assert_eq!(known_context_window("yarn-mistral-7b-64k.Q4_K_M.gguf"), Some(65_536));
        assert_eq!(known_context_window("mistral-7b-instruct-v0.2"), Some(32_768));
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(known_context_window("Claude-Sonnet-4-20250514"), Some(200_000));
        assert_eq!(known_context_window("GPT-4o"), Some(128_000));
    }

    #[test]
    fn test_unknown_models() {
        assert_eq!(known_context_window("mixtral-8x7b"), None);
        assert_eq!(known_context_window("custom-model"), None);
    }

    #[test]
    fn test_unknown_model_gets_default() {
        let oracle = ContextWindowOracle::new();
        assert_eq!(oracle.context_window_for("custom-model"), DEFAULT_CONTEXT_WINDOW);
        match oracle.lookup("custom-model") {
            Err(Error::UnknownModel(model)) => assert_eq!(model, "custom-model"),
            other => panic!("expected unknown model, got {:?}", other),
        }
        assert_eq!(oracle.lookup("gpt-4").unwrap(), 8_192);
    }

    #[test]
    fn test_overrides_win() {
        let oracle = ContextWindowOracle::new().with_overrides([("My-Local", 4096), ("gpt-4o", 64_000)]);
        assert_eq!(oracle.context_window_for("my-local"), 4096);
        assert_eq!(oracle.context_window_for("gpt-4o"), 64_000);
    }

    #[test]
    fn test_recommended_chunk_size_is_inside_window() {
        let oracle = ContextWindowOracle::new()
            .with_override("tiny", 2)
            .with_override("small", 4096);
        assert_eq!(oracle.recommended_chunk_size("small"), 2048);
        assert_eq!(oracle.recommended_chunk_size("tiny"), 1);

        for fraction in [0.0, 0.5, 1.0, 3.0] {
            let oracle = ContextWindowOracle::new().with_chunk_fraction(fraction);
            for model in ["gpt-4", "claude-3-haiku", "unknown"] {
                let window = oracle.context_window_for(model);
                let size = oracle.recommended_chunk_size(model);
                assert!(size > 0 && size < window, "{model} {fraction}: {size} of {window}");
            }
        }
    }
}
