//! Wires configuration into providers, the response cache, the usage
//! collector and the summarizer.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use delve_core::{
    CacheStore, CachingProvider, ContextWindowOracle, KeyMode, ModelRole, PricingTable, Provider,
    RequestNormalizer, Summarizer, SummaryModel, UsageCollector,
};
use delve_providers::{AnthropicProvider, GeminiProvider, OpenAIProvider};

use crate::config::{Config, ProviderConfigEntry, SummarizerSection};

/// `cache.path` value that keeps responses in process memory only.
const IN_MEMORY: &str = ":memory:";

/// A provider resolved from configuration.
pub struct ResolvedProvider {
    pub name: String,
    pub provider: Arc<dyn Provider>,
    pub local: bool,
}

pub struct Services {
    config: Config,
    collector: Arc<UsageCollector>,
    store: Option<Arc<CacheStore>>,
}

impl Services {
    /// `use_cache = false` bypasses the response cache for this run.
    pub fn new(config: &Config, use_cache: bool) -> Result<Self> {
        let pricing = PricingTable::default().merge(config.pricing.clone());
        let collector = Arc::new(UsageCollector::new(pricing));

        let store = if use_cache && config.cache.enabled {
            Some(Arc::new(open_store(config)?))
        } else {
            debug!("Response cache disabled");
            None
        };

        Ok(Self {
            config: config.clone(),
            collector,
            store,
        })
    }

    pub fn collector(&self) -> &Arc<UsageCollector> {
        &self.collector
    }

    pub fn store(&self) -> Option<&Arc<CacheStore>> {
        self.store.as_ref()
    }

    pub fn provider(&self, name: &str) -> Result<ResolvedProvider> {
        let entry = self
            .config
            .providers
            .get(name)
            .with_context(|| format!("Provider '{}' not found in config", name))?;
        let provider = create_provider(name, entry)?;
        Ok(ResolvedProvider {
            name: name.to_string(),
            provider: Arc::from(provider),
            local: entry.local,
        })
    }

    /// Wrap a provider with caching, retries and accounting under `category`.
    pub fn layer(&self, inner: Arc<dyn Provider>, category: &str) -> CachingProvider {
        let mode = if self.config.cache.normalize {
            KeyMode::Normalized
        } else {
            KeyMode::Exact
        };
        let layer = CachingProvider::new(inner, Arc::clone(&self.collector), category)
            .with_normalizer(RequestNormalizer::new().with_mode(mode))
            .with_retry(self.config.retry.clone());
        match &self.store {
            Some(store) => layer.with_store(Arc::clone(store)),
            None => layer,
        }
    }

    /// The layered provider that answers `ask`.
    pub fn primary(&self) -> Result<CachingProvider> {
        let resolved = self.provider(self.config.primary_provider()?)?;
        let category = self
            .config
            .primary
            .category
            .clone()
            .unwrap_or_else(|| ModelRole::Primary.category(resolved.local).to_string());
        debug!(provider = %resolved.name, category = %category, "Primary provider ready");
        Ok(self.layer(resolved.provider, &category))
    }

    pub fn oracle(&self) -> ContextWindowOracle {
        ContextWindowOracle::new().with_overrides(
            self.config
                .context_windows
                .iter()
                .map(|(model, window)| (model.as_str(), *window)),
        )
    }

    pub fn summarizer(&self, local_first: bool) -> Result<Summarizer> {
        let section = &self.config.summarizer;

        let remote = self.summary_model(
            self.config.summarizer_provider()?,
            section.model.as_deref(),
        )?;
        let mut settings = section.settings.clone();
        settings.local_first |= local_first;

        let mut summarizer = Summarizer::new(remote, self.oracle()).with_config(settings);

        match &section.local_provider {
            Some(name) => {
                summarizer = summarizer.with_local(self.summary_model(name, section.local_model.as_deref())?);
            }
            None if local_first_unserved(section, local_first) => {
                warn!("local_first requested but no [summarizer] local_provider configured");
            }
            None => {}
        }

        Ok(summarizer)
    }

    fn summary_model(&self, provider_name: &str, model: Option<&str>) -> Result<SummaryModel> {
        let resolved = self.provider(provider_name)?;
        let model = model
            .map(str::to_string)
            .or_else(|| resolved.provider.default_model().map(str::to_string))
            .with_context(|| {
                format!(
                    "No model for summarizer provider '{}'; set a model or default_model",
                    provider_name
                )
            })?;

        let category = ModelRole::Summarizer.category(resolved.local);
        let layered: Arc<dyn Provider> = Arc::new(self.layer(resolved.provider, category));
        Ok(if resolved.local {
            SummaryModel::local(layered, model)
        } else {
            SummaryModel::remote(layered, model)
        })
    }

    /// Log token usage, spend and cache effectiveness for this run.
    pub fn report(&self) {
        self.collector.log_summary();
        if let Some(store) = &self.store {
            let stats = store.stats();
            info!(
                hits = stats.hits,
                misses = stats.misses,
                normalized_hits = stats.normalized_hits,
                writes = stats.writes,
                hit_rate = stats.hit_rate(),
                "Cache statistics"
            );
        }
    }
}

/// Local-first was asked for, on the command line or in `[summarizer]`,
/// with no local model to serve it.
fn local_first_unserved(section: &SummarizerSection, cli_local_first: bool) -> bool {
    (cli_local_first || section.settings.local_first) && section.local_provider.is_none()
}

pub fn open_store(config: &Config) -> Result<CacheStore> {
    if config.cache.path.as_deref() == Some(IN_MEMORY) {
        return Ok(CacheStore::in_memory());
    }
    match config.cache.resolved_path() {
        Some(path) => CacheStore::open(&path)
            .with_context(|| format!("Failed to open response cache at {}", path.display())),
        None => {
            warn!("No cache directory available, caching in memory for this run");
            Ok(CacheStore::in_memory())
        }
    }
}

/// Resolve the provider type from explicit config, provider name, or base_url.
///
/// Priority:
/// 1. Explicit `type` in provider config always wins
/// 2. If no type but base_url is set → "openai" (OpenAI-compatible mode)
/// 3. If no type and no base_url → infer from provider name
fn resolve_provider_type(
    explicit_type: Option<&str>,
    provider_name: &str,
    base_url: Option<&str>,
) -> String {
    if let Some(t) = explicit_type {
        return t.to_lowercase();
    }

    if base_url.is_some() {
        return "openai".to_string();
    }

    let name = provider_name.to_lowercase();
    match name.as_str() {
        "anthropic" | "claude" => "anthropic".to_string(),
        "gemini" | "google" => "gemini".to_string(),
        _ => "openai".to_string(),
    }
}

fn resolve_api_key(provider_name: &str, entry: &ProviderConfigEntry) -> Result<String> {
    if let Some(key) = &entry.api_key {
        return Ok(key.clone());
    }
    let env_var = format!("{}_API_KEY", provider_name.to_uppercase().replace('-', "_"));
    match std::env::var(&env_var) {
        Ok(key) => Ok(key),
        Err(_) if entry.local => Ok(String::new()),
        Err(_) => anyhow::bail!(
            "API key not found for provider '{}'. Set {} or api_key in the config",
            provider_name,
            env_var
        ),
    }
}

fn create_provider(provider_name: &str, entry: &ProviderConfigEntry) -> Result<Box<dyn Provider>> {
    let api_key = resolve_api_key(provider_name, entry)?;
    let provider_type = resolve_provider_type(
        entry.provider_type.as_deref(),
        provider_name,
        entry.base_url.as_deref(),
    );

    match provider_type.as_str() {
        "anthropic" => {
            let mut provider = AnthropicProvider::new(api_key);
            if let Some(model) = &entry.default_model {
                provider = provider.with_default_model(model);
            }
            if let Some(url) = &entry.base_url {
                provider = provider.with_base_url(url);
            }
            Ok(Box::new(provider))
        }
        "gemini" => {
            let mut provider = GeminiProvider::new(api_key);
            if let Some(model) = &entry.default_model {
                provider = provider.with_default_model(model);
            }
            if let Some(url) = &entry.base_url {
                provider = provider.with_base_url(url);
            }
            Ok(Box::new(provider))
        }
        "openai" => {
            // Default: OpenAI-compatible
            let mut provider = OpenAIProvider::new(api_key).with_name(provider_name);
            if let Some(model) = &entry.default_model {
                provider = provider.with_default_model(model);
            }
            if let Some(url) = &entry.base_url {
                provider = provider.with_base_url(url);
            }
            Ok(Box::new(provider))
        }
        other => anyhow::bail!("Unknown provider type '{}' for '{}'", other, provider_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delve_core::testing::MockProvider;
    use delve_core::{CacheOutcome, CompletionRequest, Message, Strategy};

    fn config(extra: &str) -> Config {
        let toml = format!(
            r#"
            [providers.openai]
            api_key = "sk-test"
            default_model = "gpt-4o-mini"

            [providers.llama]
            base_url = "http://127.0.0.1:8080/v1"
            default_model = "qwen2.5-7b-instruct"
            local = true

            [cache]
            enabled = false
            {}
            "#,
            extra
        );
        Config::parse(&toml).unwrap()
    }

    #[test]
    fn test_resolve_provider_type_explicit() {
        assert_eq!(resolve_provider_type(Some("anthropic"), "whatever", None), "anthropic");
        assert_eq!(resolve_provider_type(Some("Gemini"), "whatever", None), "gemini");
        // Explicit type wins even with base_url
        assert_eq!(
            resolve_provider_type(Some("anthropic"), "openai", Some("http://localhost:8080")),
            "anthropic"
        );
    }

    #[test]
    fn test_resolve_provider_type_base_url_defaults_openai() {
        assert_eq!(
            resolve_provider_type(None, "anthropic", Some("http://proxy.example.com")),
            "openai"
        );
    }

    #[test]
    fn test_resolve_provider_type_name_inference() {
        assert_eq!(resolve_provider_type(None, "claude", None), "anthropic");
        assert_eq!(resolve_provider_type(None, "google", None), "gemini");
        assert_eq!(resolve_provider_type(None, "ollama", None), "openai");
    }

    #[test]
    fn test_local_provider_needs_no_key() {
        let entry = ProviderConfigEntry {
            local: true,
            ..Default::default()
        };
        assert_eq!(resolve_api_key("delve-test-local", &entry).unwrap(), "");

        let remote = ProviderConfigEntry::default();
        assert!(resolve_api_key("delve-test-remote", &remote).is_err());
    }

    #[test]
    fn test_unknown_provider_type() {
        let entry = ProviderConfigEntry {
            provider_type: Some("carrier-pigeon".to_string()),
            api_key: Some("k".to_string()),
            ..Default::default()
        };
        assert!(create_provider("birds", &entry).is_err());
    }

    #[test]
    fn test_primary_category_follows_locality() {
        let services = Services::new(&config("[primary]\nprovider = \"llama\""), true).unwrap();
        let primary = services.primary().unwrap();
        assert_eq!(primary.category(), "primary-local");
        assert!(!primary.caches());

        let services = Services::new(&config("[primary]\nprovider = \"openai\""), true).unwrap();
        assert_eq!(services.primary().unwrap().category(), "primary-cloud");
    }

    #[test]
    fn test_missing_provider() {
        let services = Services::new(&config("[primary]\nprovider = \"nope\""), false).unwrap();
        assert!(services.primary().is_err());
    }

    #[test]
    fn test_summarizer_plan_uses_local_first() {
        let services = Services::new(
            &config("[primary]\nprovider = \"openai\"\n[summarizer]\nlocal_provider = \"llama\""),
            false,
        )
        .unwrap();

        let plan = services.summarizer(false).unwrap().plan("short text");
        assert_eq!(plan.model, "gpt-4o-mini");
        assert!(!plan.local);

        let plan = services.summarizer(true).unwrap().plan("short text");
        assert_eq!(plan.model, "qwen2.5-7b-instruct");
        assert!(plan.local);
        assert_eq!(plan.strategy, Strategy::SinglePass);
    }

    #[test]
    fn test_local_first_from_config_without_local_provider() {
        let from_config = config("[primary]\nprovider = \"openai\"\n[summarizer]\nlocal_first = true");
        assert!(local_first_unserved(&from_config.summarizer, false));
        assert!(local_first_unserved(&config("").summarizer, true));
        assert!(!local_first_unserved(&config("").summarizer, false));

        let served = config("[summarizer]\nlocal_first = true\nlocal_provider = \"llama\"");
        assert!(!local_first_unserved(&served.summarizer, true));

        let services = Services::new(&from_config, false).unwrap();
        let plan = services.summarizer(false).unwrap().plan("short text");
        assert_eq!(plan.model, "gpt-4o-mini");
        assert!(!plan.fell_back_to_remote);
    }

    #[test]
    fn test_context_window_overrides_reach_the_oracle() {
        let services = Services::new(
            &config("[primary]\nprovider = \"openai\"\n[context_windows]\n\"gpt-4o-mini\" = 4096"),
            false,
        )
        .unwrap();
        assert_eq!(services.oracle().context_window_for("gpt-4o-mini"), 4096);

        // 4096 window with at least 1024 reserved: 3073 estimated tokens no longer fit
        let plan = services.summarizer(false).unwrap().plan(&"x".repeat(3073 * 4));
        assert_eq!(plan.strategy, Strategy::SplitCombine);
    }

    #[tokio::test]
    async fn test_layer_serves_repeat_from_disk_cache() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("responses.db");
        let config = config("[primary]\nprovider = \"openai\"").with_cache_path(&db);
        let services = Services::new(&config, true).unwrap();

        let mock = Arc::new(MockProvider::new());
        mock.queue_response_with_usage("Paris.", 1000, 500);
        let layer = services.layer(mock.clone(), "primary-cloud");

        let first = CompletionRequest::new(vec![Message::user("What is the capital of France?")]);
        let second = CompletionRequest::new(vec![Message::user("  What is the   capital of France?\n")]);

        let (_, outcome) = layer.complete_traced(first).await.unwrap();
        assert_eq!(outcome, CacheOutcome::Miss);
        let (response, outcome) = layer.complete_traced(second).await.unwrap();
        assert_eq!(outcome, CacheOutcome::NormalizedHit);
        assert_eq!(response.text(), "Paris.");
        assert_eq!(mock.request_count(), 1);

        let collector = services.collector();
        assert_eq!(collector.get_total_cost().as_dollars(), 0.02);
        assert_eq!(collector.get_avoided_cost().as_dollars(), 0.02);
        assert!(db.exists());
    }

    #[tokio::test]
    async fn test_exact_mode_misses_on_whitespace() {
        let mut config = config("[primary]\nprovider = \"openai\"");
        config.cache.normalize = false;
        let config = config.with_cache_path(":memory:");
        let services = Services::new(&config, true).unwrap();

        let mock = Arc::new(MockProvider::new().with_responder(|_| {
            Ok(delve_core::testing::text_response("ok", None))
        }));
        let layer = services.layer(mock.clone(), "primary-cloud");

        layer
            .complete_traced(CompletionRequest::new(vec![Message::user("hello world")]))
            .await
            .unwrap();
        let (_, outcome) = layer
            .complete_traced(CompletionRequest::new(vec![Message::user("hello  world")]))
            .await
            .unwrap();
        assert_eq!(outcome, CacheOutcome::Miss);
        assert_eq!(mock.request_count(), 2);
    }

    impl Config {
        fn with_cache_path(mut self, path: impl AsRef<std::path::Path>) -> Self {
            self.cache.enabled = true;
            self.cache.path = Some(path.as_ref().display().to_string());
            self
        }
    }
}
