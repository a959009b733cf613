use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use delve_core::{Rates, RetryPolicy, SummarizerConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfigEntry>,

    #[serde(default)]
    pub primary: PrimaryConfig,

    #[serde(default)]
    pub summarizer: SummarizerSection,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-category rates merged over the built-in pricing table
    #[serde(default)]
    pub pricing: BTreeMap<String, Rates>,

    /// Context window overrides, model name to tokens
    #[serde(default)]
    pub context_windows: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfigEntry {
    /// Provider type: anthropic, gemini or openai. Inferred when unset.
    #[serde(default, rename = "type")]
    pub provider_type: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub default_model: Option<String>,

    /// Runs on this machine: no API key needed, billed to the local categories
    #[serde(default)]
    pub local: bool,

    /// Extra parameters to pass to the API (e.g., seed, top_k)
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

/// The model that answers `ask`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PrimaryConfig {
    #[serde(default)]
    pub provider: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    /// Default system prompt
    #[serde(default)]
    pub system: Option<String>,

    /// Accounting category; derived from the provider's locality when unset
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SummarizerSection {
    /// Remote provider; falls back to the primary provider
    #[serde(default)]
    pub provider: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub local_provider: Option<String>,

    #[serde(default)]
    pub local_model: Option<String>,

    #[serde(flatten)]
    pub settings: SummarizerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path to the response database (supports $HOME, ~)
    #[serde(default)]
    pub path: Option<String>,

    /// Normalize requests before keying; false keys on exact requests only
    #[serde(default = "default_true")]
    pub normalize: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None, // Will default to <cache_dir>/delve/responses.db
            normalize: true,
        }
    }
}

impl CacheConfig {
    /// Where the response database lives, if anywhere.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path
            .as_deref()
            .map(expand_path)
            .or_else(|| dirs::cache_dir().map(|d| d.join("delve").join("responses.db")))
    }
}

/// Expand environment variables in a path string
/// Supports: $VAR, ${VAR}, ~
pub fn expand_path(path: &str) -> PathBuf {
    let mut result = path.to_string();

    // Expand ~ at the start
    if result.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            result = format!("{}{}", home.display(), &result[1..]);
        }
    } else if result == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    // Expand $VAR and ${VAR}
    let Ok(re) = regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?") else {
        return PathBuf::from(result);
    };
    let expanded = re.replace_all(&result, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    });

    PathBuf::from(expanded.to_string())
}

impl Config {
    /// Load from `path`, or from the default location when none is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Invalid configuration in {}", config_path.display()))
        } else if path.is_some() {
            anyhow::bail!("Configuration file not found: {}", config_path.display())
        } else {
            anyhow::bail!(
                "No configuration found. Run `delve setup` or create {} with at least:\n\n\
                 [providers.openai]\n\
                 api_key = \"sk-...\"\n\
                 default_model = \"gpt-4o-mini\"\n\n\
                 [primary]\n\
                 provider = \"openai\"\n",
                config_path.display()
            )
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("delve"))
    }

    /// Name of the provider that answers `ask`: the configured one, or the
    /// only provider when there is exactly one.
    pub fn primary_provider(&self) -> Result<&str> {
        if let Some(name) = &self.primary.provider {
            return Ok(name.as_str());
        }
        let mut names = self.providers.keys();
        match (names.next(), names.next()) {
            (Some(only), None) => Ok(only.as_str()),
            (None, _) => anyhow::bail!("No providers configured"),
            _ => anyhow::bail!("Several providers configured; set [primary] provider"),
        }
    }

    pub fn summarizer_provider(&self) -> Result<&str> {
        match &self.summarizer.provider {
            Some(name) => Ok(name.as_str()),
            None => self.primary_provider(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
            [providers.openai]
            api_key = "sk-test"
            default_model = "gpt-4o-mini"

            [providers.llama]
            base_url = "http://localhost:8080/v1"
            default_model = "qwen2.5-7b-instruct"
            local = true

            [primary]
            provider = "openai"

            [summarizer]
            local_provider = "llama"
            local_first = true
            chunk_size = 2000
            max_combine_depth = 2

            [cache]
            path = "/tmp/delve-test.db"
            normalize = false

            [retry]
            max_attempts = 5

            [pricing.primary-cloud]
            input_per_1k = 0.01
            output_per_1k = 0.03

            [context_windows]
            "qwen2.5-7b-instruct" = 16384
        "#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.providers.len(), 2);
        assert!(config.providers["llama"].local);
        assert_eq!(config.primary_provider().unwrap(), "openai");
        assert_eq!(config.summarizer_provider().unwrap(), "openai");

        let summarizer = &config.summarizer.settings;
        assert!(summarizer.local_first);
        assert_eq!(summarizer.chunk_size_tokens, Some(2000));
        assert_eq!(summarizer.max_combine_depth, 2);
        assert_eq!(summarizer.chunk_overlap, SummarizerConfig::default().chunk_overlap);

        assert!(config.cache.enabled);
        assert!(!config.cache.normalize);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, RetryPolicy::default().initial_backoff_ms);
        assert_eq!(config.pricing["primary-cloud"], Rates::new(0.01, 0.03));
        assert_eq!(config.context_windows["qwen2.5-7b-instruct"], 16384);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert!(config.cache.enabled);
        assert!(config.cache.normalize);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.summarizer.settings, SummarizerConfig::default());
        assert!(config.primary_provider().is_err());
    }

    #[test]
    fn test_single_provider_is_primary() {
        let config = Config::parse("[providers.anthropic]\ndefault_model = \"claude-3-5-haiku-latest\"\n").unwrap();
        assert_eq!(config.primary_provider().unwrap(), "anthropic");
    }

    #[test]
    fn test_ambiguous_primary() {
        let config = Config::parse("[providers.a]\n[providers.b]\n").unwrap();
        assert!(config.primary_provider().is_err());
    }

    #[test]
    fn test_provider_type_rename() {
        let config = Config::parse("[providers.work]\ntype = \"anthropic\"\n").unwrap();
        assert_eq!(config.providers["work"].provider_type.as_deref(), Some("anthropic"));
    }

    #[test]
    fn test_load_missing_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cache]\nenabled = false\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert!(!config.cache.enabled);
    }

    #[test]
    fn test_expand_path() {
        std::env::set_var("DELVE_TEST_DIR", "/srv/delve");
        assert_eq!(expand_path("$DELVE_TEST_DIR/cache.db"), PathBuf::from("/srv/delve/cache.db"));
        assert_eq!(expand_path("${DELVE_TEST_DIR}/x"), PathBuf::from("/srv/delve/x"));
        assert_eq!(expand_path("$DELVE_UNSET_VAR/x"), PathBuf::from("$DELVE_UNSET_VAR/x"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/cache.db"), home.join("cache.db"));
        }
    }

    #[test]
    fn test_cache_path_override() {
        let cache = CacheConfig {
            path: Some("/var/tmp/responses.db".to_string()),
            ..CacheConfig::default()
        };
        assert_eq!(cache.resolved_path(), Some(PathBuf::from("/var/tmp/responses.db")));
    }
}
