use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use delve_core::{CompletionRequest, Message};

mod config;
mod services;
mod setup;

use config::Config;
use services::Services;

/// Log level for tracing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Most verbose: request and response payloads
    Trace,
    /// Verbose: cache hits and misses, extracted usage
    Debug,
    /// Standard: strategy choices, fallbacks, usage summary
    Info,
    /// Quiet: only warnings and errors
    Warn,
    /// Minimal: only errors
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(name = "delve")]
#[command(author, version, about = "Delve: cached LLM queries and context-aware summarization", long_about = None)]
pub struct Cli {
    /// Configuration file (default: <config dir>/delve/config.toml)
    #[arg(long, global = true, env = "DELVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_enum, default_value = "warn", global = true)]
    pub log_level: LogLevel,

    /// Enable debug logging (shorthand for --log-level debug)
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Write logs to file (JSON-lines format)
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Print token usage and cost to stderr when done
    #[arg(long, global = true)]
    pub usage: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a single prompt to the primary model
    Ask {
        prompt: String,

        /// System prompt (overrides config)
        #[arg(short, long)]
        system: Option<String>,

        /// Model to use (overrides config)
        #[arg(short, long)]
        model: Option<String>,

        /// Temperature (0.0-2.0)
        #[arg(short, long)]
        temperature: Option<f32>,

        /// Maximum tokens to generate
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Skip the response cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Summarize a file, or stdin when no file is given
    Summarize {
        file: Option<PathBuf>,

        /// Research question to steer the summary toward
        #[arg(short, long)]
        focus: Option<String>,

        /// Prefer the local model when the content fits its window
        #[arg(long)]
        local_first: bool,

        /// Skip the response cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Show how content would be summarized, without calling a model
    Plan {
        file: Option<PathBuf>,

        #[arg(long)]
        local_first: bool,
    },
    /// Inspect or clear the response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Show current configuration
    Config,
    /// Initialize the configuration file
    Setup,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum CacheAction {
    /// Entry count and location
    Stats,
    /// Remove every cached response
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Resolve log level: --debug overrides --log-level
    let log_level = if cli.debug {
        LogLevel::Debug
    } else {
        cli.log_level
    };

    // Set up logging
    let filter = EnvFilter::new(log_level.as_filter());

    if let Some(log_path) = &cli.log_file {
        // Log file specified: write JSON to file
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {:?}", log_path))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
            .init();
    } else {
        // Results go to stdout, logs to stderr
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };

    // Handle setup before config is required
    if matches!(cli.command, Commands::Setup) {
        return setup::run(&config_path);
    }

    // Load configuration (required for all other commands)
    let config = Config::load(cli.config.as_deref())?;

    match &cli.command {
        Commands::Ask {
            prompt,
            system,
            model,
            temperature,
            max_tokens,
            no_cache,
        } => {
            let services = Services::new(&config, !no_cache)?;
            let mut request = CompletionRequest::new(build_messages(
                system.as_deref().or(config.primary.system.as_deref()),
                prompt,
            ));
            if let Some(model) = model.clone().or_else(|| config.primary.model.clone()) {
                request = request.with_model(model);
            }
            if let Some(temp) = temperature {
                request = request.with_temperature(*temp);
            }
            if let Some(max_tokens) = max_tokens {
                request = request.with_max_tokens(*max_tokens);
            }
            if let Some(entry) = config.providers.get(config.primary_provider()?) {
                for (key, value) in &entry.parameters {
                    request = request.with_extra(key.clone(), value.clone());
                }
            }

            let primary = services.primary()?;
            let (response, outcome) = primary.complete_traced(request).await?;
            tracing::debug!(outcome = ?outcome, model = %response.model, "Completion finished");
            println!("{}", response.text());

            finish(&cli, &services);
            Ok(())
        }
        Commands::Summarize {
            file,
            focus,
            local_first,
            no_cache,
        } => {
            let content = read_input(file.as_deref())?;
            let services = Services::new(&config, !no_cache)?;
            let summarizer = services.summarizer(*local_first)?;

            let summary = summarizer.summarize(&content, focus.as_deref()).await?;
            tracing::info!(
                strategy = %summary.strategy,
                model = %summary.model,
                chunks = summary.chunks_total,
                failed_chunks = summary.chunks_failed,
                failed_groups = summary.groups_failed,
                combine_depth = summary.combine_depth,
                fell_back_to_remote = summary.fell_back_to_remote,
                "Summary finished"
            );
            if summary.chunks_failed > 0 {
                eprintln!(
                    "Warning: {} of {} chunks could not be summarized",
                    summary.chunks_failed, summary.chunks_total
                );
            }
            if summary.groups_failed > 0 {
                eprintln!(
                    "Warning: {} partial summary groups were dropped while combining",
                    summary.groups_failed
                );
            }
            println!("{}", summary.text);

            finish(&cli, &services);
            Ok(())
        }
        Commands::Plan { file, local_first } => {
            let content = read_input(file.as_deref())?;
            let services = Services::new(&config, false)?;
            println!("{}", services.summarizer(*local_first)?.plan(&content));
            Ok(())
        }
        Commands::Cache { action } => cache_command(&config, *action),
        Commands::Config => show_config(&config, &config_path),
        Commands::Setup => unreachable!(),
    }
}

fn build_messages(system: Option<&str>, prompt: &str) -> Vec<Message> {
    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(Message::system(system));
    }
    messages.push(Message::user(prompt));
    messages
}

fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut content = String::new();
            std::io::stdin()
                .read_to_string(&mut content)
                .context("Failed to read stdin")?;
            Ok(content)
        }
    }
}

fn finish(cli: &Cli, services: &Services) {
    services.report();
    if cli.usage {
        eprintln!("{}", services.collector().summary());
        if let Some(store) = services.store() {
            eprintln!("cache: {}", store.stats());
        }
    }
}

fn cache_command(config: &Config, action: CacheAction) -> Result<()> {
    let store = services::open_store(config)?;
    match action {
        CacheAction::Stats => {
            match config.cache.resolved_path() {
                Some(path) => println!("Location: {}", path.display()),
                None => println!("Location: (memory)"),
            }
            println!("Backend:  {}", store.backend_name());
            println!("Entries:  {}", store.len()?);
            println!("Enabled:  {}", config.cache.enabled);
            println!("Keying:   {}", if config.cache.normalize { "normalized" } else { "exact" });
        }
        CacheAction::Clear => {
            let removed = store.clear()?;
            println!("Removed {} cached responses", removed);
        }
    }
    Ok(())
}

fn show_config(config: &Config, path: &Path) -> Result<()> {
    println!("Configuration: {}", path.display());

    if let Ok(primary) = config.primary_provider() {
        println!("  Primary provider: {}", primary);
    }
    if let Some(model) = &config.primary.model {
        println!("  Primary model: {}", model);
    }

    println!("\nProviders:");
    for (name, provider_config) in &config.providers {
        println!("  {}:", name);
        if let Some(t) = &provider_config.provider_type {
            println!("    Type: {}", t);
        }
        if let Some(model) = &provider_config.default_model {
            println!("    Default model: {}", model);
        }
        if provider_config.api_key.is_some() {
            println!("    API key: (configured)");
        }
        if let Some(base_url) = &provider_config.base_url {
            println!("    Base URL: {}", base_url);
        }
        if provider_config.local {
            println!("    Local: yes");
        }
        if !provider_config.parameters.is_empty() {
            println!("    Parameters: {}", serde_json::to_string(&provider_config.parameters).unwrap_or_default());
        }
    }

    let summarizer = &config.summarizer;
    println!("\nSummarizer:");
    if let Ok(provider) = config.summarizer_provider() {
        println!("  Provider: {}", provider);
    }
    if let Some(local) = &summarizer.local_provider {
        println!("  Local provider: {}", local);
    }
    println!("  Local first: {}", summarizer.settings.local_first);
    println!("  Chunk overlap: {} tokens", summarizer.settings.chunk_overlap);
    println!("  Max combine depth: {}", summarizer.settings.max_combine_depth);

    println!("\nCache:");
    println!("  Enabled: {}", config.cache.enabled);
    println!("  Normalize: {}", config.cache.normalize);
    if let Some(path) = config.cache.resolved_path() {
        println!("  Path: {}", path.display());
    }

    if !config.pricing.is_empty() {
        println!("\nPricing overrides (per 1k tokens):");
        for (category, rates) in &config.pricing {
            println!("  {}: in ${} / out ${}", category, rates.input_per_1k, rates.output_per_1k);
        }
    }

    if !config.context_windows.is_empty() {
        println!("\nContext windows:");
        for (model, window) in &config.context_windows {
            println!("  {}: {}", model, window);
        }
    }
    Ok(())
}
