use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const CONFIG_TEMPLATE: &str = r#"# delve configuration
#
# API keys are read from environment variables by default:
#   ANTHROPIC_API_KEY, OPENAI_API_KEY, GEMINI_API_KEY
# You can also set them directly in this file (not recommended).

# ── Providers ────────────────────────────────────────────────────
# Provider type is inferred from the section name, or from base_url
# (OpenAI-compatible). Set `type` to be explicit.

[providers.openai]
# api_key = "sk-..."              # or set OPENAI_API_KEY env var
default_model = "gpt-4o-mini"

# [providers.anthropic]
# api_key = "sk-ant-..."          # or set ANTHROPIC_API_KEY env var
# default_model = "claude-3-5-haiku-latest"

# A llama.cpp or Ollama server on this machine. Local providers need no
# API key and are accounted as free.
# [providers.llama]
# base_url = "http://127.0.0.1:8080/v1"
# default_model = "qwen2.5-7b-instruct"
# local = true

# ── Roles ────────────────────────────────────────────────────────

[primary]
provider = "openai"
# system = "You are a concise research assistant."

[summarizer]
# provider = "openai"             # defaults to the primary provider
# model = "gpt-4o-mini"
# local_provider = "llama"
# local_first = false
# chunk_size = 4000               # cap on chunk size, in tokens
# chunk_overlap = 200
# max_combine_depth = 3
# max_output_tokens = 1024

# ── Response cache ───────────────────────────────────────────────

[cache]
enabled = true
# path = "~/.cache/delve/responses.db"
# normalize = true                # false: only byte-identical requests hit

[retry]
max_attempts = 3
initial_backoff_ms = 500

# ── Accounting ───────────────────────────────────────────────────
# Dollar rates per 1000 tokens, merged over the built-in table.
# [pricing.primary-cloud]
# input_per_1k = 0.008
# output_per_1k = 0.024

# [context_windows]
# "qwen2.5-7b-instruct" = 16384
"#;

pub fn run(config_path: &Path) -> Result<()> {
    if let Some(config_dir) = config_path.parent() {
        std::fs::create_dir_all(config_dir)
            .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;
    }

    if config_path.exists() {
        println!("Existing config file found:");
        println!("  {}", config_path.display());
        print!("\nOverwrite? (The existing file will be backed up) [y/N] ");

        // Flush stdout so the prompt appears before reading
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Setup cancelled.");
            return Ok(());
        }

        backup_file(config_path)?;
    }

    write_template(config_path)?;
    println!("Created {}", config_path.display());

    println!("\nNext steps:");
    println!("  1. Set your API key:   export OPENAI_API_KEY=\"sk-...\"");
    println!("  2. Ask something:      delve ask \"hello world\"");
    println!("  3. Summarize a file:   delve summarize notes.md");

    Ok(())
}

fn write_template(path: &Path) -> Result<()> {
    std::fs::write(path, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Back up a file to <name>.bak, appending a timestamp if .bak already exists.
fn backup_file(path: &Path) -> Result<PathBuf> {
    let mut backup = path.with_extension("toml.bak");

    if backup.exists() {
        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let name = format!("toml.bak.{}", timestamp);
        backup = path.with_extension(name);
    }

    std::fs::rename(path, &backup)
        .with_context(|| format!("Failed to back up {} to {}", path.display(), backup.display()))?;
    println!("  Backed up to {}", backup.display());

    Ok(backup)
}
