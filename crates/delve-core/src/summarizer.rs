//! Adaptive summarization.
//!
//! Content that fits the chosen model's window (minus a reserved share for
//! prompt and output) is summarized in one call. Anything larger is split
//! into overlapping chunks, each chunk summarized independently, and the
//! partial summaries combined. A combine input that is itself too large is
//! grouped and condensed again, up to a fixed depth.

use std::fmt;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chunker::{ContentChunk, TextSplitter};
use crate::context_window::ContextWindowOracle;
use crate::error::Error;
use crate::message::Message;
use crate::provider::{CompletionRequest, Provider};
use crate::tokens::{CharRatioEstimator, TokenEstimator};

const SYSTEM_PROMPT: &str = "You condense source material for a research report. \
Keep concrete facts and figures, and never add information the text does not contain.";

const PARTIAL_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// The whole content goes to the model in one call.
    SinglePass,
    /// Split, summarize each chunk, combine the partial summaries.
    SplitCombine,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::SinglePass => f.write_str("single-pass"),
            Strategy::SplitCombine => f.write_str("split-combine"),
        }
    }
}

/// `tokens <= window - overhead` fits in one pass; the boundary itself fits.
pub fn select_strategy(tokens: usize, window: usize, overhead: usize) -> Strategy {
    if tokens <= window.saturating_sub(overhead) {
        Strategy::SinglePass
    } else {
        Strategy::SplitCombine
    }
}

/// Tokens held back from the window for instructions and the reply: the
/// configured share of the window, but never less than `required`.
pub fn prompt_overhead(window: usize, reserved_fraction: f64, required: usize) -> usize {
    let reserved = (window as f64 * reserved_fraction).ceil();
    let share = if reserved.is_finite() && reserved > 0.0 {
        reserved as usize
    } else {
        0
    };
    share.max(required).min(window)
}

/// A model the summarizer may route generation calls to.
#[derive(Clone)]
pub struct SummaryModel {
    pub provider: Arc<dyn Provider>,
    pub model: String,
    pub local: bool,
}

impl SummaryModel {
    pub fn remote(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            local: false,
        }
    }

    pub fn local(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            local: true,
        }
    }
}

impl fmt::Debug for SummaryModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SummaryModel")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("local", &self.local)
            .finish()
    }
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_reserved_fraction() -> f64 {
    0.25
}

fn default_max_combine_depth() -> usize {
    3
}

fn default_max_output_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizerConfig {
    /// Prefer the local model whenever the content fits its window.
    #[serde(default)]
    pub local_first: bool,

    /// Upper bound on chunk size in tokens. The model's recommended chunk
    /// size applies when unset.
    #[serde(default, rename = "chunk_size")]
    pub chunk_size_tokens: Option<usize>,

    /// Tokens repeated between consecutive chunks.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Share of the window reserved for instructions and output.
    #[serde(default = "default_reserved_fraction")]
    pub reserved_fraction: f64,

    #[serde(default = "default_max_combine_depth")]
    pub max_combine_depth: usize,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Chunk summaries in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            local_first: false,
            chunk_size_tokens: None,
            chunk_overlap: default_chunk_overlap(),
            reserved_fraction: default_reserved_fraction(),
            max_combine_depth: default_max_combine_depth(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl SummarizerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_first(mut self, local_first: bool) -> Self {
        self.local_first = local_first;
        self
    }

    pub fn with_chunk_size(mut self, tokens: usize) -> Self {
        self.chunk_size_tokens = Some(tokens);
        self
    }

    pub fn with_chunk_overlap(mut self, tokens: usize) -> Self {
        self.chunk_overlap = tokens;
        self
    }

    pub fn with_max_combine_depth(mut self, depth: usize) -> Self {
        self.max_combine_depth = depth;
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }
}

/// What [`Summarizer::summarize`] would do with a piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryPlan {
    pub estimated_tokens: usize,
    pub model: String,
    pub local: bool,
    pub context_window: usize,
    pub overhead: usize,
    pub strategy: Strategy,
    pub chunk_tokens: usize,
    pub chunk_count: usize,
    pub fell_back_to_remote: bool,
}

impl fmt::Display for SummaryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "estimated tokens: {}", self.estimated_tokens)?;
        writeln!(
            f,
            "model:            {} ({})",
            self.model,
            if self.local { "local" } else { "remote" }
        )?;
        writeln!(
            f,
            "context window:   {} ({} reserved)",
            self.context_window, self.overhead
        )?;
        writeln!(f, "strategy:         {}", self.strategy)?;
        if self.strategy == Strategy::SplitCombine {
            writeln!(
                f,
                "chunks:           {} of up to {} tokens",
                self.chunk_count, self.chunk_tokens
            )?;
        }
        write!(f, "local fallback:   {}", self.fell_back_to_remote)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub text: String,
    pub strategy: Strategy,
    pub model: String,
    pub chunks_total: usize,
    pub chunks_failed: usize,
    /// Condensed groups lost while combining partial summaries.
    pub groups_failed: usize,
    /// Combine rounds performed; 0 for a single pass.
    pub combine_depth: usize,
    /// Local-first was requested but the content did not fit the local model.
    pub fell_back_to_remote: bool,
}

struct Route<'a> {
    model: &'a SummaryModel,
    window: usize,
    overhead: usize,
    fell_back: bool,
}

pub struct Summarizer {
    remote: SummaryModel,
    local: Option<SummaryModel>,
    oracle: ContextWindowOracle,
    estimator: Arc<dyn TokenEstimator>,
    config: SummarizerConfig,
}

impl Summarizer {
    pub fn new(remote: SummaryModel, oracle: ContextWindowOracle) -> Self {
        Self {
            remote,
            local: None,
            oracle,
            estimator: Arc::new(CharRatioEstimator::default()),
            config: SummarizerConfig::default(),
        }
    }

    pub fn with_local(mut self, local: SummaryModel) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_config(mut self, config: SummarizerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &SummarizerConfig {
        &self.config
    }

    /// Tokens every generation call spends besides the content itself: the
    /// system prompt, the longest instruction wrapper and the reply.
    fn scaffolding_tokens(&self, focus: Option<&str>) -> usize {
        let widest_chunk = ContentChunk {
            index: usize::MAX - 1,
            text: String::new(),
            estimated_tokens: 0,
        };
        let wrapper = [
            single_prompt("", focus),
            chunk_prompt(&widest_chunk, usize::MAX, focus),
            combine_prompt("", focus),
        ]
        .iter()
        .map(|p| self.estimator.estimate(p))
        .max()
        .unwrap_or(0);

        self.estimator.estimate(SYSTEM_PROMPT) + wrapper + self.config.max_output_tokens as usize
    }

    fn window_of(&self, model: &SummaryModel, scaffolding: usize) -> (usize, usize) {
        let window = self.oracle.context_window_for(&model.model);
        (window, prompt_overhead(window, self.config.reserved_fraction, scaffolding))
    }

    fn route(&self, tokens: usize, focus: Option<&str>) -> Route<'_> {
        let scaffolding = self.scaffolding_tokens(focus);
        if self.config.local_first {
            if let Some(local) = &self.local {
                let (window, overhead) = self.window_of(local, scaffolding);
                if select_strategy(tokens, window, overhead) == Strategy::SinglePass {
                    return Route {
                        model: local,
                        window,
                        overhead,
                        fell_back: false,
                    };
                }
                info!(
                    tokens,
                    local_model = %local.model,
                    local_window = window,
                    remote_model = %self.remote.model,
                    "Content exceeds local model window, falling back to remote model"
                );
                let (window, overhead) = self.window_of(&self.remote, scaffolding);
                return Route {
                    model: &self.remote,
                    window,
                    overhead,
                    fell_back: true,
                };
            }
        }

        let (window, overhead) = self.window_of(&self.remote, scaffolding);
        Route {
            model: &self.remote,
            window,
            overhead,
            fell_back: false,
        }
    }

    fn splitter(&self, route: &Route<'_>) -> TextSplitter {
        let budget = route.window.saturating_sub(route.overhead).max(1);
        let mut chunk_tokens = self
            .oracle
            .recommended_chunk_size(&route.model.model)
            .min(budget);
        if let Some(cap) = self.config.chunk_size_tokens {
            chunk_tokens = chunk_tokens.min(cap.max(1));
        }
        TextSplitter::new(
            Arc::clone(&self.estimator),
            chunk_tokens,
            self.config.chunk_overlap,
        )
    }

    /// Decide model and strategy without calling anything.
    pub fn plan(&self, content: &str) -> SummaryPlan {
        self.plan_with_focus(content, None)
    }

    pub fn plan_with_focus(&self, content: &str, focus: Option<&str>) -> SummaryPlan {
        let tokens = self.estimator.estimate(content);
        let route = self.route(tokens, focus);
        let strategy = select_strategy(tokens, route.window, route.overhead);
        let splitter = self.splitter(&route);
        let chunk_count = match strategy {
            Strategy::SinglePass => 1,
            Strategy::SplitCombine => splitter.split(content).len(),
        };

        SummaryPlan {
            estimated_tokens: tokens,
            model: route.model.model.clone(),
            local: route.model.local,
            context_window: route.window,
            overhead: route.overhead,
            strategy,
            chunk_tokens: splitter.chunk_tokens(),
            chunk_count,
            fell_back_to_remote: route.fell_back,
        }
    }

    /// Summarize `content`, optionally steering toward a research question.
    pub async fn summarize(&self, content: &str, focus: Option<&str>) -> Result<Summary, Error> {
        let tokens = self.estimator.estimate(content);
        let route = self.route(tokens, focus);
        let strategy = select_strategy(tokens, route.window, route.overhead);

        info!(
            tokens,
            model = %route.model.model,
            local = route.model.local,
            window = route.window,
            strategy = %strategy,
            "Summarizing content"
        );

        let mut summary = Summary {
            text: String::new(),
            strategy,
            model: route.model.model.clone(),
            chunks_total: 0,
            chunks_failed: 0,
            groups_failed: 0,
            combine_depth: 0,
            fell_back_to_remote: route.fell_back,
        };

        if content.trim().is_empty() {
            return Ok(summary);
        }

        match strategy {
            Strategy::SinglePass => {
                summary.text = self.generate(route.model, single_prompt(content, focus)).await?;
                summary.chunks_total = 1;
            }
            Strategy::SplitCombine => {
                let splitter = self.splitter(&route);
                let chunks = splitter.split(content);
                summary.chunks_total = chunks.len();

                let (partials, failed) = self.summarize_chunks(route.model, &chunks, focus).await?;
                summary.chunks_failed = failed;

                let combined = self.combine(&route, &splitter, partials, focus).await?;
                summary.text = combined.text;
                summary.combine_depth = combined.depth;
                summary.groups_failed = combined.groups_failed;
            }
        }

        Ok(summary)
    }

    /// Map step. Failed chunks are dropped with a warning; only a total
    /// failure is an error.
    async fn summarize_chunks(
        &self,
        model: &SummaryModel,
        chunks: &[ContentChunk],
        focus: Option<&str>,
    ) -> Result<(Vec<String>, usize), Error> {
        let total = chunks.len();
        let results: Vec<Result<String, Error>> = stream::iter(chunks.iter().map(|chunk| {
            debug!(chunk = chunk.index + 1, total, tokens = chunk.estimated_tokens, "Summarizing chunk");
            self.generate(model, chunk_prompt(chunk, total, focus))
        }))
        .buffered(self.config.max_concurrency.max(1))
        .collect()
        .await;

        collect_partials(results, "chunk")
    }

    async fn combine(
        &self,
        route: &Route<'_>,
        splitter: &TextSplitter,
        mut partials: Vec<String>,
        focus: Option<&str>,
    ) -> Result<Combined, Error> {
        let limit = self.config.max_combine_depth;
        let mut depth = 0;
        let mut groups_failed = 0;

        loop {
            depth += 1;
            if depth > limit {
                warn!(depth, limit, "Combine input still exceeds the context window");
                return Err(Error::ContextOverflow { depth, limit });
            }

            let joined = partials.join(PARTIAL_SEPARATOR);
            let tokens = self.estimator.estimate(&joined);

            if select_strategy(tokens, route.window, route.overhead) == Strategy::SinglePass {
                debug!(depth, partials = partials.len(), tokens, "Combining partial summaries");
                let text = self.generate(route.model, combine_prompt(&joined, focus)).await?;
                return Ok(Combined {
                    text,
                    depth,
                    groups_failed,
                });
            }

            let groups = splitter.split(&joined);
            debug!(depth, tokens, groups = groups.len(), "Partial summaries too large, condensing in groups");

            let results: Vec<Result<String, Error>> = stream::iter(
                groups
                    .iter()
                    .map(|group| self.generate(route.model, combine_prompt(&group.text, focus))),
            )
            .buffered(self.config.max_concurrency.max(1))
            .collect()
            .await;

            let (condensed, failed) = collect_partials(results, "combine group")?;
            groups_failed += failed;
            partials = condensed;
        }
    }

    async fn generate(&self, model: &SummaryModel, prompt: String) -> Result<String, Error> {
        let request = CompletionRequest::new(vec![Message::system(SYSTEM_PROMPT), Message::user(prompt)])
            .with_model(model.model.as_str())
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_output_tokens);

        let response = model.provider.complete(request).await?;
        Ok(response.message.content.trim().to_string())
    }
}

struct Combined {
    text: String,
    depth: usize,
    groups_failed: usize,
}

fn collect_partials(
    results: Vec<Result<String, Error>>,
    what: &str,
) -> Result<(Vec<String>, usize), Error> {
    let total = results.len();
    let mut partials = Vec::with_capacity(total);
    let mut failed = 0;
    let mut last_error = None;

    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(text) => partials.push(text),
            Err(e) => {
                warn!(part = i + 1, total, error = %e, "Dropping failed {}", what);
                failed += 1;
                last_error = Some(e);
            }
        }
    }

    if partials.is_empty() {
        return Err(last_error.unwrap_or_else(|| Error::Unknown(format!("no {} produced output", what))));
    }
    Ok((partials, failed))
}

fn focus_line(focus: Option<&str>) -> String {
    match focus.map(str::trim).filter(|q| !q.is_empty()) {
        Some(q) => format!("\nFocus on information relevant to: {}", q),
        None => String::new(),
    }
}

fn single_prompt(content: &str, focus: Option<&str>) -> String {
    format!(
        "Summarize the following content.{}\n\n{}",
        focus_line(focus),
        content
    )
}

fn chunk_prompt(chunk: &ContentChunk, total: usize, focus: Option<&str>) -> String {
    format!(
        "Summarize the following excerpt (part {} of {}).{}\n\n{}",
        chunk.index + 1,
        total,
        focus_line(focus),
        chunk.text
    )
}

fn combine_prompt(partials: &str, focus: Option<&str>) -> String {
    format!(
        "Combine these partial summaries into one coherent summary without repeating points.{}\n\n{}",
        focus_line(focus),
        partials
    )
}
