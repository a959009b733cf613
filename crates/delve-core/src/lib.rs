//! delve-core: response caching, usage accounting and adaptive summarization
//!
//! This crate provides the provider abstraction, the normalizing response
//! cache that wraps it, per-category token and cost accounting, and the
//! summarizer that fits large content into a model's context window.

pub mod accounting;
pub mod blocking;
pub mod cache;
pub mod chunker;
pub mod context_window;
pub mod error;
pub mod message;
pub mod normalize;
pub mod provider;
pub mod retry;
pub mod summarizer;
pub mod tokens;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use accounting::{
    extract_usage, Cost, InvocationKind, ModelRole, ModelUsageRecord, PricingTable, Rates,
    TokenCounts, UsageCollector, UsageExtractor, UsageSummary,
};
pub use cache::{CacheEntry, CacheOutcome, CacheStats, CacheStore, CachingProvider};
pub use chunker::{ContentChunk, TextSplitter};
pub use context_window::{known_context_window, ContextWindowOracle};
pub use error::Error;
pub use message::{Message, Role, Usage};
pub use normalize::{CacheKey, Fingerprint, KeyMode, RequestNormalizer};
pub use provider::{CompletionRequest, CompletionResponse, FinishReason, Provider};
pub use retry::{with_retry, RetryPolicy};
pub use summarizer::{
    select_strategy, Strategy, Summarizer, SummarizerConfig, Summary, SummaryModel, SummaryPlan,
};
pub use tokens::{CharRatioEstimator, TokenEstimator};

pub type Result<T> = std::result::Result<T, Error>;
