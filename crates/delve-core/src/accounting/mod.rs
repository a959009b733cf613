//! Token and cost accounting.
//!
//! The [`UsageCollector`] observes every model invocation, live or served
//! from cache, and accumulates tokens and cost per category. Cache hits are
//! tracked separately so reports can show avoided spend without inflating
//! real spend.

mod extract;
mod pricing;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

pub use extract::{extract_usage, extract_with, TokenCounts, UsageExtractor, DEFAULT_EXTRACTORS};
pub use pricing::{
    Cost, ModelRole, PricingTable, Rates, NEXT_STEP_CLOUD, NEXT_STEP_LOCAL, PRIMARY_CLOUD,
    PRIMARY_LOCAL, SUMMARIZER_CLOUD, SUMMARIZER_LOCAL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationKind {
    /// A real provider call that was paid for.
    Live,
    /// Served from the response cache; its cost was avoided.
    CacheHit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModelUsageRecord {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub requests: u64,
    pub total_cost: Cost,
}

impl ModelUsageRecord {
    fn add(&mut self, input: u64, output: u64, cost: Cost) {
        self.input_tokens = self.input_tokens.saturating_add(input);
        self.output_tokens = self.output_tokens.saturating_add(output);
        self.requests += 1;
        self.total_cost += cost;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryUsage {
    pub live: ModelUsageRecord,
    pub cached: ModelUsageRecord,
}

/// Process-wide counters over live calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregateCounters {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub successful_requests: u64,
}

#[derive(Debug, Default)]
struct CollectorState {
    categories: BTreeMap<String, CategoryUsage>,
    totals: AggregateCounters,
}

/// Thread-safe usage collector shared by every caching layer.
#[derive(Debug)]
pub struct UsageCollector {
    pricing: PricingTable,
    state: Mutex<CollectorState>,
}

impl Default for UsageCollector {
    fn default() -> Self {
        Self::new(PricingTable::default())
    }
}

impl UsageCollector {
    pub fn new(pricing: PricingTable) -> Self {
        Self {
            pricing,
            state: Mutex::new(CollectorState::default()),
        }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    // Accounting never fails a call, so a poisoned lock is recovered.
    fn state(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one completed invocation and return the cost attributed to it.
    pub fn on_invocation_complete(
        &self,
        category: &str,
        input_tokens: u64,
        output_tokens: u64,
        kind: InvocationKind,
    ) -> Cost {
        let cost = match self.pricing.rates_for(category) {
            Some(rates) => rates.cost(input_tokens, output_tokens),
            None => {
                warn!(category = %category, "Unknown model category, recording zero cost");
                Cost::ZERO
            }
        };

        let mut state = self.state();
        let usage = state.categories.entry(category.to_string()).or_default();
        match kind {
            InvocationKind::Live => usage.live.add(input_tokens, output_tokens, cost),
            InvocationKind::CacheHit => usage.cached.add(input_tokens, output_tokens, cost),
        }
        if kind == InvocationKind::Live {
            let totals = &mut state.totals;
            totals.prompt_tokens = totals.prompt_tokens.saturating_add(input_tokens);
            totals.completion_tokens = totals.completion_tokens.saturating_add(output_tokens);
            totals.total_tokens = totals
                .total_tokens
                .saturating_add(input_tokens.saturating_add(output_tokens));
            state.totals.successful_requests += 1;
        }

        debug!(
            category = %category,
            kind = ?kind,
            input_tokens,
            output_tokens,
            cost = %cost,
            "Recorded invocation"
        );
        cost
    }

    /// Record an invocation whose usage may not have been extractable.
    pub fn record_usage(
        &self,
        category: &str,
        usage: Option<TokenCounts>,
        kind: InvocationKind,
    ) -> Cost {
        let counts = usage.unwrap_or_else(|| {
            debug!(category = %category, "Response carried no token usage, counting zero tokens");
            TokenCounts::default()
        });
        self.on_invocation_complete(category, counts.input, counts.output, kind)
    }

    /// Real spend across all categories. Cache hits are excluded.
    pub fn get_total_cost(&self) -> Cost {
        self.state().categories.values().map(|u| u.live.total_cost).sum()
    }

    /// What cache hits would have cost as live calls.
    pub fn get_avoided_cost(&self) -> Cost {
        self.state().categories.values().map(|u| u.cached.total_cost).sum()
    }

    pub fn usage(&self, category: &str) -> CategoryUsage {
        self.state()
            .categories
            .get(category)
            .copied()
            .unwrap_or_default()
    }

    pub fn totals(&self) -> AggregateCounters {
        self.state().totals
    }

    pub fn summary(&self) -> UsageSummary {
        let state = self.state();
        let categories: Vec<(String, CategoryUsage)> = state
            .categories
            .iter()
            .map(|(name, usage)| (name.clone(), *usage))
            .collect();
        UsageSummary {
            total_cost: categories.iter().map(|(_, u)| u.live.total_cost).sum(),
            avoided_cost: categories.iter().map(|(_, u)| u.cached.total_cost).sum(),
            totals: state.totals,
            categories,
        }
    }

    pub fn log_summary(&self) {
        let summary = self.summary();
        if summary.categories.is_empty() {
            info!("No model usage recorded");
            return;
        }
        for (category, usage) in &summary.categories {
            info!(
                category = %category,
                input_tokens = usage.live.input_tokens,
                output_tokens = usage.live.output_tokens,
                requests = usage.live.requests,
                cost = %usage.live.total_cost,
                cached_requests = usage.cached.requests,
                avoided_cost = %usage.cached.total_cost,
                "Model usage"
            );
        }
        info!(
            total_cost = %summary.total_cost,
            avoided_cost = %summary.avoided_cost,
            successful_requests = summary.totals.successful_requests,
            total_tokens = summary.totals.total_tokens,
            "Usage total"
        );
    }

    pub fn reset(&self) {
        let mut state = self.state();
        state.categories.clear();
        state.totals = AggregateCounters::default();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    pub categories: Vec<(String, CategoryUsage)>,
    pub total_cost: Cost,
    pub avoided_cost: Cost,
    pub totals: AggregateCounters,
}

impl fmt::Display for UsageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<20} {:>10} {:>10} {:>8} {:>12} {:>8} {:>12}",
            "category", "input", "output", "calls", "cost", "cached", "avoided"
        )?;
        for (name, usage) in &self.categories {
            writeln!(
                f,
                "{:<20} {:>10} {:>10} {:>8} {:>12} {:>8} {:>12}",
                name,
                usage.live.input_tokens,
                usage.live.output_tokens,
                usage.live.requests,
                usage.live.total_cost.to_string(),
                usage.cached.requests,
                usage.cached.total_cost.to_string(),
            )?;
        }
        writeln!(f, "total cost:   {}", self.total_cost)?;
        write!(f, "avoided cost: {}", self.avoided_cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_primary_cloud_cost() {
        let collector = UsageCollector::default();
        let cost = collector.on_invocation_complete(PRIMARY_CLOUD, 1000, 500, InvocationKind::Live);
        assert_eq!(cost.as_dollars(), 0.02);
        assert_eq!(collector.get_total_cost().as_dollars(), 0.02);

        let usage = collector.usage(PRIMARY_CLOUD);
        assert_eq!(usage.live.input_tokens, 1000);
        assert_eq!(usage.live.output_tokens, 500);
        assert_eq!(usage.live.requests, 1);
    }

    #[test]
    fn test_unknown_category_is_zero_cost() {
        let collector = UsageCollector::default();
        let cost = collector.on_invocation_complete("mystery", 100, 100, InvocationKind::Live);
        assert!(cost.is_zero());
        assert_eq!(collector.usage("mystery").live.input_tokens, 100);
        assert!(collector.get_total_cost().is_zero());
    }

    #[test]
    fn test_cache_hits_are_not_spend() {
        let collector = UsageCollector::default();
        collector.on_invocation_complete(PRIMARY_CLOUD, 1000, 500, InvocationKind::Live);
        collector.on_invocation_complete(PRIMARY_CLOUD, 1000, 500, InvocationKind::CacheHit);

        assert_eq!(collector.get_total_cost().as_dollars(), 0.02);
        assert_eq!(collector.get_avoided_cost().as_dollars(), 0.02);

        let usage = collector.usage(PRIMARY_CLOUD);
        assert_eq!(usage.live.requests, 1);
        assert_eq!(usage.cached.requests, 1);
        assert_eq!(collector.totals().successful_requests, 1);
    }

    #[test]
    fn test_total_sums_categories() {
        let collector = UsageCollector::default();
        collector.on_invocation_complete(PRIMARY_CLOUD, 1000, 500, InvocationKind::Live);
        collector.on_invocation_complete(SUMMARIZER_CLOUD, 10_000, 1_000, InvocationKind::Live);
        collector.on_invocation_complete(SUMMARIZER_LOCAL, 50_000, 2_000, InvocationKind::Live);
        assert_eq!(collector.get_total_cost(), Cost::from_nanos(21_400_000));
        assert_eq!(collector.totals().prompt_tokens, 61_000);
        assert_eq!(collector.totals().total_tokens, 64_500);
    }

    #[test]
    fn test_huge_counts_saturate() {
        let collector = UsageCollector::default();
        collector.on_invocation_complete(PRIMARY_CLOUD, u64::MAX, u64::MAX, InvocationKind::Live);
        collector.on_invocation_complete(PRIMARY_CLOUD, 10, 10, InvocationKind::Live);

        let usage = collector.usage(PRIMARY_CLOUD);
        assert_eq!(usage.live.input_tokens, u64::MAX);
        assert_eq!(usage.live.total_tokens(), u64::MAX);
        assert_eq!(usage.live.requests, 2);
        assert_eq!(collector.totals().total_tokens, u64::MAX);
    }

    #[test]
    fn test_missing_usage_counts_zero_tokens() {
        let collector = UsageCollector::default();
        let cost = collector.record_usage(PRIMARY_CLOUD, None, InvocationKind::Live);
        assert!(cost.is_zero());
        assert_eq!(collector.usage(PRIMARY_CLOUD).live.requests, 1);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let collector = UsageCollector::default();
        collector.on_invocation_complete(PRIMARY_CLOUD, 1000, 500, InvocationKind::Live);
        collector.on_invocation_complete(PRIMARY_CLOUD, 10, 5, InvocationKind::CacheHit);
        collector.reset();

        assert!(collector.get_total_cost().is_zero());
        assert!(collector.get_avoided_cost().is_zero());
        assert_eq!(collector.usage(PRIMARY_CLOUD), CategoryUsage::default());
        assert_eq!(collector.totals(), AggregateCounters::default());
        assert!(collector.summary().categories.is_empty());
    }

    #[test]
    fn test_summary_display_with_idle_collector() {
        let collector = UsageCollector::default();
        collector.log_summary();
        let text = collector.summary().to_string();
        assert!(text.contains("total cost:   $0.000000"));
    }

    #[test]
    fn test_summary_lists_categories() {
        let collector = UsageCollector::default();
        collector.on_invocation_complete(SUMMARIZER_CLOUD, 10, 5, InvocationKind::Live);
        collector.on_invocation_complete(PRIMARY_CLOUD, 1000, 500, InvocationKind::Live);
        let summary = collector.summary();
        let names: Vec<&str> = summary.categories.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec![PRIMARY_CLOUD, SUMMARIZER_CLOUD]);
        assert!(summary.to_string().contains("primary-cloud"));
        collector.log_summary();
    }

    #[test]
    fn test_concurrent_updates_are_serialized() {
        let collector = Arc::new(UsageCollector::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        collector.on_invocation_complete(PRIMARY_CLOUD, 10, 1, InvocationKind::Live);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let usage = collector.usage(PRIMARY_CLOUD);
        assert_eq!(usage.live.requests, 800);
        assert_eq!(usage.live.input_tokens, 8000);
    }
}
