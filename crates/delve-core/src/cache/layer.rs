use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::accounting::{InvocationKind, TokenCounts, UsageCollector};
use crate::blocking::run_blocking;
use crate::cache::store::{CacheEntry, CacheStore};
use crate::error::Error;
use crate::normalize::{Fingerprint, RequestNormalizer};
use crate::provider::{CompletionRequest, CompletionResponse, Provider};
use crate::retry::{with_retry, RetryPolicy};

/// How a call through the caching layer was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Exact repeat of a stored request.
    Hit,
    /// Matched a stored request only after normalization.
    NormalizedHit,
    /// Not stored; the provider was called and the result stored.
    Miss,
    /// The cache was not consulted (disabled, or the request could not be
    /// fingerprinted).
    Bypassed,
}

impl CacheOutcome {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheOutcome::Hit | CacheOutcome::NormalizedHit)
    }
}

/// A [`Provider`] that serves repeated requests from a [`CacheStore`] and
/// reports every completed invocation to a [`UsageCollector`].
///
/// Cache and accounting failures never fail the call: a request that cannot
/// be fingerprinted, or a store that errors, degrades to a plain provider
/// call.
pub struct CachingProvider {
    inner: Arc<dyn Provider>,
    store: Option<Arc<CacheStore>>,
    normalizer: RequestNormalizer,
    collector: Arc<UsageCollector>,
    category: String,
    retry: RetryPolicy,
}

impl CachingProvider {
    /// A pass-through layer that only does accounting and retries. Attach a
    /// store with [`CachingProvider::with_store`] to enable caching.
    pub fn new(
        inner: Arc<dyn Provider>,
        collector: Arc<UsageCollector>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            store: None,
            normalizer: RequestNormalizer::default(),
            collector,
            category: category.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_normalizer(mut self, normalizer: RequestNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn inner(&self) -> &Arc<dyn Provider> {
        &self.inner
    }

    pub fn caches(&self) -> bool {
        self.store.is_some()
    }

    /// Complete a request and report how it was served.
    pub async fn complete_traced(
        &self,
        mut request: CompletionRequest,
    ) -> Result<(CompletionResponse, CacheOutcome), Error> {
        if request.model.is_none() {
            request.model = self.inner.model_identifier(&request);
        }

        let Some(store) = &self.store else {
            let response = self.call_live(request).await?;
            return Ok((response, CacheOutcome::Bypassed));
        };

        let fingerprint = match self.normalizer.fingerprint(&request) {
            Ok(fp) => fp,
            Err(e) => {
                warn!(provider = %self.inner.name(), error = %e, "Cannot fingerprint request, bypassing cache");
                let response = self.call_live(request).await?;
                return Ok((response, CacheOutcome::Bypassed));
            }
        };

        match self.lookup(store, &fingerprint).await {
            Ok(Some(entry)) => {
                let outcome = if entry.exact_key != fingerprint.exact {
                    CacheOutcome::NormalizedHit
                } else {
                    CacheOutcome::Hit
                };
                debug!(key = %fingerprint.key, category = %self.category, outcome = ?outcome, "Cache hit");
                self.record(&entry.response, InvocationKind::CacheHit);
                return Ok((entry.response, outcome));
            }
            Ok(None) => debug!(key = %fingerprint.key, category = %self.category, "Cache miss"),
            Err(e) => warn!(key = %fingerprint.key, error = %e, "Cache lookup failed, calling provider"),
        }

        let response = self.call_live(request).await?;

        let store = Arc::clone(store);
        let stored = response.clone();
        let key = fingerprint.key.clone();
        let put = run_blocking(move || store.put(&fingerprint, stored)).await;
        if let Err(e) = put.and_then(|r| r) {
            warn!(key = %key, error = %e, "Failed to store response in cache");
        }

        Ok((response, CacheOutcome::Miss))
    }

    async fn lookup(
        &self,
        store: &Arc<CacheStore>,
        fingerprint: &Fingerprint,
    ) -> Result<Option<CacheEntry>, Error> {
        let store = Arc::clone(store);
        let fingerprint = fingerprint.clone();
        run_blocking(move || store.get(&fingerprint)).await?
    }

    async fn call_live(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let inner = Arc::clone(&self.inner);
        let response = with_retry(&self.retry, self.inner.name(), || {
            let inner = Arc::clone(&inner);
            let request = request.clone();
            async move { inner.complete(request).await }
        })
        .await?;

        self.record(&response, InvocationKind::Live);
        Ok(response)
    }

    fn record(&self, response: &CompletionResponse, kind: InvocationKind) {
        let usage = self.inner.token_usage_of(response);
        self.collector.record_usage(&self.category, usage, kind);
    }
}

#[async_trait]
impl Provider for CachingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn default_model(&self) -> Option<&str> {
        self.inner.default_model()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let (response, _) = self.complete_traced(request).await?;
        Ok(response)
    }

    fn model_identifier(&self, request: &CompletionRequest) -> Option<String> {
        self.inner.model_identifier(request)
    }

    fn token_usage_of(&self, response: &CompletionResponse) -> Option<TokenCounts> {
        self.inner.token_usage_of(response)
    }
}
