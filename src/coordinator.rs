//! Fetch coordinator: decides between cached and freshly fetched data
//!
//! For every query the coordinator fingerprints it, looks it up in the cache
//! store, and either serves the entry (inside its TTL) or refreshes it through
//! the registered source adapter. When a refresh fails for transport or
//! upstream reasons and an older entry exists, that entry is served tagged
//! `Stale` instead of failing the request.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::cache::{CacheEntry, CacheStore};
use crate::config::Settings;
use crate::data::{Freshness, Record, Resolved, StaleWarning};
use crate::query::{Fingerprint, Query};
use crate::source::{SourceAdapter, SourceError, SourceRegistry};

/// Default retry configuration
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 250;
pub const DEFAULT_MAX_DELAY_MS: u64 = 5000;

/// Errors returned to callers when no data can be served
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No adapter is registered for the query's source
    #[error("no data source registered for '{0}'")]
    UnknownSource(String),

    /// The refresh failed and there is nothing cached to fall back on
    #[error("no data available for {source_id} query {}: {source}", .fingerprint.short())]
    NoData {
        source_id: String,
        fingerprint: Fingerprint,
        #[source]
        source: SourceError,
    },
}

/// Retry behaviour for retryable adapter failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry (doubles each attempt)
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based)
    ///
    /// Exponential backoff from `initial_delay`; a rate limit that names a
    /// wait time uses that instead. Both are capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32, error: &SourceError) -> Duration {
        let delay = match error {
            SourceError::RateLimited {
                retry_after: Some(secs),
            } => Duration::from_secs(*secs),
            _ => {
                let factor = 2u32.saturating_pow(attempt);
                self.initial_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

/// Serves queries from the cache store, refreshing through adapters as needed
#[derive(Debug)]
pub struct FetchCoordinator {
    registry: SourceRegistry,
    store: CacheStore,
    settings: Settings,
}

impl FetchCoordinator {
    pub fn new(registry: SourceRegistry, store: CacheStore, settings: Settings) -> Self {
        Self {
            registry,
            store,
            settings,
        }
    }

    /// The cache store backing this coordinator
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Resolves a query against the current time
    pub async fn resolve(&self, query: &Query) -> Result<Resolved, ResolveError> {
        self.resolve_at(query, Utc::now()).await
    }

    /// Resolves a query as if the current time were `now`
    ///
    /// # Returns
    /// * `Ok(Resolved)` tagged `Fresh` when served from a fresh entry or a
    ///   successful refresh
    /// * `Ok(Resolved)` tagged `Stale` with a warning when the refresh failed
    ///   but an older entry exists
    /// * `Err(ResolveError)` when no data can be served
    pub async fn resolve_at(
        &self,
        query: &Query,
        now: DateTime<Utc>,
    ) -> Result<Resolved, ResolveError> {
        let fingerprint = query.fingerprint();
        let cached = self.store.get(&fingerprint);

        if let Some(entry) = &cached {
            if entry.is_fresh(now) {
                tracing::debug!(%query, fingerprint = fingerprint.short(), "cache hit");
                return Ok(Resolved {
                    records: entry.payload.clone(),
                    freshness: Freshness::Fresh,
                    fetched_at: entry.fetched_at,
                    warning: None,
                });
            }
        }

        let adapter = self
            .registry
            .get(query.source_id())
            .ok_or_else(|| ResolveError::UnknownSource(query.source_id().to_string()))?;

        tracing::info!(
            %query,
            fingerprint = fingerprint.short(),
            stale = cached.is_some(),
            "refreshing from upstream"
        );

        match self.refresh(adapter.as_ref(), query).await {
            Ok(records) => {
                let entry = CacheEntry {
                    fingerprint: fingerprint.clone(),
                    payload: records,
                    fetched_at: now,
                    source_id: query.source_id().to_string(),
                    ttl_seconds: self.settings.ttl_for(query.source_id()),
                };
                if let Err(e) = self.store.put(&fingerprint, entry.clone()) {
                    tracing::warn!(error = %e, path = %self.store.path().display(), "failed to write cache");
                }
                Ok(Resolved {
                    records: entry.payload,
                    freshness: Freshness::Fresh,
                    fetched_at: now,
                    warning: None,
                })
            }
            Err(error) => match cached {
                Some(entry) if error.allows_stale_fallback() => {
                    let age_seconds = entry.age_seconds(now);
                    tracing::warn!(
                        %query,
                        error = %error,
                        age_seconds,
                        "refresh failed, serving stale data"
                    );
                    Ok(Resolved {
                        records: entry.payload,
                        freshness: Freshness::Stale,
                        fetched_at: entry.fetched_at,
                        warning: Some(StaleWarning {
                            reason: error.to_string(),
                            age_seconds,
                        }),
                    })
                }
                _ => {
                    tracing::warn!(%query, error = %error, "refresh failed, no data to serve");
                    Err(ResolveError::NoData {
                        source_id: query.source_id().to_string(),
                        fingerprint,
                        source: error,
                    })
                }
            },
        }
    }

    /// Fetches and normalizes, retrying transient failures per the retry policy
    async fn refresh(
        &self,
        adapter: &dyn SourceAdapter,
        query: &Query,
    ) -> Result<Vec<Record>, SourceError> {
        let policy = &self.settings.retry;
        let mut attempt = 0;

        loop {
            match self.fetch_with_timeout(adapter, query).await {
                Ok(raw) => return adapter.normalize(&raw),
                Err(error) if error.is_retryable() && attempt < policy.max_retries => {
                    let delay = policy.delay_for(attempt, &error);
                    attempt += 1;
                    tracing::info!(
                        error = %error,
                        "retry attempt {} of {}, waiting {:?}",
                        attempt,
                        policy.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Runs `fetch_raw` bounded by the configured request timeout
    async fn fetch_with_timeout(
        &self,
        adapter: &dyn SourceAdapter,
        query: &Query,
    ) -> Result<crate::source::RawResponse, SourceError> {
        let timeout = self.settings.request_timeout;
        match tokio::time::timeout(timeout, adapter.fetch_raw(query)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Network(format!(
                "request timed out after {:?}",
                timeout
            ))),
        }
    }
}
