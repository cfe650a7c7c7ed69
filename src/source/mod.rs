//! Source adapters for external measurement APIs
//!
//! An adapter translates a `Query` into a request against one provider and
//! parses the response into canonical `Record`s. Adapters never see the cache:
//! the fetch coordinator owns all caching policy and looks adapters up by
//! source id in a `SourceRegistry`.

pub mod airnow;
pub mod usgs;

pub use airnow::AirNowAdapter;
pub use usgs::UsgsAdapter;

use futures::future::BoxFuture;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::data::Record;
use crate::query::Query;

/// Longest upstream error body kept in an `Upstream` error message
const MAX_ERROR_BODY_CHARS: usize = 200;

/// Errors an adapter can report while fetching or normalizing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// Transport-level failure or timeout
    #[error("network error: {0}")]
    Network(String),

    /// Provider throttled the request
    #[error("rate limited by upstream{}", retry_after_suffix(.retry_after))]
    RateLimited {
        /// Seconds the provider asked us to wait, if it said
        retry_after: Option<u64>,
    },

    /// Provider answered with an error status
    #[error("upstream returned HTTP {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Response did not have the expected shape
    #[error("failed to parse upstream response: {0}")]
    Parse(String),

    /// The query cannot be translated into a request for this source
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

fn retry_after_suffix(retry_after: &Option<u64>) -> String {
    match retry_after {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    }
}

impl SourceError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Network(_) | SourceError::RateLimited { .. })
    }

    /// Failures after which previously cached data may still be served
    ///
    /// Parse and query errors mean the adapter output cannot be trusted, so
    /// they always surface as "no data".
    pub fn allows_stale_fallback(&self) -> bool {
        matches!(
            self,
            SourceError::Network(_) | SourceError::RateLimited { .. } | SourceError::Upstream { .. }
        )
    }

    /// Maps a reqwest failure to `Network`, keeping the provider URL out of the message
    pub fn from_transport(error: reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            "request timed out"
        } else if error.is_connect() {
            "connection failed"
        } else if error.is_body() || error.is_decode() {
            "failed to read response body"
        } else {
            "request failed"
        };
        SourceError::Network(format!("{}: {}", kind, error.without_url()))
    }
}

/// Body returned by a successful upstream call, before normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// HTTP status of the response
    pub status: u16,
    /// Response body as text
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// A 200 response, handy for fixture-driven tests
    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }
}

/// Translator between one external API and the record model
pub trait SourceAdapter: Send + Sync {
    /// Identifier queries use to address this adapter (e.g. "usgs")
    fn source_id(&self) -> &str;

    /// Performs the upstream request for `query`
    fn fetch_raw<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, Result<RawResponse, SourceError>>;

    /// Parses a raw response into records, in upstream order
    fn normalize(&self, raw: &RawResponse) -> Result<Vec<Record>, SourceError>;
}

/// Adapters keyed by source id
#[derive(Clone, Default)]
pub struct SourceRegistry {
    adapters: BTreeMap<String, Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under its own source id, replacing any previous one
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) -> &mut Self {
        let id = adapter.source_id().to_string();
        if self.adapters.insert(id.clone(), adapter).is_some() {
            tracing::debug!(source = %id, "replaced registered adapter");
        }
        self
    }

    /// Builder-style variant of `register`
    pub fn with(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(source_id).cloned()
    }

    /// Registered source ids in sorted order
    pub fn source_ids(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.source_ids())
            .finish()
    }
}

/// Builds the HTTP client adapters share, with a per-request timeout
pub fn build_http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("envdash/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to build configured HTTP client, using defaults");
            Client::new()
        })
}

/// Sends a GET request and classifies the outcome
///
/// # Returns
/// * `Ok(RawResponse)` for 2xx responses
/// * `Err(SourceError::RateLimited)` for 429, with `Retry-After` seconds if sent
/// * `Err(SourceError::Upstream)` for any other non-success status
/// * `Err(SourceError::Network)` for transport failures and timeouts
pub async fn http_get_text(client: &Client, url: &str) -> Result<RawResponse, SourceError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(SourceError::from_transport)?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        return Err(SourceError::RateLimited { retry_after });
    }

    let body = response.text().await.map_err(SourceError::from_transport)?;

    if !status.is_success() {
        return Err(SourceError::Upstream {
            status: status.as_u16(),
            message: truncate_chars(body.trim(), MAX_ERROR_BODY_CHARS),
        });
    }

    Ok(RawResponse::new(status.as_u16(), body))
}

/// UTC offsets for the US zone abbreviations providers stamp on local times
pub(crate) fn utc_offset_hours(zone: &str) -> Option<i64> {
    let offset = match zone.to_ascii_uppercase().as_str() {
        "UTC" | "GMT" => 0,
        "EST" => -5,
        "EDT" => -4,
        "CST" => -6,
        "CDT" => -5,
        "MST" => -7,
        "MDT" => -6,
        "PST" => -8,
        "PDT" => -7,
        "AKST" => -9,
        "AKDT" => -8,
        "HST" => -10,
        _ => return None,
    };
    Some(offset)
}

/// Truncates to at most `max` characters without splitting a code point
fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedAdapter(&'static str);

    impl SourceAdapter for NamedAdapter {
        fn source_id(&self) -> &str {
            self.0
        }

        fn fetch_raw<'a>(&'a self, _query: &'a Query) -> BoxFuture<'a, Result<RawResponse, SourceError>> {
            Box::pin(async { Ok(RawResponse::ok("[]")) })
        }

        fn normalize(&self, _raw: &RawResponse) -> Result<Vec<Record>, SourceError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_registry_lookup_by_source_id() {
        let registry = SourceRegistry::new()
            .with(Arc::new(NamedAdapter("usgs")))
            .with(Arc::new(NamedAdapter("airnow")));

        assert_eq!(registry.source_ids(), vec!["airnow", "usgs"]);
        assert_eq!(registry.get("usgs").unwrap().source_id(), "usgs");
        assert!(registry.get("noaa").is_none());
    }

    #[test]
    fn test_registering_same_id_replaces_adapter() {
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(NamedAdapter("usgs")));
        registry.register(Arc::new(NamedAdapter("usgs")));

        assert_eq!(registry.source_ids().len(), 1);
    }

    #[test]
    fn test_error_classification() {
        let network = SourceError::Network("timed out".to_string());
        let limited = SourceError::RateLimited { retry_after: Some(30) };
        let upstream = SourceError::Upstream {
            status: 503,
            message: "maintenance".to_string(),
        };
        let parse = SourceError::Parse("missing field".to_string());
        let invalid = SourceError::InvalidQuery("missing site".to_string());

        assert!(network.is_retryable());
        assert!(limited.is_retryable());
        assert!(!upstream.is_retryable());
        assert!(!parse.is_retryable());
        assert!(!invalid.is_retryable());

        assert!(network.allows_stale_fallback());
        assert!(limited.allows_stale_fallback());
        assert!(upstream.allows_stale_fallback());
        assert!(!parse.allows_stale_fallback());
        assert!(!invalid.allows_stale_fallback());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            SourceError::RateLimited { retry_after: Some(30) }.to_string(),
            "rate limited by upstream (retry after 30s)"
        );
        assert_eq!(
            SourceError::RateLimited { retry_after: None }.to_string(),
            "rate limited by upstream"
        );
        assert_eq!(
            SourceError::Upstream {
                status: 404,
                message: "No sites found".to_string()
            }
            .to_string(),
            "upstream returned HTTP 404: No sites found"
        );
    }

    #[test]
    fn test_utc_offsets() {
        assert_eq!(utc_offset_hours("PDT"), Some(-7));
        assert_eq!(utc_offset_hours("akst"), Some(-9));
        assert_eq!(utc_offset_hours("CET"), None);
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("abcdef", 3), "abc...");
        assert_eq!(truncate_chars("ééééé", 2), "éé...");
    }
}
