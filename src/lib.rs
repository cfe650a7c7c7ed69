//! Environmental Dashboard data layer
//!
//! Fetches environmental measurements from public APIs through pluggable
//! source adapters and keeps them in a file-backed cache so repeated queries
//! are served without a network round-trip.

pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod data;
pub mod query;
pub mod source;

pub use cache::{CacheEntry, CacheError, CacheStore};
pub use config::{ConfigError, Settings};
pub use coordinator::{FetchCoordinator, ResolveError, RetryPolicy};
pub use data::{Freshness, Record, Resolved, StaleWarning};
pub use query::{Fingerprint, Query};
pub use source::{RawResponse, SourceAdapter, SourceError, SourceRegistry};
