//! Core data models for the environmental dashboard
//!
//! This module contains the canonical, source-agnostic observation shape that
//! every source adapter normalizes into, together with the freshness tag and
//! result type returned to downstream consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single normalized observation
///
/// Records are produced only by source adapters and are never modified after
/// construction. Analysis and charting code consume them as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Identifier of the source that produced the record (e.g. "usgs")
    pub source_id: String,
    /// Monitoring location identifier as reported by the source
    pub site_identifier: String,
    /// Measured quantity (e.g. "discharge", "PM2.5")
    pub metric_name: String,
    /// Measured value, always finite
    pub value: f64,
    /// Unit of `value` as reported by the source
    pub unit: String,
    /// When the observation was taken
    pub observed_at: DateTime<Utc>,
}

/// Whether served data is within its TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Fetched within the TTL window (or just now)
    Fresh,
    /// Past its TTL, served because a refresh failed
    Stale,
}

impl Freshness {
    /// Returns a short lowercase label for display
    pub fn as_str(&self) -> &'static str {
        match self {
            Freshness::Fresh => "fresh",
            Freshness::Stale => "stale",
        }
    }
}

/// Non-fatal notice attached to a stale result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleWarning {
    /// Why the refresh failed
    pub reason: String,
    /// How old the served data is, in seconds
    pub age_seconds: i64,
}

/// Data handed back to callers of the fetch coordinator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolved {
    /// Observations in the order the adapter produced them
    pub records: Vec<Record>,
    /// Freshness of `records`
    pub freshness: Freshness,
    /// When `records` were fetched from upstream
    pub fetched_at: DateTime<Utc>,
    /// Present only when `freshness` is `Stale`
    pub warning: Option<StaleWarning>,
}

impl Resolved {
    /// Returns true if the records were served past their TTL
    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Stale
    }
}
