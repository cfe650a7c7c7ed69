//! EPA AirNow adapter
//!
//! Fetches historical hourly AQI observations by ZIP code. AirNow reports local
//! dates and hours with a US time-zone abbreviation, converted here to UTC.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use futures::future::BoxFuture;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::{
    build_http_client, http_get_text, utc_offset_hours, RawResponse, SourceAdapter, SourceError,
};
use crate::data::Record;
use crate::query::Query;

/// Source id queries use to address this adapter
pub const SOURCE_ID: &str = "airnow";

/// Default AirNow API root
const DEFAULT_BASE_URL: &str = "https://www.airnowapi.org";

/// Default search radius in miles
const DEFAULT_DISTANCE_MILES: &str = "25";

/// Unit attached to every AirNow record
const AQI_UNIT: &str = "AQI";

/// A single observation as returned by AirNow
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Observation {
    date_observed: String,
    hour_observed: u32,
    local_time_zone: String,
    reporting_area: String,
    parameter_name: String,
    #[serde(rename = "AQI")]
    aqi: f64,
}

/// Client for the EPA AirNow observation API
#[derive(Clone)]
pub struct AirNowAdapter {
    /// HTTP client for making requests
    http_client: Client,
    /// Base URL for the API (allows override for testing)
    base_url: String,
    /// AirNow API key, sent as a query parameter
    api_key: String,
}

impl std::fmt::Debug for AirNowAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AirNowAdapter")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl AirNowAdapter {
    /// Creates an adapter against the public AirNow endpoint
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, api_key, timeout)
    }

    /// Creates an adapter against a custom base URL (for testing)
    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http_client: build_http_client(timeout),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// Builds the request URL without the API key
    ///
    /// # Query parameters
    /// * `zip` - required 5-digit ZIP code
    /// * `date` - required `YYYY-MM-DD`
    /// * `distance` - optional search radius in miles
    pub fn request_url(&self, query: &Query) -> Result<String, SourceError> {
        let zip = query
            .param("zip")
            .map(str::trim)
            .filter(|z| z.len() == 5 && z.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| {
                SourceError::InvalidQuery("AirNow query requires a 5-digit 'zip'".to_string())
            })?;
        let date = query
            .param("date")
            .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok())
            .ok_or_else(|| {
                SourceError::InvalidQuery("AirNow query requires a 'date' as YYYY-MM-DD".to_string())
            })?;
        let distance = query.param("distance").unwrap_or(DEFAULT_DISTANCE_MILES);
        if distance.parse::<u32>().is_err() {
            return Err(SourceError::InvalidQuery(format!(
                "invalid AirNow distance '{}'",
                distance
            )));
        }

        Ok(format!(
            "{}/aq/observation/zipCode/historical/?format=application/json&zipCode={}&date={}T00-0000&distance={}",
            self.base_url,
            zip,
            date.format("%Y-%m-%d"),
            distance
        ))
    }
}

impl SourceAdapter for AirNowAdapter {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    fn fetch_raw<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, Result<RawResponse, SourceError>> {
        Box::pin(async move {
            let url = self.request_url(query)?;
            tracing::debug!(%url, "requesting AirNow data");
            let url = format!("{}&API_KEY={}", url, self.api_key);
            http_get_text(&self.http_client, &url).await
        })
    }

    fn normalize(&self, raw: &RawResponse) -> Result<Vec<Record>, SourceError> {
        parse_observations(&raw.body)
    }
}

/// Parses an AirNow observation array into records
fn parse_observations(body: &str) -> Result<Vec<Record>, SourceError> {
    let observations: Vec<Observation> =
        serde_json::from_str(body).map_err(|e| SourceError::Parse(e.to_string()))?;

    let mut records = Vec::with_capacity(observations.len());
    for obs in observations {
        // AirNow uses -1 when no AQI could be computed
        if obs.aqi < 0.0 {
            continue;
        }
        if !obs.aqi.is_finite() {
            return Err(SourceError::Parse(format!("non-finite AQI {}", obs.aqi)));
        }

        records.push(Record {
            source_id: SOURCE_ID.to_string(),
            site_identifier: obs.reporting_area.trim().to_string(),
            metric_name: obs.parameter_name.trim().to_string(),
            value: obs.aqi,
            unit: AQI_UNIT.to_string(),
            observed_at: observed_at(&obs)?,
        });
    }
    Ok(records)
}

/// Converts AirNow's local date, hour and zone abbreviation to UTC
fn observed_at(obs: &Observation) -> Result<DateTime<Utc>, SourceError> {
    let date = NaiveDate::parse_from_str(obs.date_observed.trim(), "%Y-%m-%d")
        .map_err(|_| SourceError::Parse(format!("invalid DateObserved '{}'", obs.date_observed)))?;
    let local = date
        .and_hms_opt(obs.hour_observed, 0, 0)
        .ok_or_else(|| SourceError::Parse(format!("invalid HourObserved {}", obs.hour_observed)))?;
    let offset_hours = utc_offset_hours(obs.local_time_zone.trim()).ok_or_else(|| {
        SourceError::Parse(format!("unknown time zone '{}'", obs.local_time_zone))
    })?;

    Ok((local - ChronoDuration::hours(offset_hours)).and_utc())
}
