//! USGS Water Services adapter
//!
//! Builds NWIS instantaneous-value (`iv`) and daily-value (`dv`) requests and
//! normalizes the response into one record per reading. Responses come either
//! as WaterML JSON (the default) or as tab-delimited RDB when the query asks
//! for `format=rdb`.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Utc};
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
pub const SOURCE_ID: &str = "usgs";

/// Default NWIS endpoint root
const DEFAULT_BASE_URL: &str = "https://waterservices.usgs.gov/nwis";

/// Default look-back for instantaneous values
const DEFAULT_IV_PERIOD: &str = "P7D";

/// Default look-back for daily values
const DEFAULT_DV_PERIOD: &str = "P365D";

/// NWIS marks missing readings with this value
const NO_DATA_SENTINEL: f64 = -999999.0;

/// Friendly metric names, their USGS parameter codes and reporting units
const PARAMETER_CODES: &[(&str, &str, &str)] = &[
    ("temperature", "00010", "deg C"),
    ("discharge", "00060", "ft3/s"),
    ("gage_height", "00065", "ft"),
    ("specific_conductance", "00095", "uS/cm @25C"),
    ("dissolved_oxygen", "00300", "mg/l"),
    ("ph", "00400", "std units"),
    ("turbidity", "63680", "FNU"),
];

/// Resolves a metric name or 5-digit code to a parameter code
///
/// Known names map through the table; any other 5-digit code is passed
/// through unchanged.
pub fn parameter_code(metric: &str) -> Option<String> {
    let trimmed = metric.trim();
    if is_parameter_code(trimmed) {
        return Some(trimmed.to_string());
    }
    let name = trimmed.to_lowercase().replace([' ', '-'], "_");
    PARAMETER_CODES
        .iter()
        .find(|(known, _, _)| *known == name)
        .map(|(_, code, _)| code.to_string())
}

/// Friendly metric name for a parameter code, if it is one we know
pub fn metric_name(code: &str) -> Option<&'static str> {
    PARAMETER_CODES
        .iter()
        .find(|(_, c, _)| *c == code)
        .map(|(name, _, _)| *name)
}

/// Reporting unit for a known parameter code
fn default_unit(code: &str) -> Option<&'static str> {
    PARAMETER_CODES
        .iter()
        .find(|(_, c, _)| *c == code)
        .map(|(_, _, unit)| *unit)
}

fn is_parameter_code(s: &str) -> bool {
    s.len() == 5 && s.bytes().all(|b| b.is_ascii_digit())
}

/// NWIS service to query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    /// Instantaneous values, typically every 15 minutes
    Instantaneous,
    /// Daily statistics
    Daily,
}

impl Service {
    fn from_param(value: Option<&str>) -> Result<Self, SourceError> {
        match value.map(|v| v.trim().to_lowercase()).as_deref() {
            None | Some("iv") => Ok(Service::Instantaneous),
            Some("dv") => Ok(Service::Daily),
            Some(other) => Err(SourceError::InvalidQuery(format!(
                "unknown USGS service '{}', expected 'iv' or 'dv'",
                other
            ))),
        }
    }

    fn path(&self) -> &'static str {
        match self {
            Service::Instantaneous => "iv",
            Service::Daily => "dv",
        }
    }

    fn default_period(&self) -> &'static str {
        match self {
            Service::Instantaneous => DEFAULT_IV_PERIOD,
            Service::Daily => DEFAULT_DV_PERIOD,
        }
    }
}

/// Response encoding requested from NWIS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// WaterML JSON
    Json,
    /// Tab-delimited RDB
    Rdb,
}

impl Format {
    fn from_param(value: Option<&str>) -> Result<Self, SourceError> {
        match value.map(|v| v.trim().to_lowercase()).as_deref() {
            None | Some("json") => Ok(Format::Json),
            Some("rdb") => Ok(Format::Rdb),
            Some(other) => Err(SourceError::InvalidQuery(format!(
                "unknown USGS format '{}', expected 'json' or 'rdb'",
                other
            ))),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Rdb => "rdb",
        }
    }
}

/// Top-level WaterML-JSON document
#[derive(Debug, Deserialize)]
struct WaterMlResponse {
    value: WaterMlValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaterMlValue {
    time_series: Vec<TimeSeries>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeSeries {
    source_info: SourceInfo,
    variable: Variable,
    #[serde(default)]
    values: Vec<ValueBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceInfo {
    site_code: Vec<CodeValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Variable {
    variable_code: Vec<CodeValue>,
    unit: Unit,
    #[serde(default)]
    no_data_value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CodeValue {
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Unit {
    unit_code: String,
}

#[derive(Debug, Deserialize)]
struct ValueBlock {
    #[serde(default)]
    value: Vec<Reading>,
}

/// A single reading; NWIS sends the number as a string
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Reading {
    value: String,
    date_time: String,
}

/// Client for the USGS Water Services REST API
#[derive(Debug, Clone)]
pub struct UsgsAdapter {
    /// HTTP client for making requests
    http_client: Client,
    /// Base URL for the API (allows override for testing)
    base_url: String,
}

impl UsgsAdapter {
    /// Creates an adapter against the public NWIS endpoint
    pub fn new(timeout: Duration) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, timeout)
    }

    /// Creates an adapter against a custom base URL (for testing)
    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http_client: build_http_client(timeout),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Builds the request URL for a query
    ///
    /// # Query parameters
    /// * `site` - required USGS site number(s), comma separated
    /// * `metric` - optional friendly name or parameter code
    /// * `range` - optional `YYYY-MM-DD..YYYY-MM-DD`, takes precedence over `period`
    /// * `period` - optional ISO 8601 duration
    /// * `service` - `iv` (default) or `dv`
    /// * `format` - `json` (default) or `rdb`
    /// * `site_status` - defaults to `all`
    pub fn request_url(&self, query: &Query) -> Result<String, SourceError> {
        let site = query
            .param("site")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SourceError::InvalidQuery("USGS query requires a 'site'".to_string()))?;
        let service = Service::from_param(query.param("service"))?;
        let format = Format::from_param(query.param("format"))?;

        let mut url = format!(
            "{}/{}/?format={}&sites={}",
            self.base_url,
            service.path(),
            format.as_str(),
            encode(site)
        );

        if let Some(metric) = query.param("metric") {
            let code = parameter_code(metric).ok_or_else(|| {
                SourceError::InvalidQuery(format!("unknown USGS metric '{}'", metric))
            })?;
            url.push_str("&parameterCd=");
            url.push_str(&code);
        }

        match query.param("range") {
            Some(range) => {
                let (start, end) = parse_range(range)?;
                url.push_str(&format!("&startDT={}&endDT={}", start, end));
            }
            None => {
                let period = query.param("period").unwrap_or(service.default_period());
                url.push_str("&period=");
                url.push_str(&encode(period));
            }
        }

        url.push_str("&siteStatus=");
        url.push_str(&encode(query.param("site_status").unwrap_or("all")));
        Ok(url)
    }
}

impl SourceAdapter for UsgsAdapter {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    fn fetch_raw<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, Result<RawResponse, SourceError>> {
        Box::pin(async move {
            let url = self.request_url(query)?;
            tracing::debug!(%url, "requesting USGS data");
            http_get_text(&self.http_client, &url).await
        })
    }

    fn normalize(&self, raw: &RawResponse) -> Result<Vec<Record>, SourceError> {
        // RDB bodies always open with a `#` comment block
        if raw.body.trim_start().starts_with('#') {
            parse_rdb(&raw.body)
        } else {
            parse_water_ml(&raw.body)
        }
    }
}

/// Parses a WaterML-JSON body into records
fn parse_water_ml(body: &str) -> Result<Vec<Record>, SourceError> {
    let response: WaterMlResponse =
        serde_json::from_str(body).map_err(|e| SourceError::Parse(e.to_string()))?;

    let mut records = Vec::new();
    for series in response.value.time_series {
        let site = series
            .source_info
            .site_code
            .first()
            .map(|c| c.value.clone())
            .ok_or_else(|| SourceError::Parse("time series without site code".to_string()))?;
        let code = series
            .variable
            .variable_code
            .first()
            .map(|c| c.value.as_str())
            .ok_or_else(|| SourceError::Parse("time series without variable code".to_string()))?;
        let metric = metric_name(code).unwrap_or(code).to_string();
        let unit = series.variable.unit.unit_code;
        let no_data = series.variable.no_data_value;

        for reading in series.values.iter().flat_map(|block| block.value.iter()) {
            let value: f64 = reading.value.trim().parse().map_err(|_| {
                SourceError::Parse(format!("invalid reading value '{}'", reading.value))
            })?;
            if no_data == Some(value) {
                continue;
            }
            if !value.is_finite() {
                return Err(SourceError::Parse(format!(
                    "non-finite reading value '{}'",
                    reading.value
                )));
            }

            records.push(Record {
                source_id: SOURCE_ID.to_string(),
                site_identifier: site.clone(),
                metric_name: metric.clone(),
                value,
                unit: unit.clone(),
                observed_at: parse_date_time(&reading.date_time)?,
            });
        }
    }

    Ok(records)
}

/// Column positions of one RDB block
#[derive(Debug)]
struct RdbHeader {
    site: usize,
    datetime: usize,
    tz: Option<usize>,
    /// Value columns with the parameter code each one carries
    values: Vec<(usize, String)>,
}

impl RdbHeader {
    fn parse(columns: &[&str]) -> Result<Self, SourceError> {
        let position = |name: &str| columns.iter().position(|c| c.trim() == name);
        let site = position("site_no")
            .ok_or_else(|| SourceError::Parse("RDB header without site_no".to_string()))?;
        let datetime = position("datetime")
            .ok_or_else(|| SourceError::Parse("RDB header without datetime".to_string()))?;

        // Value columns are `<tsid>_<pcode>` (iv) or `<tsid>_<pcode>_<stat>` (dv);
        // `_cd` columns hold qualifiers
        let values = columns
            .iter()
            .enumerate()
            .filter(|(_, name)| !name.ends_with("_cd"))
            .filter_map(|(idx, name)| {
                let code = name.trim().split('_').nth(1)?;
                is_parameter_code(code).then(|| (idx, code.to_string()))
            })
            .collect();

        Ok(Self {
            site,
            datetime,
            tz: position("tz_cd"),
            values,
        })
    }
}

/// Parses a tab-delimited RDB body into records
///
/// Each block is a header row starting with `agency_cd`, a column-width row,
/// then data rows. Blank cells and the no-data sentinel are skipped.
fn parse_rdb(body: &str) -> Result<Vec<Record>, SourceError> {
    let mut records = Vec::new();
    let mut header: Option<RdbHeader> = None;
    let mut lines = body
        .lines()
        .filter(|line| !line.starts_with('#') && !line.trim().is_empty());

    while let Some(line) = lines.next() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.first().map(|f| f.trim()) == Some("agency_cd") {
            header = Some(RdbHeader::parse(&fields)?);
            lines.next();
            continue;
        }

        let columns = header
            .as_ref()
            .ok_or_else(|| SourceError::Parse("RDB data row before header".to_string()))?;
        let cell = |idx: usize| fields.get(idx).map(|f| f.trim()).unwrap_or("");

        let site = cell(columns.site);
        let observed_at = parse_rdb_time(cell(columns.datetime), columns.tz.map(cell))?;

        for (idx, code) in &columns.values {
            let raw = cell(*idx);
            if raw.is_empty() {
                continue;
            }
            let value: f64 = raw
                .parse()
                .map_err(|_| SourceError::Parse(format!("invalid reading value '{}'", raw)))?;
            if value == NO_DATA_SENTINEL {
                continue;
            }
            if !value.is_finite() {
                return Err(SourceError::Parse(format!("non-finite reading value '{}'", raw)));
            }

            records.push(Record {
                source_id: SOURCE_ID.to_string(),
                site_identifier: site.to_string(),
                metric_name: metric_name(code).unwrap_or(code.as_str()).to_string(),
                value,
                unit: default_unit(code).unwrap_or_default().to_string(),
                observed_at,
            });
        }
    }

    Ok(records)
}

/// Reads an RDB local time (`YYYY-MM-DD HH:MM` or a bare date) in zone `tz`
///
/// Rows without a zone column are read as UTC.
fn parse_rdb_time(datetime: &str, tz: Option<&str>) -> Result<DateTime<Utc>, SourceError> {
    let invalid = || SourceError::Parse(format!("invalid timestamp '{}'", datetime));
    let local = NaiveDateTime::parse_from_str(datetime, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(datetime, "%Y-%m-%d %H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(datetime, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(invalid)?;

    let offset_hours = match tz.filter(|z| !z.is_empty()) {
        Some(zone) => utc_offset_hours(zone)
            .ok_or_else(|| SourceError::Parse(format!("unknown time zone '{}'", zone)))?,
        None => 0,
    };
    Ok((local - ChronoDuration::hours(offset_hours)).and_utc())
}

/// Parses NWIS timestamps; daily values come without an offset and are read as UTC
fn parse_date_time(s: &str) -> Result<DateTime<Utc>, SourceError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| SourceError::Parse(format!("invalid timestamp '{}'", s)))
}

/// Splits `YYYY-MM-DD..YYYY-MM-DD` into validated start and end dates
fn parse_range(range: &str) -> Result<(NaiveDate, NaiveDate), SourceError> {
    let invalid = || {
        SourceError::InvalidQuery(format!(
            "invalid range '{}', expected YYYY-MM-DD..YYYY-MM-DD",
            range
        ))
    };
    let (start, end) = range.split_once("..").ok_or_else(invalid)?;
    let start = NaiveDate::parse_from_str(start.trim(), "%Y-%m-%d").map_err(|_| invalid())?;
    let end = NaiveDate::parse_from_str(end.trim(), "%Y-%m-%d").map_err(|_| invalid())?;
    if end < start {
        return Err(invalid());
    }
    Ok((start, end))
}

/// Percent-encodes characters that would break a query string
fn encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b',' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
