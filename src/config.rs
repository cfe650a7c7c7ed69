//! Runtime settings for the cache layer
//!
//! Settings start from built-in defaults, can be overlaid from `ENVDASH_*`
//! environment variables, and are finally adjusted from CLI flags by the
//! binary. The core only ever sees the resulting plain values.

use directories::ProjectDirs;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::coordinator::RetryPolicy;

/// Default upstream request timeout
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Default TTL for sources without an override (15 minutes)
pub const DEFAULT_TTL_SECS: u64 = 900;

/// USGS instantaneous values update every 15 minutes
pub const USGS_TTL_SECS: u64 = 900;

/// AirNow publishes hourly observations
pub const AIRNOW_TTL_SECS: u64 = 3600;

/// Name of the cache file inside the cache directory
const CACHE_FILE_NAME: &str = "cache.json";

/// Errors that can occur when reading settings
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting had a value that could not be parsed
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

/// Settings consumed by the fetch coordinator and adapters
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Location of the cache file
    pub cache_file: PathBuf,
    /// Upper bound for a single upstream request
    pub request_timeout: Duration,
    /// TTL for sources without an override
    pub default_ttl_secs: u64,
    /// Per-source TTL overrides keyed by source id
    pub source_ttls: BTreeMap<String, u64>,
    /// Retry behaviour for transient failures
    pub retry: RetryPolicy,
    /// Optional bound on the number of cache entries
    pub max_cache_entries: Option<usize>,
    /// API key for EPA AirNow; the adapter is only registered when set
    pub airnow_api_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut source_ttls = BTreeMap::new();
        source_ttls.insert("usgs".to_string(), USGS_TTL_SECS);
        source_ttls.insert("airnow".to_string(), AIRNOW_TTL_SECS);

        Self {
            cache_file: default_cache_file(),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            default_ttl_secs: DEFAULT_TTL_SECS,
            source_ttls,
            retry: RetryPolicy::default(),
            max_cache_entries: None,
            airnow_api_key: None,
        }
    }
}

impl Settings {
    /// Defaults overlaid with values from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value
    ///
    /// Recognized variables:
    /// * `ENVDASH_CACHE_FILE`
    /// * `ENVDASH_TIMEOUT_SECS`
    /// * `ENVDASH_TTL_SECS`
    /// * `ENVDASH_TTL_<SOURCE>_SECS` for each known source
    /// * `ENVDASH_MAX_RETRIES`
    /// * `ENVDASH_MAX_CACHE_ENTRIES`
    /// * `AIRNOW_API_KEY`
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = non_empty(lookup("ENVDASH_CACHE_FILE")) {
            self.cache_file = PathBuf::from(path);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "ENVDASH_TIMEOUT_SECS")? {
            if secs == 0 {
                return Err(invalid("ENVDASH_TIMEOUT_SECS", "0"));
            }
            self.request_timeout = Duration::from_secs(secs);
        }
        if let Some(ttl) = parse_var::<u64>(&lookup, "ENVDASH_TTL_SECS")? {
            self.default_ttl_secs = ttl;
        }
        let sources: Vec<String> = self.source_ttls.keys().cloned().collect();
        for source in sources {
            let key = format!("ENVDASH_TTL_{}_SECS", source.to_uppercase());
            if let Some(ttl) = parse_var::<u64>(&lookup, &key)? {
                self.source_ttls.insert(source, ttl);
            }
        }
        if let Some(retries) = parse_var::<u32>(&lookup, "ENVDASH_MAX_RETRIES")? {
            self.retry.max_retries = retries;
        }
        if let Some(max) = parse_var::<usize>(&lookup, "ENVDASH_MAX_CACHE_ENTRIES")? {
            self.max_cache_entries = Some(max);
        }
        if let Some(key) = non_empty(lookup("AIRNOW_API_KEY")) {
            self.airnow_api_key = Some(key);
        }
        Ok(self)
    }

    /// TTL to stamp on entries fetched from `source_id`
    pub fn ttl_for(&self, source_id: &str) -> u64 {
        self.source_ttls
            .get(source_id)
            .copied()
            .unwrap_or(self.default_ttl_secs)
    }

    /// Sets a per-source TTL
    pub fn with_source_ttl(mut self, source_id: impl Into<String>, ttl_secs: u64) -> Self {
        self.source_ttls.insert(source_id.into(), ttl_secs);
        self
    }
}

/// XDG cache location (`~/.cache/envdash/cache.json` on Linux), or a local
/// `cache/` directory when no home directory is available
pub fn default_cache_file() -> PathBuf {
    match ProjectDirs::from("", "", "envdash") {
        Some(dirs) => dirs.cache_dir().join(CACHE_FILE_NAME),
        None => PathBuf::from("cache").join("envdash.json"),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match non_empty(lookup(key)) {
        None => Ok(None),
        Some(value) => value.parse::<T>().map(Some).map_err(|_| invalid(key, &value)),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.request_timeout, Duration::from_secs(5));
        assert_eq!(settings.ttl_for("usgs"), 900);
        assert_eq!(settings.ttl_for("airnow"), 3600);
        assert_eq!(settings.ttl_for("unknown"), DEFAULT_TTL_SECS);
        assert!(settings.max_cache_entries.is_none());
        assert!(settings.airnow_api_key.is_none());
        assert!(settings.cache_file.to_string_lossy().contains("envdash"));
    }

    #[test]
    fn test_overlay_reads_all_variables() {
        let settings = Settings::default()
            .overlay(lookup_from(&[
                ("ENVDASH_CACHE_FILE", "/tmp/envdash-test.json"),
                ("ENVDASH_TIMEOUT_SECS", "2"),
                ("ENVDASH_TTL_SECS", "60"),
                ("ENVDASH_TTL_USGS_SECS", "120"),
                ("ENVDASH_MAX_RETRIES", "0"),
                ("ENVDASH_MAX_CACHE_ENTRIES", "50"),
                ("AIRNOW_API_KEY", " abc123 "),
            ]))
            .unwrap();

        assert_eq!(settings.cache_file, PathBuf::from("/tmp/envdash-test.json"));
        assert_eq!(settings.request_timeout, Duration::from_secs(2));
        assert_eq!(settings.ttl_for("usgs"), 120);
        assert_eq!(settings.ttl_for("airnow"), 3600);
        assert_eq!(settings.ttl_for("other"), 60);
        assert_eq!(settings.retry.max_retries, 0);
        assert_eq!(settings.max_cache_entries, Some(50));
        assert_eq!(settings.airnow_api_key.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_overlay_ignores_empty_values() {
        let settings = Settings::default()
            .overlay(lookup_from(&[("ENVDASH_TTL_SECS", "  "), ("AIRNOW_API_KEY", "")]))
            .unwrap();
        assert_eq!(settings.default_ttl_secs, DEFAULT_TTL_SECS);
        assert!(settings.airnow_api_key.is_none());
    }

    #[test]
    fn test_overlay_rejects_invalid_numbers() {
        let err = Settings::default()
            .overlay(lookup_from(&[("ENVDASH_TTL_SECS", "soon")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "ENVDASH_TTL_SECS".to_string(),
                value: "soon".to_string()
            }
        );

        assert!(Settings::default()
            .overlay(lookup_from(&[("ENVDASH_TIMEOUT_SECS", "0")]))
            .is_err());
    }

    #[test]
    fn test_with_source_ttl() {
        let settings = Settings::default().with_source_ttl("noaa", 30);
        assert_eq!(settings.ttl_for("noaa"), 30);
    }
}
