//! Logical data requests and their cache fingerprints
//!
//! A `Query` names a source and a set of string parameters. Parameters are kept
//! in a key-sorted map so two queries built in a different order compare equal
//! and hash to the same `Fingerprint`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// An immutable, source-addressed data request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    source_id: String,
    parameters: BTreeMap<String, String>,
}

impl Query {
    /// Creates a query for the given source with no parameters
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Returns the query with `key` set to `value`, replacing any previous value
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Identifier of the source adapter that serves this query
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Looks up a single parameter
    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// All parameters, sorted by key
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Computes the cache key for this query
    ///
    /// Hashes the source id, the parameter count, and every key and value in
    /// sorted order. Each string is prefixed with its byte length as a
    /// little-endian `u64`, so no two distinct queries share an encoding.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hash_field(&mut hasher, &self.source_id);
        hasher.update((self.parameters.len() as u64).to_le_bytes());
        for (key, value) in &self.parameters {
            hash_field(&mut hasher, key);
            hash_field(&mut hasher, value);
        }
        Fingerprint(hex::encode(hasher.finalize()))
    }
}

fn hash_field(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source_id)?;
        for (i, (key, value)) in self.parameters.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, key, value)?;
        }
        Ok(())
    }
}

/// Hex-encoded SHA-256 of a normalized query
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps an existing fingerprint string (e.g. a key read back from disk)
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_query() -> Query {
        Query::new("usgs")
            .with_param("site", "01646500")
            .with_param("metric", "discharge")
            .with_param("range", "2024-01-01..2024-01-02")
    }

    #[test]
    fn test_parameter_order_does_not_change_fingerprint() {
        let reordered = Query::new("usgs")
            .with_param("range", "2024-01-01..2024-01-02")
            .with_param("metric", "discharge")
            .with_param("site", "01646500");

        assert_eq!(scenario_query(), reordered);
        assert_eq!(scenario_query().fingerprint(), reordered.fingerprint());
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let fp = scenario_query().fingerprint();
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(fp, scenario_query().fingerprint());
        assert_eq!(fp.short().len(), 12);
    }

    #[test]
    fn test_different_queries_have_different_fingerprints() {
        let base = scenario_query();
        let other_site = base.clone().with_param("site", "09163500");
        let other_source = Query::new("airnow")
            .with_param("site", "01646500")
            .with_param("metric", "discharge")
            .with_param("range", "2024-01-01..2024-01-02");

        assert_ne!(base.fingerprint(), other_site.fingerprint());
        assert_ne!(base.fingerprint(), other_source.fingerprint());
    }

    #[test]
    fn test_concatenation_ambiguity_does_not_collide() {
        let a = Query::new("usgs").with_param("ab", "c");
        let b = Query::new("usgs").with_param("a", "bc");
        let c = Query::new("usgsa").with_param("b", "c");

        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_fingerprint_encoding_is_pinned() {
        // Changing this value orphans every existing cache file
        let query = Query::new("usgs").with_param("site", "01646500");
        assert_eq!(
            query.fingerprint().as_str(),
            "b55617869b293b862db66d94173fd82c0b1ba5930b5c72813011d4431caccd5e"
        );
    }

    #[test]
    fn test_separator_characters_do_not_collide() {
        let a = Query::new("usgs").with_param("a", "b\u{0}c");
        let b = Query::new("usgs").with_param("a\u{0}b", "c");
        let empty_value = Query::new("usgs").with_param("a", "");
        let no_params = Query::new("usgs");

        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(empty_value.fingerprint(), no_params.fingerprint());
    }

    #[test]
    fn test_with_param_replaces_existing_value() {
        let query = Query::new("usgs")
            .with_param("site", "1")
            .with_param("site", "2");
        assert_eq!(query.param("site"), Some("2"));
        assert_eq!(query.params().len(), 1);
    }

    #[test]
    fn test_display_lists_sorted_params() {
        assert_eq!(
            scenario_query().to_string(),
            "usgs?metric=discharge&range=2024-01-01..2024-01-02&site=01646500"
        );
        assert_eq!(Query::new("usgs").to_string(), "usgs");
    }
}
