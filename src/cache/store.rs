//! File-backed store mapping query fingerprints to cached records
//!
//! All entries live in one pretty-printed JSON file. Every write replaces the
//! whole file through a temporary sibling and a rename, so a reader never sees
//! a half-written cache. An unreadable file is treated as an empty cache and is
//! rebuilt by the next write.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::data::Record;
use crate::query::Fingerprint;

/// On-disk format version
const CACHE_FILE_VERSION: u32 = 1;

/// Errors that can occur when writing the cache file
#[derive(Debug, Error)]
pub enum CacheError {
    /// Directory creation, temp file or rename failed
    #[error("cache I/O failed: {0}")]
    Io(#[from] io::Error),

    /// Entries could not be encoded
    #[error("failed to encode cache file: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A cached adapter result with its fetch metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key this entry is stored under
    pub fingerprint: Fingerprint,
    /// Normalized records returned by the adapter
    pub payload: Vec<Record>,
    /// When the payload was fetched from upstream
    pub fetched_at: DateTime<Utc>,
    /// Adapter that produced the payload
    pub source_id: String,
    /// How long the payload counts as fresh
    pub ttl_seconds: u64,
}

impl CacheEntry {
    /// Returns true while `now` is inside the TTL window
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let secs = i64::try_from(self.ttl_seconds)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        let ttl = Duration::seconds(secs);
        now.signed_duration_since(self.fetched_at) < ttl
    }

    /// Seconds elapsed since the payload was fetched
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.fetched_at).num_seconds()
    }
}

/// Serialized layout of the cache file
#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: BTreeMap<Fingerprint, CacheEntry>,
}

/// Persistent fingerprint -> entry map backed by a single JSON file
///
/// The file is read lazily on first access. Writers inside one process are
/// serialized by an internal lock that is only held for the file update itself.
///
/// All methods do blocking `std::fs` I/O (`put` also fsyncs) while holding
/// that lock. Async callers run them inline on the runtime thread; each call
/// touches one small file and never waits on the network, so a resolve that
/// is mid-fetch never blocks a cache hit. Move calls behind
/// `tokio::task::spawn_blocking` if the file grows large or resolves become
/// highly concurrent.
#[derive(Debug)]
pub struct CacheStore {
    /// Location of the cache file
    path: PathBuf,
    /// Entries loaded from disk, `None` until first access
    entries: Mutex<Option<BTreeMap<Fingerprint, CacheEntry>>>,
    /// Optional bound on the number of stored entries
    max_entries: Option<usize>,
}

impl CacheStore {
    /// Creates a store backed by `path` without touching the filesystem
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(None),
            max_entries: None,
        }
    }

    /// Limits the store to `max_entries`, dropping the least recently fetched
    /// entries on write when the bound is exceeded
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    /// Returns the path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Looks up an entry; absence is not an error
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let mut guard = self.entries.lock();
        let entries = guard.get_or_insert_with(|| self.load());
        entries.get(fingerprint).cloned()
    }

    /// Returns true if an entry exists and is still inside its TTL
    pub fn exists_and_fresh(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> bool {
        self.get(fingerprint)
            .map(|entry| entry.is_fresh(now))
            .unwrap_or(false)
    }

    /// Inserts or replaces the entry for `fingerprint`
    ///
    /// The file is re-read before writing so entries written by other
    /// processes since the last load are kept.
    pub fn put(&self, fingerprint: &Fingerprint, entry: CacheEntry) -> Result<(), CacheError> {
        let mut guard = self.entries.lock();

        let mut entries = self.load();
        entries.insert(fingerprint.clone(), entry);
        self.evict(&mut entries);

        self.write_file(&entries)?;
        *guard = Some(entries);
        Ok(())
    }

    /// Snapshot of all entries, sorted by fingerprint
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut guard = self.entries.lock();
        let entries = guard.get_or_insert_with(|| self.load());
        entries.values().cloned().collect()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        let mut guard = self.entries.lock();
        guard.get_or_insert_with(|| self.load()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the cache file, degrading to an empty map if it is missing or unreadable
    fn load(&self) -> BTreeMap<Fingerprint, CacheEntry> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "cache file unreadable, treating as empty");
                return BTreeMap::new();
            }
        };

        match serde_json::from_str::<CacheFile>(&content) {
            Ok(file) if file.version == CACHE_FILE_VERSION => file.entries,
            Ok(file) => {
                tracing::warn!(
                    path = %self.path.display(),
                    version = file.version,
                    "unsupported cache file version, treating as empty"
                );
                BTreeMap::new()
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "cache file corrupt, treating as empty");
                BTreeMap::new()
            }
        }
    }

    /// Drops the oldest entries until the configured bound holds
    fn evict(&self, entries: &mut BTreeMap<Fingerprint, CacheEntry>) {
        let Some(max) = self.max_entries else {
            return;
        };
        if entries.len() <= max {
            return;
        }

        let mut by_age: Vec<(DateTime<Utc>, Fingerprint)> = entries
            .iter()
            .map(|(fp, entry)| (entry.fetched_at, fp.clone()))
            .collect();
        by_age.sort();

        let excess = entries.len() - max;
        for (_, fp) in by_age.into_iter().take(excess) {
            tracing::debug!(fingerprint = fp.short(), "evicting cache entry");
            entries.remove(&fp);
        }
    }

    /// Writes all entries to a temp file next to the cache file, then renames it into place
    fn write_file(&self, entries: &BTreeMap<Fingerprint, CacheEntry>) -> Result<(), CacheError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let file = CacheFileRef {
            version: CACHE_FILE_VERSION,
            entries,
        };

        let mut tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), &file)?;
        tmp.as_file_mut().write_all(b"\n")?;
        tmp.as_file_mut().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Borrowing twin of `CacheFile` used for writing
#[derive(Serialize)]
struct CacheFileRef<'a> {
    version: u32,
    entries: &'a BTreeMap<Fingerprint, CacheEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn create_test_store() -> (CacheStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = CacheStore::new(temp_dir.path().join("cache.json"));
        (store, temp_dir)
    }

    fn record(value: f64) -> Record {
        Record {
            source_id: "usgs".to_string(),
            site_identifier: "01646500".to_string(),
            metric_name: "discharge".to_string(),
            value,
            unit: "ft3/s".to_string(),
            observed_at: Utc.with_ymd_and_hms(2024, 1, 1, 5, 15, 0).unwrap(),
        }
    }

    fn entry(fp: &str, fetched_at: DateTime<Utc>, ttl_seconds: u64) -> CacheEntry {
        CacheEntry {
            fingerprint: Fingerprint::from_hex(fp),
            payload: vec![record(10400.0), record(0.1 + 0.2)],
            fetched_at,
            source_id: "usgs".to_string(),
            ttl_seconds,
        }
    }

    #[test]
    fn test_get_returns_none_for_missing_file() {
        let (store, temp_dir) = create_test_store();

        assert!(store.get(&Fingerprint::from_hex("abc")).is_none());
        assert!(store.is_empty());
        assert!(!temp_dir.path().join("cache.json").exists(), "get should not create the file");
    }

    #[test]
    fn test_put_then_get_round_trips_exactly() {
        let (store, temp_dir) = create_test_store();
        let fp = Fingerprint::from_hex("abc");
        let fetched_at = Utc.timestamp_opt(1_704_085_200, 123_456_789).unwrap();
        let original = entry("abc", fetched_at, 900);

        store.put(&fp, original.clone()).expect("put should succeed");

        assert_eq!(store.get(&fp), Some(original.clone()));

        // A fresh instance reads the same value back from disk
        let reopened = CacheStore::new(temp_dir.path().join("cache.json"));
        assert_eq!(reopened.get(&fp), Some(original));
    }

    #[test]
    fn test_cache_file_is_human_readable_json() {
        let (store, temp_dir) = create_test_store();
        let fp = Fingerprint::from_hex("abc");
        store.put(&fp, entry("abc", Utc::now(), 900)).unwrap();

        let content = fs::read_to_string(temp_dir.path().join("cache.json")).unwrap();
        assert!(content.contains("\"version\": 1"));
        assert!(content.contains("\"entries\""));
        assert!(content.contains("\"ttl_seconds\": 900"));
        assert!(content.contains("\"site_identifier\": \"01646500\""));
    }

    #[test]
    fn test_put_replaces_existing_entry() {
        let (store, _temp_dir) = create_test_store();
        let fp = Fingerprint::from_hex("abc");

        store.put(&fp, entry("abc", Utc::now(), 10)).unwrap();
        let mut replacement = entry("abc", Utc::now(), 20);
        replacement.payload = vec![record(1.0)];
        store.put(&fp, replacement.clone()).unwrap();

        assert_eq!(store.get(&fp), Some(replacement));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_exists_and_fresh_respects_ttl() {
        let (store, _temp_dir) = create_test_store();
        let fp = Fingerprint::from_hex("abc");
        let fetched_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store.put(&fp, entry("abc", fetched_at, 60)).unwrap();

        assert!(store.exists_and_fresh(&fp, fetched_at));
        assert!(store.exists_and_fresh(&fp, fetched_at + Duration::seconds(59)));
        assert!(!store.exists_and_fresh(&fp, fetched_at + Duration::seconds(60)));
        assert!(!store.exists_and_fresh(&Fingerprint::from_hex("missing"), fetched_at));
    }

    #[test]
    fn test_zero_ttl_is_never_fresh() {
        let now = Utc::now();
        assert!(!entry("abc", now, 0).is_fresh(now));
    }

    #[test]
    fn test_corrupt_file_degrades_to_empty_and_is_rewritten() {
        let (store, temp_dir) = create_test_store();
        let path = temp_dir.path().join("cache.json");
        fs::write(&path, b"\x00\x01 not json {{{").unwrap();

        assert!(store.get(&Fingerprint::from_hex("abc")).is_none());

        let fp = Fingerprint::from_hex("def");
        store.put(&fp, entry("def", Utc::now(), 60)).unwrap();

        let reopened = CacheStore::new(&path);
        assert_eq!(reopened.len(), 1);
        assert!(reopened.get(&fp).is_some());
    }

    #[test]
    fn test_unknown_version_is_treated_as_empty() {
        let (store, temp_dir) = create_test_store();
        fs::write(
            temp_dir.path().join("cache.json"),
            r#"{"version": 99, "entries": {}}"#,
        )
        .unwrap();

        assert!(store.is_empty());
    }

    #[test]
    fn test_put_creates_directory_if_missing() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("nested").join("cache").join("store.json");
        let store = CacheStore::new(&nested);

        store
            .put(&Fingerprint::from_hex("abc"), entry("abc", Utc::now(), 60))
            .expect("put should create parent directories");

        assert!(nested.exists());
    }

    #[test]
    fn test_put_merges_entries_written_by_another_instance() {
        let (store, temp_dir) = create_test_store();
        let other = CacheStore::new(temp_dir.path().join("cache.json"));

        // Load the (empty) file into the first instance before the other writes
        assert!(store.is_empty());

        other
            .put(&Fingerprint::from_hex("aaa"), entry("aaa", Utc::now(), 60))
            .unwrap();
        store
            .put(&Fingerprint::from_hex("bbb"), entry("bbb", Utc::now(), 60))
            .unwrap();

        let reopened = CacheStore::new(temp_dir.path().join("cache.json"));
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let (store, temp_dir) = create_test_store();
        store
            .put(&Fingerprint::from_hex("abc"), entry("abc", Utc::now(), 60))
            .unwrap();

        let files: Vec<_> = fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_max_entries_evicts_least_recently_fetched() {
        let (store, _temp_dir) = create_test_store();
        let store = store.with_max_entries(2);
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        store.put(&Fingerprint::from_hex("old"), entry("old", base, 60)).unwrap();
        store
            .put(&Fingerprint::from_hex("mid"), entry("mid", base + Duration::minutes(1), 60))
            .unwrap();
        store
            .put(&Fingerprint::from_hex("new"), entry("new", base + Duration::minutes(2), 60))
            .unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.get(&Fingerprint::from_hex("old")).is_none());
        assert!(store.get(&Fingerprint::from_hex("mid")).is_some());
        assert!(store.get(&Fingerprint::from_hex("new")).is_some());
    }

    #[test]
    fn test_concurrent_puts_for_distinct_keys_are_all_kept() {
        let (store, _temp_dir) = create_test_store();
        let store = std::sync::Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    let key = format!("key{}", i);
                    store
                        .put(&Fingerprint::from_hex(key.clone()), entry(&key, Utc::now(), 60))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 8);
    }
}
