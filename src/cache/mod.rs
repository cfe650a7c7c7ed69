//! Cache module for storing normalized records to disk
//!
//! This module provides a file-backed store keyed by query fingerprint. Each
//! entry carries its fetch time and TTL so the fetch coordinator can decide
//! between serving it and refreshing it, and can still serve an expired entry
//! when the upstream API is unavailable.

mod store;

pub use store::{CacheEntry, CacheError, CacheStore};
