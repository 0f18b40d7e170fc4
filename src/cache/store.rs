//! Local cache of API reads with caller-chosen freshness.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::KvBackend;

/// Key prefix separating cache entries from other data in the backend.
pub const CACHE_PREFIX: &str = "cache_";

/// Persisted shape of a cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  pub data: T,
  /// When the entry was written
  #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
  pub stored_at: DateTime<Utc>,
}

/// A fresh-enough cache entry returned by [`LocalCache::get`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit<T> {
  pub value: T,
  pub stored_at: DateTime<Utc>,
}

/// Timestamped key-value cache over a [`KvBackend`].
///
/// Never fails: backend and decoding errors degrade to a miss, and failed
/// writes leave the cache as it was.
#[derive(Clone)]
pub struct LocalCache {
  backend: Arc<dyn KvBackend>,
}

impl LocalCache {
  pub fn new(backend: Arc<dyn KvBackend>) -> Self {
    Self { backend }
  }

  fn storage_key(key: &str) -> String {
    format!("{}{}", CACHE_PREFIX, key)
  }

  /// Read `key` if it was stored no more than `max_age` ago.
  ///
  /// Expired entries are evicted. A zero `max_age` never hits.
  pub fn get<T: DeserializeOwned>(&self, key: &str, max_age: Duration) -> Option<CacheHit<T>> {
    let storage_key = Self::storage_key(key);

    let raw = match self.backend.get(&storage_key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, error = %e, "cache read failed");
        return None;
      }
    };

    let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
      Ok(entry) => entry,
      Err(e) => {
        debug!(key, error = %e, "discarding undecodable cache entry");
        return None;
      }
    };

    let age = Utc::now() - entry.stored_at;
    if max_age <= Duration::zero() || age > max_age {
      debug!(key, age_ms = age.num_milliseconds(), "cache entry expired");
      self.remove(key);
      return None;
    }

    Some(CacheHit {
      value: entry.data,
      stored_at: entry.stored_at,
    })
  }

  /// Store `value` under `key`, stamped with the current time.
  pub fn set<T: Serialize>(&self, key: &str, value: &T) {
    let entry = CacheEntry {
      data: value,
      stored_at: Utc::now(),
    };

    let raw = match serde_json::to_string(&entry) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(key, error = %e, "failed to serialize cache entry");
        return;
      }
    };

    if let Err(e) = self.backend.set(&Self::storage_key(key), &raw) {
      warn!(key, error = %e, "cache write failed, continuing uncached");
    }
  }

  pub fn remove(&self, key: &str) {
    if let Err(e) = self.backend.remove(&Self::storage_key(key)) {
      warn!(key, error = %e, "cache remove failed");
    }
  }

  /// Remove every cache entry. Other data in the backend is untouched.
  pub fn clear(&self) {
    let keys = match self.backend.keys_with_prefix(CACHE_PREFIX) {
      Ok(keys) => keys,
      Err(e) => {
        warn!(error = %e, "failed to list cache entries");
        return;
      }
    };

    for key in keys {
      if let Err(e) = self.backend.remove(&key) {
        warn!(key, error = %e, "cache remove failed");
      }
    }
  }
}
