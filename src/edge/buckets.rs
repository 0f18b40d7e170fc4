//! Named response buckets owned by the edge proxy.

use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::client::Response;
use crate::db::Database;

/// Trait for bucket storage backends.
pub trait BucketStore: Send + Sync {
  /// Names of all existing buckets.
  fn bucket_names(&self) -> Result<Vec<String>>;

  /// Create a bucket if it does not exist.
  fn open(&self, bucket: &str) -> Result<()>;

  /// Delete a bucket and its entries. Returns whether it existed.
  fn delete(&self, bucket: &str) -> Result<bool>;

  /// Look up the response stored for `url`.
  fn lookup(&self, bucket: &str, url: &str) -> Result<Option<Response>>;

  /// Store a response for `url`, creating the bucket if needed.
  fn put(&self, bucket: &str, url: &str, response: &Response) -> Result<()>;
}

/// In-process buckets. Counts every operation.
#[derive(Default)]
pub struct MemoryBuckets {
  buckets: Mutex<BTreeMap<String, BTreeMap<String, Response>>>,
  operations: AtomicUsize,
}

impl MemoryBuckets {
  pub fn new() -> Self {
    Self::default()
  }

  /// Start with empty buckets of the given names.
  pub fn with_buckets(names: &[&str]) -> Self {
    let store = Self::new();
    {
      let mut buckets = store.buckets.lock().unwrap_or_else(|e| e.into_inner());
      for name in names {
        buckets.insert(name.to_string(), BTreeMap::new());
      }
    }
    store
  }

  /// Total operations performed so far.
  pub fn operations(&self) -> usize {
    self.operations.load(Ordering::SeqCst)
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, BTreeMap<String, Response>>>> {
    self.operations.fetch_add(1, Ordering::SeqCst);
    self
      .buckets
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl BucketStore for MemoryBuckets {
  fn bucket_names(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn open(&self, bucket: &str) -> Result<()> {
    self.lock()?.entry(bucket.to_string()).or_default();
    Ok(())
  }

  fn delete(&self, bucket: &str) -> Result<bool> {
    Ok(self.lock()?.remove(bucket).is_some())
  }

  fn lookup(&self, bucket: &str, url: &str) -> Result<Option<Response>> {
    Ok(
      self
        .lock()?
        .get(bucket)
        .and_then(|entries| entries.get(url))
        .cloned(),
    )
  }

  fn put(&self, bucket: &str, url: &str, response: &Response) -> Result<()> {
    self
      .lock()?
      .entry(bucket.to_string())
      .or_default()
      .insert(url.to_string(), response.clone());
    Ok(())
  }
}

/// SQLite-backed buckets.
pub struct SqliteBuckets {
  db: Arc<Database>,
}

impl SqliteBuckets {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// SHA256 hash for stable, fixed-length keys
  fn url_hash(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl BucketStore for SqliteBuckets {
  fn bucket_names(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare("SELECT name FROM edge_buckets ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn open(&self, bucket: &str) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO edge_buckets (name) VALUES (?)",
        params![bucket],
      )
      .map_err(|e| eyre!("Failed to create bucket {}: {}", bucket, e))?;

    Ok(())
  }

  fn delete(&self, bucket: &str) -> Result<bool> {
    let conn = self.db.conn()?;

    conn
      .execute("DELETE FROM edge_entries WHERE bucket = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete entries of bucket {}: {}", bucket, e))?;

    let removed = conn
      .execute("DELETE FROM edge_buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", bucket, e))?;

    Ok(removed > 0)
  }

  fn lookup(&self, bucket: &str, url: &str) -> Result<Option<Response>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body FROM edge_entries
         WHERE bucket = ? AND url_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>)> = stmt
      .query_row(params![bucket, Self::url_hash(url)], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })
      .ok();

    match row {
      Some((status, headers, body)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to decode cached headers for {}: {}", url, e))?;
        Ok(Some(Response {
          status,
          headers,
          body,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, bucket: &str, url: &str, response: &Response) -> Result<()> {
    self.open(bucket)?;

    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    self
      .db
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO edge_entries (bucket, url_hash, url, status, headers, body, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          bucket,
          Self::url_hash(url),
          url,
          response.status,
          headers,
          response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in bucket {}: {}", url, bucket, e))?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sqlite() -> SqliteBuckets {
    SqliteBuckets::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  #[test]
  fn test_sqlite_put_lookup_delete() {
    let buckets = sqlite();
    let response = Response::new(200, "body").with_header("x-cached-at", "t");

    buckets.put("app-v1-api", "http://h/api/plans", &response).unwrap();
    assert_eq!(buckets.bucket_names().unwrap(), vec!["app-v1-api".to_string()]);
    assert_eq!(
      buckets.lookup("app-v1-api", "http://h/api/plans").unwrap(),
      Some(response)
    );
    assert_eq!(buckets.lookup("app-v1-static", "http://h/api/plans").unwrap(), None);

    assert!(buckets.delete("app-v1-api").unwrap());
    assert!(!buckets.delete("app-v1-api").unwrap());
    assert!(buckets.bucket_names().unwrap().is_empty());
    assert_eq!(buckets.lookup("app-v1-api", "http://h/api/plans").unwrap(), None);
  }

  #[test]
  fn test_sqlite_put_overwrites() {
    let buckets = sqlite();
    buckets.put("b", "u", &Response::new(200, "old")).unwrap();
    buckets.put("b", "u", &Response::new(200, "new")).unwrap();
    assert_eq!(buckets.lookup("b", "u").unwrap().unwrap().body, b"new".to_vec());
  }

  #[test]
  fn test_sqlite_open_creates_empty_bucket() {
    let buckets = sqlite();
    buckets.open("empty").unwrap();
    buckets.open("empty").unwrap();
    assert_eq!(buckets.bucket_names().unwrap(), vec!["empty".to_string()]);
  }

  #[test]
  fn test_memory_counts_operations() {
    let buckets = MemoryBuckets::with_buckets(&["a"]);
    assert_eq!(buckets.operations(), 0);
    buckets.lookup("a", "u").unwrap();
    buckets.put("a", "u", &Response::new(200, "")).unwrap();
    assert_eq!(buckets.operations(), 2);
  }
}
