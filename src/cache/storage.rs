//! Key-value storage backends for the local cache and the offline queue.

use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::db::Database;

/// Trait for durable key-value backends.
///
/// Values are opaque strings (JSON in practice). Implementations return
/// errors freely; callers at the offline boundary decide how to degrade.
pub trait KvBackend: Send + Sync {
  /// Read a value.
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Write a value, replacing any previous one.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  /// Delete a value. Deleting a missing key is not an error.
  fn remove(&self, key: &str) -> Result<()>;

  /// List keys starting with `prefix`.
  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

  /// Whether writes survive a restart.
  fn is_durable(&self) -> bool {
    true
  }
}

/// Backend used when no durable storage is available.
/// All operations are no-ops.
pub struct NoopBackend;

impl KvBackend for NoopBackend {
  fn get(&self, _key: &str) -> Result<Option<String>> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &str, _value: &str) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn is_durable(&self) -> bool {
    false
  }
}

/// In-process backend with an optional byte quota.
#[derive(Default)]
pub struct MemoryBackend {
  entries: Mutex<BTreeMap<String, String>>,
  quota_bytes: Option<usize>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  /// Reject writes once the stored keys and values would exceed `bytes`.
  pub fn with_quota(mut self, bytes: usize) -> Self {
    self.quota_bytes = Some(bytes);
    self
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl KvBackend for MemoryBackend {
  fn get(&self, key: &str) -> Result<Option<String>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let mut entries = self.lock()?;

    if let Some(quota) = self.quota_bytes {
      let used: usize = entries
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| k.len() + v.len())
        .sum();
      if used + key.len() + value.len() > quota {
        return Err(eyre!("Storage quota of {} bytes exceeded", quota));
      }
    }

    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    Ok(
      self
        .lock()?
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect(),
    )
  }

  fn is_durable(&self) -> bool {
    false
  }
}

/// SQLite-backed key-value store.
pub struct SqliteBackend {
  db: Arc<Database>,
}

impl SqliteBackend {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Backend over a fresh in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    Ok(Self::new(Arc::new(Database::open_in_memory()?)))
  }
}

impl KvBackend for SqliteBackend {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare("SELECT value FROM kv_store WHERE key = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let mut rows = stmt
      .query(params![key])
      .map_err(|e| eyre!("Failed to read key {}: {}", key, e))?;

    match rows
      .next()
      .map_err(|e| eyre!("Failed to read key {}: {}", key, e))?
    {
      Some(row) => Ok(Some(
        row
          .get(0)
          .map_err(|e| eyre!("Failed to read value for {}: {}", key, e))?,
      )),
      None => Ok(None),
    }
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to store key {}: {}", key, e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self
      .db
      .conn()?
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete key {}: {}", key, e))?;

    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    let conn = self.db.conn()?;

    // substr avoids LIKE wildcards in prefixes such as "cache_"
    let mut stmt = conn
      .prepare("SELECT key FROM kv_store WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![prefix], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }
}
