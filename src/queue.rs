//! Durable queue of writes made while the network was unavailable.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::KvBackend;
use crate::client::Method;

/// Backend key holding the whole serialized queue.
pub const QUEUE_KEY: &str = "offline_queue";

/// A write waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
  pub id: Uuid,
  /// Path or absolute URL the write targets
  pub endpoint: String,
  pub method: Method,
  /// JSON payload, if any
  #[serde(default)]
  pub body: Option<String>,
  #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
  pub enqueued_at: DateTime<Utc>,
}

/// Counts from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainSummary {
  pub attempted: usize,
  pub succeeded: usize,
  pub remaining: usize,
  /// Another drain was already running
  pub skipped: bool,
}

/// Ordered, persisted list of pending writes.
pub struct MutationQueue {
  backend: Arc<dyn KvBackend>,
  /// Serializes read-modify-write of the stored list
  write_lock: Mutex<()>,
  draining: AtomicBool,
}

/// Clears the draining flag when a pass ends, however it ends.
struct DrainFlag<'a>(&'a AtomicBool);

impl Drop for DrainFlag<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

impl MutationQueue {
  pub fn new(backend: Arc<dyn KvBackend>) -> Self {
    Self {
      backend,
      write_lock: Mutex::new(()),
      draining: AtomicBool::new(false),
    }
  }

  /// Append a write. Never deduplicates.
  pub fn enqueue(&self, endpoint: &str, method: Method, body: Option<String>) -> QueuedMutation {
    let mutation = QueuedMutation {
      id: Uuid::new_v4(),
      endpoint: endpoint.to_string(),
      method,
      body,
      enqueued_at: Utc::now(),
    };

    let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
    let mut entries = self.load();
    entries.push(mutation.clone());
    self.store(&entries);

    info!(
      id = %mutation.id,
      endpoint = %mutation.endpoint,
      method = mutation.method.as_str(),
      pending = entries.len(),
      "queued offline mutation"
    );
    if !self.backend.is_durable() {
      warn!(id = %mutation.id, "offline queue is not persisted, write is lost on restart");
    }

    mutation
  }

  /// All pending writes in enqueue order.
  pub fn peek_all(&self) -> Vec<QueuedMutation> {
    self.load()
  }

  pub fn len(&self) -> usize {
    self.load().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Replay every pending write once.
  ///
  /// Replays start in enqueue order and run concurrently; each one's outcome
  /// is independent. Successful entries are removed, failed ones stay in
  /// place, and entries enqueued during the pass are kept for the next one.
  pub async fn drain<F, Fut>(&self, replay: F) -> DrainSummary
  where
    F: Fn(QueuedMutation) -> Fut,
    Fut: Future<Output = bool>,
  {
    if self.draining.swap(true, Ordering::AcqRel) {
      debug!("drain already in progress, skipping");
      return DrainSummary {
        remaining: self.len(),
        skipped: true,
        ..Default::default()
      };
    }
    let _flag = DrainFlag(&self.draining);

    let snapshot = self.load();
    if snapshot.is_empty() {
      return DrainSummary::default();
    }

    let outcomes = join_all(snapshot.iter().cloned().map(&replay)).await;

    let succeeded: HashSet<Uuid> = snapshot
      .iter()
      .zip(outcomes)
      .filter(|(_, ok)| *ok)
      .map(|(m, _)| m.id)
      .collect();

    let remaining = {
      let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
      let retained: Vec<QueuedMutation> = self
        .load()
        .into_iter()
        .filter(|m| !succeeded.contains(&m.id))
        .collect();
      self.store(&retained);
      retained.len()
    };

    let summary = DrainSummary {
      attempted: snapshot.len(),
      succeeded: succeeded.len(),
      remaining,
      skipped: false,
    };
    info!(
      attempted = summary.attempted,
      succeeded = summary.succeeded,
      remaining = summary.remaining,
      "offline queue drained"
    );

    summary
  }

  fn load(&self) -> Vec<QueuedMutation> {
    let raw = match self.backend.get(QUEUE_KEY) {
      Ok(Some(raw)) => raw,
      Ok(None) => return Vec::new(),
      Err(e) => {
        warn!(error = %e, "failed to read offline queue");
        return Vec::new();
      }
    };

    serde_json::from_str(&raw).unwrap_or_else(|e| {
      warn!(error = %e, "offline queue is corrupt, treating as empty");
      Vec::new()
    })
  }

  fn store(&self, entries: &[QueuedMutation]) {
    let result = if entries.is_empty() {
      self.backend.remove(QUEUE_KEY)
    } else {
      match serde_json::to_string(entries) {
        Ok(raw) => self.backend.set(QUEUE_KEY, &raw),
        Err(e) => {
          warn!(error = %e, "failed to serialize offline queue");
          return;
        }
      }
    };

    if let Err(e) = result {
      warn!(error = %e, "failed to persist offline queue");
    }
  }
}
