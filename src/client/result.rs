//! Structured outcome of a resilient request.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result of [`ResilientClient::request`](super::ResilientClient::request).
///
/// Exactly one of these holds: fresh `data`, cached `data` (`is_cached`),
/// a deferred write (`queued`), or an `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResult<T> {
  pub data: Option<T>,
  pub error: Option<String>,
  /// The network could not be used for this request
  pub is_offline: bool,
  /// `data` came from the local cache
  pub is_cached: bool,
  /// When the cached `data` was stored
  pub cached_at: Option<DateTime<Utc>>,
  /// The write was queued for replay
  pub queued: bool,
}

impl<T> FetchResult<T> {
  /// Fresh data from the network. Writes may carry no body.
  pub fn from_network(data: Option<T>) -> Self {
    Self {
      data,
      error: None,
      is_offline: false,
      is_cached: false,
      cached_at: None,
      queued: false,
    }
  }

  /// Offline mode - network unavailable, serving cached data
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data: Some(data),
      error: None,
      is_offline: true,
      is_cached: true,
      cached_at: Some(cached_at),
      queued: false,
    }
  }

  /// Write deferred to the offline queue.
  pub fn queued() -> Self {
    Self {
      data: None,
      error: None,
      is_offline: true,
      is_cached: false,
      cached_at: None,
      queued: true,
    }
  }

  /// Hard failure with nothing to fall back on.
  pub fn failed(error: impl Into<String>, is_offline: bool) -> Self {
    Self {
      data: None,
      error: Some(error.into()),
      is_offline,
      is_cached: false,
      cached_at: None,
      queued: false,
    }
  }

  /// Neither fresh nor cached data, nor a deferral.
  pub fn is_error(&self) -> bool {
    self.error.is_some()
  }

  pub fn source(&self) -> FetchSource {
    if self.queued {
      FetchSource::Queued
    } else if self.error.is_some() {
      FetchSource::Failed
    } else if self.is_cached {
      FetchSource::Cache
    } else {
      FetchSource::Network
    }
  }
}

/// Indicates where the result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
  /// Fresh data from network
  Network,
  /// Offline mode, serving cached data
  Cache,
  /// Write deferred until the network is back
  Queued,
  /// Nothing to show
  Failed,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sources() {
    assert_eq!(FetchResult::from_network(Some(1)).source(), FetchSource::Network);
    assert_eq!(FetchResult::offline(1, Utc::now()).source(), FetchSource::Cache);
    assert_eq!(FetchResult::<i32>::queued().source(), FetchSource::Queued);
    assert_eq!(FetchResult::<i32>::failed("boom", true).source(), FetchSource::Failed);
  }

  #[test]
  fn test_serializes_camel_case_flags() {
    let value = serde_json::to_value(FetchResult::<i32>::queued()).unwrap();
    assert_eq!(value["isOffline"], true);
    assert_eq!(value["queued"], true);
    assert!(value["cachedAt"].is_null());
  }
}
