//! Messages exchanged between the application and the edge proxy.

use serde::{Deserialize, Serialize};

/// Every message either side can send.
///
/// The first three flow from the application to the proxy; `ReplayQueue`
/// flows from the proxy to every connected application instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EdgeMessage {
  /// Take over immediately instead of waiting; the caller reloads afterwards
  #[serde(rename = "SKIP_WAITING")]
  ForceActivate,
  /// Delete every bucket
  #[serde(rename = "CLEAR_CACHE")]
  ClearCaches,
  /// Fetch these URLs into the dynamic bucket
  #[serde(rename = "CACHE_URLS")]
  CacheUrls { urls: Vec<String> },
  /// Replay your offline queue now
  #[serde(rename = "SYNC_OFFLINE_QUEUE")]
  ReplayQueue,
}
