//! Request wrapper with read-through caching and write queuing.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Report, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::cache::LocalCache;
use crate::queue::{DrainSummary, MutationQueue, QueuedMutation};

use super::net::{
  Method, Network, Request, Response, CACHED_AT_HEADER, OFFLINE_HEADER, SERVED_FROM_HEADER,
};
use super::result::FetchResult;

/// Per-call options for [`ResilientClient::request`].
#[derive(Debug, Clone, PartialEq)]
pub struct RequestConfig {
  pub method: Method,
  pub body: Option<serde_json::Value>,
  /// Local cache key for reads; no key means no caching
  pub cache_key: Option<String>,
  /// Overrides the client's default freshness window
  pub max_age: Option<Duration>,
  pub use_cache_fallback: bool,
  pub queue_if_offline: bool,
}

impl Default for RequestConfig {
  fn default() -> Self {
    Self {
      method: Method::Get,
      body: None,
      cache_key: None,
      max_age: None,
      use_cache_fallback: true,
      queue_if_offline: true,
    }
  }
}

impl RequestConfig {
  /// A cached GET.
  pub fn read(cache_key: impl Into<String>) -> Self {
    Self {
      cache_key: Some(cache_key.into()),
      ..Default::default()
    }
  }

  /// A write that is queued if the network fails.
  pub fn write(method: Method, body: Option<serde_json::Value>) -> Self {
    Self {
      method,
      body,
      ..Default::default()
    }
  }

  pub fn with_max_age(mut self, max_age: Duration) -> Self {
    self.max_age = Some(max_age);
    self
  }

  pub fn without_fallback(mut self) -> Self {
    self.use_cache_fallback = false;
    self
  }

  pub fn without_queue(mut self) -> Self {
    self.queue_if_offline = false;
    self
  }
}

/// Why a network attempt did not produce usable data.
enum Failure {
  Unreachable(Report),
  /// The edge proxy could not reach the server and answered from a bucket
  Stale(Response),
  Status(u16),
  Decode(Report),
}

impl Failure {
  fn is_offline(&self) -> bool {
    matches!(self, Self::Unreachable(_) | Self::Stale(_))
  }
}

impl fmt::Display for Failure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Unreachable(e) => write!(f, "network unavailable: {}", e),
      Self::Stale(_) => write!(f, "network unavailable, edge proxy served a stored copy"),
      Self::Status(status) => write!(f, "server responded with status {}", status),
      Self::Decode(e) => write!(f, "{}", e),
    }
  }
}

/// Whether the edge proxy served this from a bucket instead of the server.
fn is_edge_copy(response: &Response) -> bool {
  response.header(SERVED_FROM_HEADER) == Some("cache")
}

/// Decode a bucket copy if it is no older than `max_age`.
///
/// Copies without a readable `x-cached-at` are unusable since their age is
/// unknown. The proxy's in-body `_offline`/`_cachedAt` markers are dropped.
fn edge_copy<T: DeserializeOwned>(
  response: &Response,
  max_age: Duration,
) -> Option<(T, DateTime<Utc>)> {
  let cached_at = response
    .header(CACHED_AT_HEADER)
    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())?
    .with_timezone(&Utc);

  if max_age <= Duration::zero() || Utc::now() - cached_at > max_age {
    return None;
  }

  let mut body: serde_json::Value = response.decode().ok()?;
  if let serde_json::Value::Object(fields) = &mut body {
    fields.remove("_offline");
    fields.remove("_cachedAt");
  }
  let data = serde_json::from_value(body).ok()?;
  Some((data, cached_at))
}

/// Client for the app's API that keeps working offline.
///
/// Reads fall back to the local cache, writes fall back to the offline
/// queue. `request` never returns an error; every outcome is a
/// [`FetchResult`].
#[derive(Clone)]
pub struct ResilientClient {
  network: Arc<dyn Network>,
  cache: LocalCache,
  queue: Arc<MutationQueue>,
  base_url: Url,
  default_max_age: Duration,
}

impl ResilientClient {
  pub fn new(
    network: Arc<dyn Network>,
    cache: LocalCache,
    queue: Arc<MutationQueue>,
    base_url: Url,
  ) -> Self {
    Self {
      network,
      cache,
      queue,
      base_url,
      default_max_age: Duration::hours(24),
    }
  }

  /// Set the freshness window used when a request does not specify one.
  pub fn with_default_max_age(mut self, max_age: Duration) -> Self {
    self.default_max_age = max_age;
    self
  }

  pub fn network(&self) -> &Arc<dyn Network> {
    &self.network
  }

  pub fn cache(&self) -> &LocalCache {
    &self.cache
  }

  pub fn queue(&self) -> &Arc<MutationQueue> {
    &self.queue
  }

  /// Resolve a path against the API base URL; absolute URLs pass through.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    match Url::parse(url) {
      Ok(absolute) => Ok(absolute),
      Err(url::ParseError::RelativeUrlWithoutBase) => self
        .base_url
        .join(url)
        .map_err(|e| eyre!("Invalid request path {}: {}", url, e)),
      Err(e) => Err(eyre!("Invalid request URL {}: {}", url, e)),
    }
  }

  /// Issue one logical request.
  pub async fn request<T>(&self, url: &str, config: RequestConfig) -> FetchResult<T>
  where
    T: Serialize + DeserializeOwned,
  {
    let target = match self.resolve(url) {
      Ok(target) => target,
      Err(e) => return FetchResult::failed(e.to_string(), false),
    };

    let body = config.body.as_ref().map(|b| b.to_string());
    let mut request = Request::new(config.method, target);
    if let Some(body) = body.clone() {
      request = request.with_json_body(body);
    }

    let outcome = self.network.send(request).await;

    if config.method.is_write() {
      self.finish_write(url, &config, body, outcome)
    } else {
      self.finish_read(url, &config, outcome)
    }
  }

  fn finish_read<T>(
    &self,
    url: &str,
    config: &RequestConfig,
    outcome: Result<Response>,
  ) -> FetchResult<T>
  where
    T: Serialize + DeserializeOwned,
  {
    let failure = match outcome {
      Ok(response) if response.header(OFFLINE_HEADER).is_some() => Failure::Unreachable(eyre!(
        "edge proxy answered offline with status {}",
        response.status
      )),
      Ok(response) if response.is_success() && is_edge_copy(&response) => Failure::Stale(response),
      Ok(response) if response.is_success() => match response.decode::<T>() {
        Ok(data) => {
          if let Some(key) = &config.cache_key {
            self.cache.set(key, &data);
          }
          return FetchResult::from_network(Some(data));
        }
        Err(e) => Failure::Decode(e),
      },
      Ok(response) => Failure::Status(response.status),
      Err(e) => Failure::Unreachable(e),
    };

    warn!(url, reason = %failure, "read failed");

    if !config.use_cache_fallback {
      return FetchResult::failed(failure.to_string(), failure.is_offline());
    }

    let max_age = config.max_age.unwrap_or(self.default_max_age);

    if let Some(key) = &config.cache_key {
      if let Some(hit) = self.cache.get::<T>(key, max_age) {
        debug!(url, key, cached_at = %hit.stored_at, "serving cached data");
        return FetchResult::offline(hit.value, hit.stored_at);
      }
    }

    if let Failure::Stale(response) = &failure {
      if let Some((data, cached_at)) = edge_copy::<T>(response, max_age) {
        debug!(url, cached_at = %cached_at, "serving edge proxy copy");
        return FetchResult::offline(data, cached_at);
      }
    }

    FetchResult::failed(
      format!("{} and no cached data is available", failure),
      failure.is_offline(),
    )
  }

  fn finish_write<T>(
    &self,
    url: &str,
    config: &RequestConfig,
    body: Option<String>,
    outcome: Result<Response>,
  ) -> FetchResult<T>
  where
    T: DeserializeOwned,
  {
    let failure = match outcome {
      // Writes often answer with an empty body
      Ok(response) if response.is_success() => {
        return FetchResult::from_network(response.decode::<T>().ok());
      }
      Ok(response) => Failure::Status(response.status),
      Err(e) => Failure::Unreachable(e),
    };

    if config.queue_if_offline {
      warn!(url, reason = %failure, "write failed, deferring to offline queue");
      self.queue.enqueue(url, config.method, body);
      return FetchResult::queued();
    }

    warn!(url, reason = %failure, "write failed");
    FetchResult::failed(failure.to_string(), failure.is_offline())
  }

  /// Replay the offline queue through this client's network.
  pub async fn sync_queue(&self) -> DrainSummary {
    self.queue.drain(|mutation| self.replay(mutation)).await
  }

  async fn replay(&self, mutation: QueuedMutation) -> bool {
    let target = match self.resolve(&mutation.endpoint) {
      Ok(target) => target,
      Err(e) => {
        warn!(id = %mutation.id, error = %e, "cannot replay queued mutation");
        return false;
      }
    };

    let mut request = Request::new(mutation.method, target);
    if let Some(body) = mutation.body {
      request = request.with_json_body(body);
    }

    match self.network.send(request).await {
      Ok(response) if response.is_success() => {
        debug!(id = %mutation.id, "replayed queued mutation");
        true
      }
      Ok(response) => {
        debug!(id = %mutation.id, status = response.status, "replay rejected");
        false
      }
      Err(e) => {
        debug!(id = %mutation.id, error = %e, "replay failed");
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheEntry, KvBackend, MemoryBackend, CACHE_PREFIX};
  use crate::client::net::testing::FakeNetwork;
  use crate::edge::{EdgeConfig, EdgeProxy, MemoryBuckets};
  use serde_json::{json, Value};

  struct Harness {
    client: ResilientClient,
    network: Arc<FakeNetwork>,
    backend: Arc<MemoryBackend>,
  }

  fn harness() -> Harness {
    let network = Arc::new(FakeNetwork::new());
    let backend = Arc::new(MemoryBackend::new());
    let client = ResilientClient::new(
      network.clone(),
      LocalCache::new(backend.clone()),
      Arc::new(MutationQueue::new(backend.clone())),
      Url::parse("http://localhost:3000").unwrap(),
    );
    Harness {
      client,
      network,
      backend,
    }
  }

  fn ok_json(value: Value) -> Response {
    Response::json(200, &value)
  }

  #[tokio::test]
  async fn test_read_success_populates_cache() {
    let h = harness();
    h.network.route("/api/farm", ok_json(json!({"acres": 2})));

    let result: FetchResult<Value> = h
      .client
      .request("/api/farm", RequestConfig::read("farm_profile"))
      .await;

    assert_eq!(result.data, Some(json!({"acres": 2})));
    assert!(!result.is_cached);
    let hit = h
      .client
      .cache()
      .get::<Value>("farm_profile", Duration::minutes(1))
      .unwrap();
    assert_eq!(hit.value, json!({"acres": 2}));
  }

  #[tokio::test]
  async fn test_read_failure_serves_cache_with_original_timestamp() {
    let h = harness();
    let stored_at =
      DateTime::<Utc>::from_timestamp_millis(Utc::now().timestamp_millis() - 120_000).unwrap();
    let entry = CacheEntry {
      data: json!({"name": "north plot"}),
      stored_at,
    };
    h.backend
      .set(
        &format!("{}farm_profile", CACHE_PREFIX),
        &serde_json::to_string(&entry).unwrap(),
      )
      .unwrap();
    h.network.set_offline(true);

    let result: FetchResult<Value> = h
      .client
      .request(
        "/api/farm",
        RequestConfig::read("farm_profile").with_max_age(Duration::minutes(10)),
      )
      .await;

    assert!(result.is_cached);
    assert!(result.is_offline);
    assert_eq!(result.cached_at, Some(stored_at));
    assert_eq!(result.data, Some(json!({"name": "north plot"})));
    assert!(result.error.is_none());
  }

  #[tokio::test]
  async fn test_non_2xx_uses_fallback_path() {
    let h = harness();
    h.client.cache().set("plans", &json!([1]));
    h.network.route("/api/plans", Response::json(500, &json!({"error": "db down"})));

    let result: FetchResult<Value> = h
      .client
      .request("/api/plans", RequestConfig::read("plans"))
      .await;

    assert!(result.is_cached);
    assert_eq!(result.data, Some(json!([1])));
    assert!(result.error.is_none());
  }

  #[tokio::test]
  async fn test_undecodable_body_uses_fallback_path() {
    let h = harness();
    h.client.cache().set("listings", &vec![1, 2]);
    h.network.route("/api/marketplace", Response::new(200, "<html>"));

    let result: FetchResult<Vec<i32>> = h
      .client
      .request("/api/marketplace", RequestConfig::read("listings"))
      .await;

    assert_eq!(result.data, Some(vec![1, 2]));
    assert!(result.is_cached);
  }

  #[tokio::test]
  async fn test_read_failure_without_cache_is_error() {
    let h = harness();
    h.network.set_offline(true);

    let result: FetchResult<Value> = h
      .client
      .request("/api/forum", RequestConfig::read("forum"))
      .await;

    assert!(result.data.is_none());
    assert!(result.is_error());
    assert!(result.is_offline);
    assert!(!result.is_cached);
  }

  #[tokio::test]
  async fn test_fallback_disabled_ignores_cache() {
    let h = harness();
    h.client.cache().set("forum", &json!([]));
    h.network.set_offline(true);

    let result: FetchResult<Value> = h
      .client
      .request("/api/forum", RequestConfig::read("forum").without_fallback())
      .await;

    assert!(result.is_error());
    assert!(result.data.is_none());
  }

  #[tokio::test]
  async fn test_write_failure_is_queued() {
    let h = harness();
    h.network.set_offline(true);

    let result: FetchResult<Value> = h
      .client
      .request(
        "/api/compost",
        RequestConfig::write(Method::Post, Some(json!({"site": "A"}))),
      )
      .await;

    assert!(result.queued);
    assert!(result.error.is_none());
    let queued = h.client.queue().peek_all();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].endpoint, "/api/compost");
    assert_eq!(queued[0].method, Method::Post);
    assert_eq!(queued[0].body.as_deref(), Some(r#"{"site":"A"}"#));
  }

  #[tokio::test]
  async fn test_write_failure_without_queue_returns_error() {
    let h = harness();
    h.network.set_offline(true);

    let result: FetchResult<Value> = h
      .client
      .request(
        "/api/compost",
        RequestConfig::write(Method::Post, Some(json!({}))).without_queue(),
      )
      .await;

    assert!(result.data.is_none());
    assert!(!result.error.as_deref().unwrap_or_default().is_empty());
    assert!(h.client.queue().is_empty());
  }

  #[tokio::test]
  async fn test_write_is_always_attempted_first() {
    let h = harness();
    h.network.route("/api/trades", Response::new(204, ""));

    let result: FetchResult<Value> = h
      .client
      .request("/api/trades", RequestConfig::write(Method::Put, None))
      .await;

    assert_eq!(h.network.requests().len(), 1);
    assert!(result.data.is_none());
    assert!(result.error.is_none());
    assert!(!result.queued);
  }

  #[tokio::test]
  async fn test_sync_queue_replays_and_prunes() {
    let h = harness();
    h.network.set_offline(true);
    for path in ["/api/forum", "/api/missing"] {
      let _: FetchResult<Value> = h
        .client
        .request(path, RequestConfig::write(Method::Post, Some(json!({}))))
        .await;
    }
    assert_eq!(h.client.queue().len(), 2);

    h.network.set_offline(false);
    h.network.route("/api/forum", Response::new(201, "{}"));

    let summary = h.client.sync_queue().await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.remaining, 1);
    assert_eq!(h.client.queue().peek_all()[0].endpoint, "/api/missing");
  }

  #[test]
  fn test_resolve_relative_and_absolute() {
    let h = harness();
    assert_eq!(
      h.client.resolve("/api/water").unwrap().as_str(),
      "http://localhost:3000/api/water"
    );
    assert_eq!(
      h.client.resolve("https://example.org/x").unwrap().as_str(),
      "https://example.org/x"
    );
  }

  /// Client layered over an activated edge proxy, as the CLI wires it.
  async fn over_proxy() -> (ResilientClient, Arc<FakeNetwork>) {
    let network = Arc::new(FakeNetwork::new());
    let proxy = EdgeProxy::new(
      EdgeConfig::default(),
      network.clone(),
      Arc::new(MemoryBuckets::new()),
    )
    .unwrap();
    proxy.activate().await;

    let backend = Arc::new(MemoryBackend::new());
    let client = ResilientClient::new(
      Arc::new(proxy),
      LocalCache::new(backend.clone()),
      Arc::new(MutationQueue::new(backend)),
      Url::parse("http://localhost:3000").unwrap(),
    );
    (client, network)
  }

  #[tokio::test]
  async fn test_bucket_copy_is_reported_offline_and_not_restamped() {
    let (client, network) = over_proxy().await;
    network.route("/api/plans", ok_json(json!({"beds": 3})));

    let fresh: FetchResult<Value> = client.request("/api/plans", RequestConfig::read("plans")).await;
    assert!(!fresh.is_cached);
    client.cache().remove("plans");

    network.set_offline(true);
    let result: FetchResult<Value> = client.request("/api/plans", RequestConfig::read("plans")).await;

    assert_eq!(result.data, Some(json!({"beds": 3})));
    assert!(result.is_cached);
    assert!(result.is_offline);
    assert!(result.cached_at.is_some());
    assert!(client
      .cache()
      .get::<Value>("plans", Duration::days(1))
      .is_none());
  }

  #[tokio::test]
  async fn test_local_cache_wins_over_bucket_copy() {
    let (client, network) = over_proxy().await;
    network.route("/api/farms", ok_json(json!({"id": 7})));
    let _: FetchResult<Value> = client.request("/api/farms", RequestConfig::read("farm")).await;
    let stored = client
      .cache()
      .get::<Value>("farm", Duration::days(1))
      .unwrap()
      .stored_at;

    network.set_offline(true);
    let result: FetchResult<Value> = client.request("/api/farms", RequestConfig::read("farm")).await;

    assert_eq!(result.data, Some(json!({"id": 7})));
    assert_eq!(result.cached_at, Some(stored));
    let after = client.cache().get::<Value>("farm", Duration::days(1)).unwrap();
    assert_eq!(after.stored_at, stored);
    assert_eq!(after.value, json!({"id": 7}));
  }

  #[tokio::test]
  async fn test_bucket_copy_respects_max_age() {
    let (client, network) = over_proxy().await;
    network.route("/api/plans", ok_json(json!({"beds": 3})));
    let _: FetchResult<Value> = client.request("/api/plans", RequestConfig::default()).await;

    network.set_offline(true);
    let result: FetchResult<Value> = client
      .request("/api/plans", RequestConfig::default().with_max_age(Duration::zero()))
      .await;

    assert!(result.is_error());
    assert!(result.is_offline);
  }

  #[tokio::test]
  async fn test_synthesized_miss_is_offline() {
    let (client, network) = over_proxy().await;
    network.set_offline(true);

    let result: FetchResult<Value> = client.request("/api/marketplace", RequestConfig::read("market")).await;

    assert!(result.is_error());
    assert!(result.is_offline);
    assert!(result.data.is_none());
  }
}
