//! The edge cache proxy: a versioned, per-route caching layer beneath the app.

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::client::net::{CACHED_AT_HEADER, OFFLINE_HEADER, SERVED_FROM_HEADER};
use crate::client::{Network, Request, Response};

use super::background::BackgroundTasks;
use super::buckets::BucketStore;
use super::config::{BucketNames, EdgeConfig, Route};
use super::message::EdgeMessage;

const OFFLINE_PAGE: &str = "<!doctype html><html><head><title>Offline</title></head>\
<body><h1>You're offline</h1><p>Lifelines will reconnect automatically. \
Changes you make are saved and synced when you're back online.</p></body></html>";

/// Lifecycle of one deployed proxy version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
  Installing,
  /// Installed, waiting to take over
  Waiting,
  /// Intercepting requests
  Activated,
  /// Replaced by a newer version
  Superseded,
}

/// Versioned caching proxy in front of a [`Network`].
///
/// Only an activated proxy intercepts; in any other state requests go
/// straight to the network.
pub struct EdgeProxy {
  config: EdgeConfig,
  origin: Url,
  names: BucketNames,
  network: Arc<dyn Network>,
  buckets: Arc<dyn BucketStore>,
  state: Mutex<WorkerState>,
  notices: broadcast::Sender<EdgeMessage>,
  background: BackgroundTasks,
}

impl EdgeProxy {
  pub fn new(
    config: EdgeConfig,
    network: Arc<dyn Network>,
    buckets: Arc<dyn BucketStore>,
  ) -> Result<Self> {
    let origin = Url::parse(&config.origin)
      .map_err(|e| eyre!("Invalid edge origin {}: {}", config.origin, e))?;
    let names = config.bucket_names();
    let (notices, _) = broadcast::channel(16);

    Ok(Self {
      config,
      origin,
      names,
      network,
      buckets,
      state: Mutex::new(WorkerState::Installing),
      notices,
      background: BackgroundTasks::default(),
    })
  }

  pub fn state(&self) -> WorkerState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: WorkerState) {
    let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
    debug!(from = ?*current, to = ?state, "edge proxy state change");
    *current = state;
  }

  pub fn names(&self) -> &BucketNames {
    &self.names
  }

  pub fn buckets(&self) -> &Arc<dyn BucketStore> {
    &self.buckets
  }

  /// Pre-populate the static bucket from the manifest.
  ///
  /// Entries that fail to fetch are skipped. Returns how many were cached.
  pub async fn install(&self) -> usize {
    self.set_state(WorkerState::Installing);
    if let Err(e) = self.buckets.open(&self.names.static_assets) {
      warn!(error = %e, "failed to open static bucket");
    }

    let mut cached = 0;
    for route in &self.config.precache {
      if self.fetch_into(&self.names.static_assets, route).await {
        cached += 1;
      }
    }

    info!(
      version = %self.config.version,
      cached,
      manifest = self.config.precache.len(),
      "edge proxy installed"
    );
    self.set_state(WorkerState::Waiting);
    cached
  }

  /// Delete buckets from other versions and start intercepting.
  ///
  /// Returns the names of the deleted buckets.
  pub async fn activate(&self) -> Vec<String> {
    let existing = self.buckets.bucket_names().unwrap_or_else(|e| {
      warn!(error = %e, "failed to list buckets");
      Vec::new()
    });

    let mut deleted = Vec::new();
    for name in existing {
      if self.names.contains(&name) {
        continue;
      }
      match self.buckets.delete(&name) {
        Ok(_) => {
          info!(bucket = %name, "deleted stale bucket");
          deleted.push(name);
        }
        Err(e) => warn!(bucket = %name, error = %e, "failed to delete stale bucket"),
      }
    }

    self.set_state(WorkerState::Activated);
    info!(version = %self.config.version, "edge proxy activated");
    deleted
  }

  /// Install and activate in one go.
  pub async fn start(&self) {
    self.install().await;
    self.activate().await;
  }

  /// Stop intercepting because a newer version took over.
  pub fn retire(&self) {
    self.set_state(WorkerState::Superseded);
  }

  /// Receive notices meant for application instances.
  pub fn subscribe(&self) -> broadcast::Receiver<EdgeMessage> {
    self.notices.subscribe()
  }

  /// The environment granted a background-sync opportunity.
  ///
  /// Returns how many application instances were notified.
  pub fn on_sync(&self, tag: &str) -> usize {
    if tag != self.config.sync_tag {
      debug!(tag, "ignoring unknown sync tag");
      return 0;
    }
    // No subscribers is not an error
    self.notices.send(EdgeMessage::ReplayQueue).unwrap_or(0)
  }

  /// Handle a message from the application.
  pub async fn handle_message(&self, message: EdgeMessage) {
    match message {
      EdgeMessage::ForceActivate => {
        if self.state() == WorkerState::Waiting {
          self.activate().await;
        }
      }
      EdgeMessage::ClearCaches => self.clear_all(),
      EdgeMessage::CacheUrls { urls } => {
        if let Err(e) = self.buckets.open(&self.names.dynamic) {
          warn!(error = %e, "failed to open dynamic bucket");
        }
        for url in &urls {
          self.fetch_into(&self.names.dynamic, url).await;
        }
      }
      EdgeMessage::ReplayQueue => debug!("replay notices are for application instances"),
    }
  }

  /// Process inbound messages until every sender is dropped.
  pub fn spawn_message_loop(
    self: Arc<Self>,
    mut messages: mpsc::UnboundedReceiver<EdgeMessage>,
  ) -> JoinHandle<()> {
    tokio::spawn(async move {
      while let Some(message) = messages.recv().await {
        self.handle_message(message).await;
      }
    })
  }

  /// Wait for outstanding background refreshes.
  pub async fn settle(&self) {
    self.background.settle().await;
  }

  fn clear_all(&self) {
    let names = self.buckets.bucket_names().unwrap_or_else(|e| {
      warn!(error = %e, "failed to list buckets");
      Vec::new()
    });
    for name in names {
      if let Err(e) = self.buckets.delete(&name) {
        warn!(bucket = %name, error = %e, "failed to delete bucket");
      }
    }
    info!("all edge buckets cleared");
  }

  /// Fetch `target` (path or URL) and store it in `bucket` if it succeeds.
  async fn fetch_into(&self, bucket: &str, target: &str) -> bool {
    let url = match self.origin.join(target) {
      Ok(url) => url,
      Err(e) => {
        warn!(target, error = %e, "skipping unparseable URL");
        return false;
      }
    };

    match self.network.send(Request::get(url.clone())).await {
      Ok(response) if response.is_success() => {
        self.store(bucket, &url, &response);
        true
      }
      Ok(response) => {
        warn!(url = %url, status = response.status, "skipping uncacheable response");
        false
      }
      Err(e) => {
        warn!(url = %url, error = %e, "failed to fetch for cache");
        false
      }
    }
  }

  /// Intercept one request.
  ///
  /// Pass-through requests return the network's error as-is; every
  /// intercepted route always produces a response.
  pub async fn handle(&self, request: Request) -> Result<Response> {
    if self.state() != WorkerState::Activated {
      return self.network.send(request).await;
    }

    match self.config.classify(&self.origin, &request) {
      Route::PassThrough => self.network.send(request).await,
      Route::NeverCache => Ok(self.network_only(request).await),
      Route::Api => Ok(self.network_first_api(request).await),
      Route::Static => Ok(self.cache_first_static(request).await),
      Route::Page => Ok(self.network_first_page(request).await),
    }
  }

  async fn network_only(&self, request: Request) -> Response {
    let url = request.url.clone();
    match self.network.send(request).await {
      Ok(response) => response,
      Err(e) => {
        debug!(url = %url, error = %e, "never-cache route unreachable");
        unavailable("Service unavailable while offline")
      }
    }
  }

  async fn network_first_api(&self, request: Request) -> Response {
    let url = request.url.clone();
    match self.network.send(request).await {
      Ok(response) => {
        if response.is_success() {
          let stored = response
            .clone()
            .with_header(CACHED_AT_HEADER, Utc::now().to_rfc3339());
          self.store(&self.names.api, &url, &stored);
        }
        response
      }
      Err(e) => {
        debug!(url = %url, error = %e, "API unreachable, trying bucket");
        match self.lookup(&self.names.api, &url) {
          Some(cached) => mark_from_cache(cached),
          None => unavailable("Offline and no cached data available"),
        }
      }
    }
  }

  async fn cache_first_static(&self, request: Request) -> Response {
    let url = request.url.clone();

    if let Some(cached) = self.lookup(&self.names.static_assets, &url) {
      self.spawn_refresh(request);
      return cached;
    }

    match self.network.send(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(&self.names.static_assets, &url, &response);
        }
        response
      }
      Err(e) => {
        debug!(url = %url, error = %e, "static asset unavailable");
        Response::new(404, Vec::new()).with_header(OFFLINE_HEADER, "1")
      }
    }
  }

  fn spawn_refresh(&self, request: Request) {
    let network = Arc::clone(&self.network);
    let buckets = Arc::clone(&self.buckets);
    let bucket = self.names.static_assets.clone();
    let key = bucket_key(&request.url);

    self.background.spawn(async move {
      match network.send(request).await {
        Ok(response) if response.is_success() => {
          if let Err(e) = buckets.put(&bucket, &key, &response) {
            debug!(url = %key, error = %e, "background refresh not stored");
          }
        }
        Ok(response) => debug!(url = %key, status = response.status, "background refresh rejected"),
        Err(e) => debug!(url = %key, error = %e, "background refresh failed"),
      }
    });
  }

  async fn network_first_page(&self, request: Request) -> Response {
    let url = request.url.clone();
    match self.network.send(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(&self.names.dynamic, &url, &response);
        }
        response
      }
      Err(e) => {
        debug!(url = %url, error = %e, "page unreachable, trying buckets");
        if let Some(cached) = self.lookup(&self.names.dynamic, &url) {
          return cached;
        }
        for fallback in [self.config.home_route.as_str(), "/"] {
          if let Some(cached) = self.lookup_current(fallback) {
            return cached;
          }
        }
        Response::new(503, OFFLINE_PAGE)
          .with_header("content-type", "text/html; charset=utf-8")
          .with_header(OFFLINE_HEADER, "1")
      }
    }
  }

  /// Look `path` up in each of this version's buckets.
  fn lookup_current(&self, path: &str) -> Option<Response> {
    let url = self.origin.join(path).ok()?;
    self
      .names
      .all()
      .into_iter()
      .find_map(|bucket| self.lookup(bucket, &url))
  }

  fn lookup(&self, bucket: &str, url: &Url) -> Option<Response> {
    match self.buckets.lookup(bucket, &bucket_key(url)) {
      Ok(found) => found,
      Err(e) => {
        warn!(bucket, url = %url, error = %e, "bucket read failed");
        None
      }
    }
  }

  fn store(&self, bucket: &str, url: &Url, response: &Response) {
    if let Err(e) = self.buckets.put(bucket, &bucket_key(url), response) {
      warn!(bucket, url = %url, error = %e, "bucket write failed");
    }
  }
}

#[async_trait]
impl Network for EdgeProxy {
  async fn send(&self, request: Request) -> Result<Response> {
    self.handle(request).await
  }
}

/// Bucket key for a URL: the URL without its fragment.
fn bucket_key(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}

fn unavailable(message: &str) -> Response {
  Response::json(503, &json!({ "error": message, "offline": true })).with_header(OFFLINE_HEADER, "1")
}

/// Annotate a bucket hit as stale data served while offline.
fn mark_from_cache(mut response: Response) -> Response {
  let cached_at = response.header(CACHED_AT_HEADER).map(String::from);

  if let Ok(serde_json::Value::Object(mut body)) =
    serde_json::from_slice::<serde_json::Value>(&response.body)
  {
    body.insert("_offline".to_string(), json!(true));
    body.insert("_cachedAt".to_string(), json!(cached_at));
    response.body = serde_json::Value::Object(body).to_string().into_bytes();
  }

  response.with_header(SERVED_FROM_HEADER, "cache")
}
