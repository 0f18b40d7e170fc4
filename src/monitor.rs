//! Connectivity tracking and automatic queue replay.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::client::{Request, ResilientClient};
use crate::edge::{EdgeMessage, OFFLINE_HEADER};
use crate::queue::DrainSummary;

/// `tokio::time::interval` panics on a zero period.
const MIN_TICK: Duration = Duration::from_millis(1);

/// Watches connectivity and replays the offline queue when it returns.
pub struct NetworkMonitor {
  client: Arc<ResilientClient>,
  online: watch::Sender<bool>,
  has_pending: watch::Sender<bool>,
}

impl NetworkMonitor {
  /// Starts out assuming the network is up.
  pub fn new(client: Arc<ResilientClient>) -> Self {
    let (online, _) = watch::channel(true);
    let (has_pending, _) = watch::channel(!client.queue().is_empty());
    Self {
      client,
      online,
      has_pending,
    }
  }

  pub fn is_online(&self) -> bool {
    *self.online.borrow()
  }

  /// Receive every connectivity change.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.online.subscribe()
  }

  /// Whether queued writes are waiting, as of the last refresh.
  pub fn has_pending(&self) -> bool {
    *self.has_pending.borrow()
  }

  pub fn subscribe_pending(&self) -> watch::Receiver<bool> {
    self.has_pending.subscribe()
  }

  /// Record a connectivity signal.
  ///
  /// Drains the queue only when going from offline to online, and returns
  /// that drain's summary. Repeated signals of the same state do nothing.
  pub async fn set_online(&self, online: bool) -> Option<DrainSummary> {
    let was_online = self.online.send_replace(online);

    match (was_online, online) {
      (false, true) => {
        info!("network restored, replaying offline queue");
        let summary = self.client.sync_queue().await;
        self.refresh_pending();
        Some(summary)
      }
      (true, false) => {
        info!("network lost");
        None
      }
      _ => None,
    }
  }

  /// Re-read the queue length into the pending flag.
  pub fn refresh_pending(&self) -> bool {
    let pending = !self.client.queue().is_empty();
    self.has_pending.send_if_modified(|current| {
      let changed = *current != pending;
      *current = pending;
      changed
    });
    pending
  }

  /// Refresh the pending flag on a fixed interval. Never replays anything.
  pub fn spawn_pending_refresh(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
    let monitor = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every.max(MIN_TICK));
      loop {
        ticker.tick().await;
        monitor.refresh_pending();
      }
    })
  }

  /// Periodically GET `url` and feed the outcome into [`set_online`].
  ///
  /// Responses synthesized by the edge proxy count as offline.
  ///
  /// [`set_online`]: Self::set_online
  pub fn spawn_probe(self: &Arc<Self>, url: Url, every: Duration) -> JoinHandle<()> {
    let monitor = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every.max(MIN_TICK));
      loop {
        ticker.tick().await;
        let online = monitor.probe(&url).await;
        if let Some(summary) = monitor.set_online(online).await {
          debug!(?summary, "probe-triggered drain finished");
        }
      }
    })
  }

  async fn probe(&self, url: &Url) -> bool {
    match self.client.network().send(Request::get(url.clone())).await {
      Ok(response) => response.header(OFFLINE_HEADER).is_none(),
      Err(e) => {
        debug!(url = %url, error = %e, "probe failed");
        false
      }
    }
  }

  /// React to notices from the edge proxy until it goes away.
  pub fn spawn_notice_listener(
    self: &Arc<Self>,
    mut notices: broadcast::Receiver<EdgeMessage>,
  ) -> JoinHandle<()> {
    let monitor = Arc::clone(self);
    tokio::spawn(async move {
      loop {
        match notices.recv().await {
          Ok(EdgeMessage::ReplayQueue) => {
            info!("edge proxy requested queue replay");
            monitor.client.sync_queue().await;
            monitor.refresh_pending();
          }
          Ok(EdgeMessage::ForceActivate | EdgeMessage::ClearCaches | EdgeMessage::CacheUrls { .. }) => {
            debug!("ignoring proxy-bound message");
          }
          Err(broadcast::error::RecvError::Lagged(missed)) => {
            warn!(missed, "notice listener fell behind");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{LocalCache, MemoryBackend};
  use crate::client::net::testing::FakeNetwork;
  use crate::client::{Method, Response};
  use crate::queue::MutationQueue;

  struct Harness {
    monitor: Arc<NetworkMonitor>,
    network: Arc<FakeNetwork>,
    queue: Arc<MutationQueue>,
  }

  fn harness() -> Harness {
    let network = Arc::new(FakeNetwork::new());
    let backend = Arc::new(MemoryBackend::new());
    let queue = Arc::new(MutationQueue::new(backend.clone()));
    let client = ResilientClient::new(
      network.clone(),
      LocalCache::new(backend),
      queue.clone(),
      Url::parse("http://localhost:3000").unwrap(),
    );
    Harness {
      monitor: Arc::new(NetworkMonitor::new(Arc::new(client))),
      network,
      queue,
    }
  }

  fn replays(network: &FakeNetwork) -> usize {
    network
      .requests()
      .iter()
      .filter(|r| r.method == Method::Post)
      .count()
  }

  #[tokio::test]
  async fn test_starts_online() {
    let h = harness();
    assert!(h.monitor.is_online());
    assert!(*h.monitor.subscribe().borrow());
  }

  #[tokio::test]
  async fn test_drains_only_on_offline_to_online_edge() {
    let h = harness();
    h.network.route("/api/plans", Response::new(201, ""));
    h.queue.enqueue("/api/plans", Method::Post, Some("{}".into()));

    // online -> online
    assert!(h.monitor.set_online(true).await.is_none());
    assert_eq!(replays(&h.network), 0);

    assert!(h.monitor.set_online(false).await.is_none());
    assert!(h.monitor.set_online(false).await.is_none());
    assert!(!h.monitor.is_online());

    let summary = h.monitor.set_online(true).await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(replays(&h.network), 1);
    assert!(h.queue.is_empty());

    assert!(h.monitor.set_online(true).await.is_none());
    assert_eq!(replays(&h.network), 1);
  }

  #[tokio::test]
  async fn test_failed_drain_is_not_retried() {
    let h = harness();
    h.queue.enqueue("/api/plans", Method::Post, None);

    h.monitor.set_online(false).await;
    let summary = h.monitor.set_online(true).await.unwrap();

    assert_eq!(summary.remaining, 1);
    assert_eq!(replays(&h.network), 1);
    assert!(h.monitor.has_pending());
  }

  #[tokio::test]
  async fn test_subscribers_see_changes() {
    let h = harness();
    let mut rx = h.monitor.subscribe();

    h.monitor.set_online(false).await;
    rx.changed().await.unwrap();
    assert!(!*rx.borrow_and_update());
  }

  #[tokio::test]
  async fn test_refresh_pending_tracks_queue() {
    let h = harness();
    assert!(!h.monitor.refresh_pending());

    h.queue.enqueue("/api/forum", Method::Post, None);
    assert!(!h.monitor.has_pending());
    assert!(h.monitor.refresh_pending());
    assert!(h.monitor.has_pending());
  }

  #[tokio::test]
  async fn test_pending_refresh_never_replays() {
    let h = harness();
    h.queue.enqueue("/api/forum", Method::Post, None);
    let task = h.monitor.spawn_pending_refresh(Duration::from_millis(5));
    let mut pending = h.monitor.subscribe_pending();

    tokio::time::timeout(Duration::from_secs(1), pending.wait_for(|p| *p))
      .await
      .unwrap()
      .unwrap();
    task.abort();

    assert!(h.network.requests().is_empty());
  }

  #[tokio::test]
  async fn test_probe_detects_outage_and_recovery() {
    let h = harness();
    h.network.route("/api/health", Response::new(200, "ok"));
    h.network.route("/api/plans", Response::new(201, ""));
    h.queue.enqueue("/api/plans", Method::Post, None);
    assert!(h.monitor.refresh_pending());
    h.network.set_offline(true);

    let url = Url::parse("http://localhost:3000/api/health").unwrap();
    let task = h.monitor.spawn_probe(url, Duration::from_millis(5));
    let mut online = h.monitor.subscribe();

    tokio::time::timeout(Duration::from_secs(1), online.wait_for(|o| !*o))
      .await
      .unwrap()
      .unwrap();
    drop(online);

    h.network.set_offline(false);
    let mut pending = h.monitor.subscribe_pending();
    tokio::time::timeout(Duration::from_secs(1), pending.wait_for(|p| !*p))
      .await
      .unwrap()
      .unwrap();
    task.abort();

    assert!(h.queue.is_empty());
  }

  #[tokio::test]
  async fn test_zero_interval_loops_keep_running() {
    let h = harness();
    h.network.set_offline(true);
    h.queue.enqueue("/api/forum", Method::Post, None);

    let refresh = h.monitor.spawn_pending_refresh(Duration::ZERO);
    let probe = h
      .monitor
      .spawn_probe(Url::parse("http://localhost:3000/api/health").unwrap(), Duration::ZERO);
    let mut online = h.monitor.subscribe();
    let mut pending = h.monitor.subscribe_pending();

    tokio::time::timeout(Duration::from_secs(1), online.wait_for(|o| !*o))
      .await
      .unwrap()
      .unwrap();
    tokio::time::timeout(Duration::from_secs(1), pending.wait_for(|p| *p))
      .await
      .unwrap()
      .unwrap();

    assert!(!refresh.is_finished());
    assert!(!probe.is_finished());
    refresh.abort();
    probe.abort();
  }

  #[tokio::test]
  async fn test_synthesized_response_counts_as_offline() {
    let h = harness();
    h.network.route(
      "/api/health",
      Response::new(503, "").with_header(OFFLINE_HEADER, "1"),
    );
    let url = Url::parse("http://localhost:3000/api/health").unwrap();
    assert!(!h.monitor.probe(&url).await);

    h.network.route("/api/health", Response::new(500, ""));
    assert!(h.monitor.probe(&url).await);
  }

  #[tokio::test]
  async fn test_replay_notice_drains_queue() {
    let h = harness();
    h.network.route("/api/plans", Response::new(201, ""));
    h.queue.enqueue("/api/plans", Method::Post, None);

    let (tx, rx) = broadcast::channel(4);
    let task = h.monitor.spawn_notice_listener(rx);
    tx.send(EdgeMessage::ClearCaches).unwrap();
    tx.send(EdgeMessage::ReplayQueue).unwrap();
    drop(tx);
    task.await.unwrap();

    assert!(h.queue.is_empty());
    assert_eq!(replays(&h.network), 1);
  }
}
