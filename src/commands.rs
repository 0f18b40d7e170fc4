//! CLI subcommands and the wiring they share.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use lifelines::cache::{KvBackend, LocalCache, NoopBackend, SqliteBackend};
use lifelines::client::{HttpNetwork, Method, Network, RequestConfig, ResilientClient};
use lifelines::config::Config;
use lifelines::db::Database;
use lifelines::edge::{BucketStore, EdgeMessage, EdgeProxy, MemoryBuckets, SqliteBuckets};
use lifelines::monitor::NetworkMonitor;
use lifelines::queue::MutationQueue;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Everything a command needs, built once from the config.
pub struct Context {
  pub config: Config,
  pub client: Arc<ResilientClient>,
  pub proxy: Arc<EdgeProxy>,
}

impl Context {
  /// Wire storage, transport, edge proxy and client together.
  ///
  /// Storage problems are not fatal: the client keeps working without
  /// persistence. With `direct`, requests bypass the edge proxy.
  pub async fn build(config: Config, direct: bool) -> Result<Self> {
    let (backend, buckets): (Arc<dyn KvBackend>, Arc<dyn BucketStore>) =
      match Database::open(config.cache.database.as_deref()) {
        Ok(db) => {
          let db = Arc::new(db);
          (
            Arc::new(SqliteBackend::new(db.clone())),
            Arc::new(SqliteBuckets::new(db)),
          )
        }
        Err(e) => {
          warn!(error = %e, "local storage unavailable, running without persistence");
          (Arc::new(NoopBackend), Arc::new(MemoryBuckets::new()))
        }
      };

    let http: Arc<dyn Network> = Arc::new(HttpNetwork::new(config.timeout())?);

    // The app and its API share one origin
    let mut edge = config.edge.clone();
    edge.origin = config.api.base_url.clone();
    let proxy = Arc::new(EdgeProxy::new(edge, http.clone(), buckets)?);

    let network: Arc<dyn Network> = if direct {
      http
    } else {
      proxy.activate().await;
      proxy.clone()
    };

    let client = ResilientClient::new(
      network,
      LocalCache::new(backend.clone()),
      Arc::new(MutationQueue::new(backend)),
      config.base_url()?,
    )
    .with_default_max_age(config.max_age());

    Ok(Self {
      config,
      client: Arc::new(client),
      proxy,
    })
  }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let out = serde_json::to_string_pretty(value)
    .map_err(|e| eyre!("Failed to serialize output: {}", e))?;
  println!("{}", out);
  Ok(())
}

#[derive(Debug, Subcommand)]
pub enum Command {
  /// Read from the API, falling back to the local cache
  Fetch {
    /// API path or absolute URL
    path: String,
    /// Cache key to store under and fall back to
    #[arg(short, long)]
    key: Option<String>,
    /// Oldest acceptable cached copy, in seconds
    #[arg(long)]
    max_age: Option<i64>,
    /// Fail instead of serving cached data
    #[arg(long)]
    no_fallback: bool,
  },
  /// Write to the API, queueing the write if it fails
  Send {
    /// POST, PUT, PATCH or DELETE
    method: String,
    path: String,
    /// JSON body
    #[arg(short, long)]
    body: Option<String>,
    /// Fail instead of queueing
    #[arg(long)]
    no_queue: bool,
  },
  /// Inspect or replay the offline queue
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Inspect the local cache
  #[command(subcommand)]
  Cache(CacheCommand),
  /// Manage edge proxy buckets
  #[command(subcommand)]
  Edge(EdgeCommand),
  /// Track connectivity and replay the queue whenever the network returns
  Watch,
}

#[derive(Debug, Subcommand)]
pub enum QueueCommand {
  /// Show pending writes in replay order
  List,
  /// Replay pending writes now
  Drain,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
  /// Show a cached value if it is fresh enough
  Get {
    key: String,
    /// Oldest acceptable entry, in seconds
    #[arg(long)]
    max_age: Option<i64>,
  },
  /// Remove one entry
  Remove { key: String },
  /// Remove every cache entry (pending writes are kept)
  Clear,
}

#[derive(Debug, Subcommand)]
pub enum EdgeCommand {
  /// List buckets, marking those of the current version
  Buckets,
  /// Delete buckets left over from other versions
  Prune,
  /// Delete every bucket
  Clear,
  /// Precache the manifest, or the given URLs into the page bucket
  Warm { urls: Vec<String> },
}

impl Command {
  pub async fn execute(self, ctx: Context) -> Result<()> {
    match self {
      Command::Fetch {
        path,
        key,
        max_age,
        no_fallback,
      } => {
        let mut config = RequestConfig {
          cache_key: key,
          ..Default::default()
        };
        if let Some(secs) = max_age {
          config = config.with_max_age(chrono::Duration::seconds(secs));
        }
        if no_fallback {
          config = config.without_fallback();
        }
        let result = ctx.client.request::<Value>(&path, config).await;
        info!(path = %path, source = ?result.source(), "request finished");
        print_json(&result)
      }
      Command::Send {
        method,
        path,
        body,
        no_queue,
      } => {
        let method: Method = method.parse()?;
        if !method.is_write() {
          return Err(eyre!("Use `fetch` for GET requests"));
        }
        let body = body
          .map(|raw| serde_json::from_str::<Value>(&raw))
          .transpose()
          .map_err(|e| eyre!("Body is not valid JSON: {}", e))?;

        let mut config = RequestConfig::write(method, body);
        if no_queue {
          config = config.without_queue();
        }
        let result = ctx.client.request::<Value>(&path, config).await;
        info!(path = %path, source = ?result.source(), "request finished");
        print_json(&result)
      }
      Command::Queue(cmd) => cmd.execute(&ctx).await,
      Command::Cache(cmd) => cmd.execute(&ctx),
      Command::Edge(cmd) => cmd.execute(&ctx).await,
      Command::Watch => watch(ctx).await,
    }
  }
}

impl QueueCommand {
  async fn execute(self, ctx: &Context) -> Result<()> {
    match self {
      QueueCommand::List => print_json(&ctx.client.queue().peek_all()),
      QueueCommand::Drain => print_json(&ctx.client.sync_queue().await),
    }
  }
}

impl CacheCommand {
  fn execute(self, ctx: &Context) -> Result<()> {
    let cache = ctx.client.cache();
    match self {
      CacheCommand::Get { key, max_age } => {
        let max_age = max_age
          .map(chrono::Duration::seconds)
          .unwrap_or_else(|| ctx.config.max_age());
        match cache.get::<Value>(&key, max_age) {
          Some(hit) => print_json(&json!({
            "value": hit.value,
            "storedAt": hit.stored_at.to_rfc3339(),
          })),
          None => Err(eyre!("No fresh entry for {}", key)),
        }
      }
      CacheCommand::Remove { key } => {
        cache.remove(&key);
        Ok(())
      }
      CacheCommand::Clear => {
        cache.clear();
        Ok(())
      }
    }
  }
}

impl EdgeCommand {
  async fn execute(self, ctx: &Context) -> Result<()> {
    let proxy = &ctx.proxy;
    match self {
      EdgeCommand::Buckets => {
        let names: Vec<Value> = proxy
          .buckets()
          .bucket_names()?
          .into_iter()
          .map(|name| json!({ "current": proxy.names().contains(&name), "name": name }))
          .collect();
        print_json(&names)
      }
      EdgeCommand::Prune => print_json(&proxy.activate().await),
      EdgeCommand::Clear => {
        proxy.handle_message(EdgeMessage::ClearCaches).await;
        Ok(())
      }
      EdgeCommand::Warm { urls } => {
        if urls.is_empty() {
          let cached = proxy.install().await;
          proxy.activate().await;
          print_json(&json!({ "precached": cached }))
        } else {
          proxy.handle_message(EdgeMessage::CacheUrls { urls }).await;
          Ok(())
        }
      }
    }
  }
}

/// Run the monitor until interrupted.
async fn watch(ctx: Context) -> Result<()> {
  let monitor = Arc::new(NetworkMonitor::new(ctx.client.clone()));
  let settings = &ctx.config.monitor;

  let (messages, inbound) = mpsc::unbounded_channel();
  let tasks = vec![
    ctx.proxy.clone().spawn_message_loop(inbound),
    monitor.spawn_notice_listener(ctx.proxy.subscribe()),
    monitor.spawn_pending_refresh(Duration::from_secs(settings.pending_refresh_secs)),
    monitor.spawn_probe(
      ctx.config.probe_url()?,
      Duration::from_secs(settings.probe_interval_secs),
    ),
  ];

  let mut online = monitor.subscribe();
  let mut pending = monitor.subscribe_pending();
  info!(
    online = *online.borrow(),
    pending = *pending.borrow(),
    "watching connectivity, press Ctrl-C to stop"
  );

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      changed = online.changed() => {
        if changed.is_err() {
          break;
        }
        let now_online = *online.borrow_and_update();
        info!(online = now_online, "connectivity changed");
        if now_online {
          // Give the proxy a chance to refresh pages it serves offline
          let _ = messages.send(EdgeMessage::CacheUrls {
            urls: vec![ctx.config.edge.home_route.clone()],
          });
        }
      }
      changed = pending.changed() => {
        if changed.is_err() {
          break;
        }
        info!(pending = *pending.borrow_and_update(), "offline queue changed");
      }
    }
  }

  for task in tasks {
    task.abort();
  }
  ctx.proxy.settle().await;
  Ok(())
}
