//! Edge proxy routing rules and bucket naming.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::client::{Method, Request};

/// Static routing rules for the edge proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
  /// Origin whose traffic is intercepted; other origins pass through
  pub origin: String,
  /// Bucket name prefix
  pub prefix: String,
  /// Deployed version, embedded in bucket names
  pub version: String,
  /// Routes fetched into the static bucket on install
  pub precache: Vec<String>,
  /// Path prefixes that must always hit the network
  pub never_cache: Vec<String>,
  /// Path prefixes served network-first from the API bucket
  pub cacheable_api: Vec<String>,
  /// File extensions served cache-first (without the dot)
  pub static_extensions: Vec<String>,
  /// Path prefixes served cache-first
  pub static_prefixes: Vec<String>,
  /// Page served when the requested page is not cached
  pub home_route: String,
  /// Background-sync tag that triggers a queue replay notice
  pub sync_tag: String,
}

impl Default for EdgeConfig {
  fn default() -> Self {
    let strings = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
    Self {
      origin: "http://localhost:3000".to_string(),
      prefix: "lifelines".to_string(),
      version: "v1".to_string(),
      precache: strings(&["/", "/home", "/offline", "/manifest.json"]),
      never_cache: strings(&["/api/auth", "/api/socket", "/api/telemetry", "/api/health"]),
      cacheable_api: strings(&[
        "/api/farms",
        "/api/plans",
        "/api/water-usage",
        "/api/marketplace",
        "/api/compost-sites",
        "/api/forum",
      ]),
      static_extensions: strings(&[
        "js", "css", "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "woff", "woff2", "ttf",
        "webmanifest",
      ]),
      static_prefixes: strings(&["/_next/static/", "/icons/", "/images/", "/fonts/"]),
      home_route: "/home".to_string(),
      sync_tag: "sync-offline-queue".to_string(),
    }
  }
}

/// The three bucket names of one deployed version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketNames {
  pub static_assets: String,
  pub dynamic: String,
  pub api: String,
}

impl BucketNames {
  pub fn new(prefix: &str, version: &str) -> Self {
    Self {
      static_assets: format!("{}-{}-static", prefix, version),
      dynamic: format!("{}-{}-dynamic", prefix, version),
      api: format!("{}-{}-api", prefix, version),
    }
  }

  pub fn all(&self) -> [&str; 3] {
    [
      self.static_assets.as_str(),
      self.dynamic.as_str(),
      self.api.as_str(),
    ]
  }

  pub fn contains(&self, name: &str) -> bool {
    self.all().contains(&name)
  }
}

/// Caching strategy chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not intercepted
  PassThrough,
  /// Network only, synthesized error when offline
  NeverCache,
  /// Network-first against the API bucket
  Api,
  /// Cache-first with background refresh
  Static,
  /// Network-first against the dynamic bucket, page fallbacks
  Page,
}

impl EdgeConfig {
  pub fn bucket_names(&self) -> BucketNames {
    BucketNames::new(&self.prefix, &self.version)
  }

  /// Pick the strategy for `request`.
  pub fn classify(&self, origin: &Url, request: &Request) -> Route {
    if request.method != Method::Get || request.url.origin() != origin.origin() {
      return Route::PassThrough;
    }

    let path = request.url.path();
    let has_prefix = |prefixes: &[String]| prefixes.iter().any(|p| path.starts_with(p.as_str()));

    if has_prefix(&self.never_cache) {
      Route::NeverCache
    } else if has_prefix(&self.cacheable_api) {
      Route::Api
    } else if self.is_static_asset(path) {
      Route::Static
    } else {
      Route::Page
    }
  }

  fn is_static_asset(&self, path: &str) -> bool {
    if self
      .static_prefixes
      .iter()
      .any(|p| path.starts_with(p.as_str()))
    {
      return true;
    }

    let file = path.rsplit('/').next().unwrap_or_default();
    match file.rsplit_once('.') {
      Some((stem, ext)) if !stem.is_empty() => self
        .static_extensions
        .iter()
        .any(|e| e.eq_ignore_ascii_case(ext)),
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn classify(method: Method, url: &str) -> Route {
    let config = EdgeConfig::default();
    let origin = Url::parse(&config.origin).unwrap();
    config.classify(&origin, &Request::new(method, Url::parse(url).unwrap()))
  }

  #[test]
  fn test_bucket_names_embed_version() {
    let names = BucketNames::new("app", "v2");
    assert_eq!(names.all(), ["app-v2-static", "app-v2-dynamic", "app-v2-api"]);
    assert!(names.contains("app-v2-api"));
    assert!(!names.contains("app-v1-api"));
  }

  #[test]
  fn test_non_get_passes_through() {
    assert_eq!(
      classify(Method::Post, "http://localhost:3000/api/plans"),
      Route::PassThrough
    );
  }

  #[test]
  fn test_other_origin_passes_through() {
    assert_eq!(
      classify(Method::Get, "https://tiles.example.org/map.png"),
      Route::PassThrough
    );
  }

  #[test]
  fn test_routes_by_path() {
    let base = "http://localhost:3000";
    assert_eq!(classify(Method::Get, &format!("{}/api/auth/session", base)), Route::NeverCache);
    assert_eq!(classify(Method::Get, &format!("{}/api/plans?user=1", base)), Route::Api);
    assert_eq!(classify(Method::Get, &format!("{}/_next/static/chunk", base)), Route::Static);
    assert_eq!(classify(Method::Get, &format!("{}/logo.SVG", base)), Route::Static);
    assert_eq!(classify(Method::Get, &format!("{}/marketplace", base)), Route::Page);
    assert_eq!(classify(Method::Get, &format!("{}/.env", base)), Route::Page);
  }
}
