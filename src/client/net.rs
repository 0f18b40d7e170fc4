//! Transport-neutral request/response types and the HTTP transport.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// HTTP verbs used by the app's API routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
    }
  }

  /// Anything but GET changes server state.
  pub fn is_write(&self) -> bool {
    !matches!(self, Self::Get)
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Self::Get),
      "POST" => Ok(Self::Post),
      "PUT" => Ok(Self::Put),
      "PATCH" => Ok(Self::Patch),
      "DELETE" => Ok(Self::Delete),
      other => Err(eyre!("Unsupported method: {}", other)),
    }
  }
}

impl From<Method> for reqwest::Method {
  fn from(method: Method) -> Self {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

/// An outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  /// Lowercased header names
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  /// Attach a JSON body.
  pub fn with_json_body(mut self, body: String) -> Self {
    self
      .headers
      .insert("content-type".to_string(), "application/json".to_string());
    self.body = Some(body);
    self
  }
}

/// Header carrying the time a cached response was originally fetched.
pub const CACHED_AT_HEADER: &str = "x-cached-at";
/// Header marking a response served from an edge bucket after a network failure.
pub const SERVED_FROM_HEADER: &str = "x-served-from";
/// Header marking responses the edge proxy made up itself.
pub const OFFLINE_HEADER: &str = "x-lifelines-offline";

/// A received (or synthesized) response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  /// Lowercased header names
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  /// JSON response with the matching content type.
  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self::new(status, value.to_string()).with_header("content-type", "application/json")
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// 2xx
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Decode the body as JSON.
  pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_slice(&self.body)
      .map_err(|e| eyre!("Failed to decode response body: {}", e))
  }
}

/// Something that can carry a request to the server.
///
/// `Err` means the request never produced a response. Non-2xx responses
/// are `Ok`; callers decide what counts as failure.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  async fn send(&self, request: Request) -> Result<Response>;
}

#[async_trait]
impl<T: Network + ?Sized> Network for Arc<T> {
  async fn send(&self, request: Request) -> Result<Response> {
    (**self).send(request).await
  }
}

/// Network backed by a `reqwest` client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("lifelines/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn send(&self, request: Request) -> Result<Response> {
    let url = request.url.clone();
    let mut builder = self.client.request(request.method.into(), request.url);

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
      builder = builder.body(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response from {}: {}", url, e))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

#[cfg(test)]
pub(crate) mod testing {
  //! Scripted network for tests.

  use super::*;
  use std::collections::HashMap;
  use std::sync::Mutex;

  /// Replies from a fixed table keyed by URL path; unknown paths fail.
  #[derive(Default)]
  pub struct FakeNetwork {
    routes: Mutex<HashMap<String, Response>>,
    offline: std::sync::atomic::AtomicBool,
    requests: Mutex<Vec<Request>>,
  }

  impl FakeNetwork {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn route(&self, path: &str, response: Response) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(path.to_string(), response);
    }

    pub fn set_offline(&self, offline: bool) {
      self
        .offline
        .store(offline, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<Request> {
      self.requests.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl Network for FakeNetwork {
    async fn send(&self, request: Request) -> Result<Response> {
      self.requests.lock().unwrap().push(request.clone());
      if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
        return Err(eyre!("network unreachable"));
      }
      self
        .routes
        .lock()
        .unwrap()
        .get(request.url.path())
        .cloned()
        .ok_or_else(|| eyre!("connection refused for {}", request.url))
    }
  }
}
