//! Request/response types and the network seam.
//!
//! A `Fetcher` resolves to `Ok(Response)` for every HTTP answer, including
//! error statuses; `Err` means no response was obtained at all.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl std::fmt::Display for Method {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  /// Full-page load rather than a subresource or API call
  pub navigate: bool,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
      navigate: false,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn head(url: Url) -> Self {
    Self::new(Method::Head, url)
  }

  pub fn navigation(url: Url) -> Self {
    Self {
      navigate: true,
      ..Self::get(url)
    }
  }

  pub fn post_json<T: Serialize>(url: Url, body: &T) -> Result<Self, FetchError> {
    let bytes = serde_json::to_vec(body).map_err(|e| FetchError::InvalidResponse(e.to_string()))?;
    Ok(
      Self {
        body: Some(bytes),
        ..Self::new(Method::Post, url)
      }
      .with_header("content-type", "application/json"),
    )
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_ascii_lowercase(), value.to_string()));
    self
  }

  /// Identity used for cache lookups.
  pub fn cache_identity(&self) -> String {
    format!("{} {}", self.method, self.url)
  }
}

/// A response, either from the network or reconstructed from cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    let mut response = Self::new(status, value.to_string());
    response
      .headers
      .push(("content-type".to_string(), "application/json".to_string()));
    response
  }

  pub fn html(status: u16, body: &str) -> Self {
    let mut response = Self::new(status, body);
    response
      .headers
      .push(("content-type".to_string(), "text/html; charset=utf-8".to_string()));
    response
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
    serde_json::from_slice(&self.body).map_err(|e| FetchError::InvalidResponse(e.to_string()))
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Performs network calls.
///
/// Object-safe so the interception layer and the batch sender can share one
/// boxed implementation, and tests can script responses.
pub trait Fetcher: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>>;
}

/// `Fetcher` backed by reqwest.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  timeout: Duration,
  token: Option<String>,
}

impl HttpFetcher {
  pub fn new(timeout: Duration, token: Option<String>) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| FetchError::Network(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      timeout,
      token,
    })
  }

  async fn execute(&self, request: &Request) -> Result<Response, FetchError> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| FetchError::Network(e.to_string()))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| {
      if e.is_timeout() {
        FetchError::Timeout(self.timeout)
      } else {
        FetchError::Network(e.to_string())
      }
    })?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::Network(format!("Failed to read body: {}", e)))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
    Box::pin(self.execute(request))
  }
}
