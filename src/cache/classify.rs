//! Request classification: which caching strategy applies to a request.

use serde_json::Value;
use std::collections::BTreeMap;
use url::{Origin, Url};

use crate::config::{CacheConfig, ServerConfig};
use crate::http::{Method, Request};

/// Strategy chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Non-GET or cross-origin; not intercepted
  Passthrough,
  /// Script/style/image/font; cache-first
  StaticAsset,
  /// API route; network-first with cache fallback
  Api,
  /// Full-page load; network-first with offline page
  Navigation,
  /// Anything else; network-first with best-effort caching
  Other,
}

/// Classifies requests against the configured origin and route tables.
#[derive(Debug, Clone)]
pub struct Classifier {
  origin: Origin,
  api_prefix: String,
  static_suffixes: Vec<String>,
  cacheable_routes: Vec<String>,
  critical_reads: BTreeMap<String, Value>,
}

impl Classifier {
  pub fn new(origin: &Url, server: &ServerConfig, cache: &CacheConfig) -> Self {
    Self {
      origin: origin.origin(),
      api_prefix: server.api_prefix.clone(),
      static_suffixes: cache
        .static_suffixes
        .iter()
        .map(|s| s.to_ascii_lowercase())
        .collect(),
      cacheable_routes: cache.cacheable_routes.clone(),
      critical_reads: cache.critical_reads.clone(),
    }
  }

  /// Rules are evaluated in order; the first match wins.
  pub fn classify(&self, request: &Request) -> RequestClass {
    if request.method != Method::Get || request.url.origin() != self.origin {
      return RequestClass::Passthrough;
    }

    let path = request.url.path();
    let lower = path.to_ascii_lowercase();
    if self.static_suffixes.iter().any(|s| lower.ends_with(s)) {
      return RequestClass::StaticAsset;
    }

    if path.starts_with(&self.api_prefix) {
      return RequestClass::Api;
    }

    if request.navigate {
      return RequestClass::Navigation;
    }

    RequestClass::Other
  }

  /// Whether a successful response for this path may be kept for offline use.
  pub fn is_cacheable_route(&self, path: &str) -> bool {
    self.cacheable_routes.iter().any(|route| route_matches(route, path))
  }

  /// Default payload for a critical read, if the path is one.
  pub fn critical_default(&self, path: &str) -> Option<&Value> {
    self.critical_reads.get(path)
  }
}

/// A route matches itself and anything below it, but not siblings sharing a
/// prefix (`/api/entries` covers `/api/entries/42`, not `/api/entries-old`).
fn route_matches(route: &str, path: &str) -> bool {
  let route = route.trim_end_matches('/');
  match path.strip_prefix(route) {
    Some(rest) => rest.is_empty() || rest.starts_with('/'),
    None => false,
  }
}
