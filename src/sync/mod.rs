//! Reconciliation between the durable queue and the server.
//!
//! The coordinator reacts to connectivity changes: going online confirms
//! reachability and then hands every unsent write to the sync engine; going
//! offline only pauses sending. While online it periodically re-submits
//! failed writes.

mod coordinator;
mod monitor;

pub use coordinator::{Coordinator, DrainReport};
pub use monitor::ConnectivityMonitor;

use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use url::Url;

use crate::cache::{CacheStorage, Interceptor};
use crate::http::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

impl Connectivity {
  pub fn is_online(self) -> bool {
    self == Connectivity::Online
  }
}

impl fmt::Display for Connectivity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Connectivity::Online => f.write_str("online"),
      Connectivity::Offline => f.write_str("offline"),
    }
  }
}

/// Checks whether the server can actually be reached.
pub trait ReachabilityProbe: Send + Sync {
  fn probe(&self) -> BoxFuture<'_, bool>;
}

/// Probes the server health endpoint with a HEAD request.
pub struct HttpProbe<S: CacheStorage> {
  interceptor: Arc<Interceptor<S>>,
  url: Url,
}

impl<S: CacheStorage> HttpProbe<S> {
  pub fn new(interceptor: Arc<Interceptor<S>>, url: Url) -> Self {
    Self { interceptor, url }
  }
}

impl<S: CacheStorage + 'static> ReachabilityProbe for HttpProbe<S> {
  fn probe(&self) -> BoxFuture<'_, bool> {
    Box::pin(async move {
      let request = Request::head(self.url.clone());
      match self.interceptor.fetch(&request).await {
        Ok(result) => result.data.is_success(),
        Err(e) => {
          tracing::debug!(url = %self.url, error = %e, "reachability probe failed");
          false
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::NoopStorage;
  use crate::config::Config;
  use crate::http::Response;
  use crate::test_support::ScriptedFetcher;

  fn probe(fetcher: Arc<ScriptedFetcher>) -> HttpProbe<NoopStorage> {
    let interceptor = Arc::new(Interceptor::new(&Config::default(), NoopStorage, fetcher).unwrap());
    HttpProbe::new(
      interceptor,
      Url::parse("http://localhost:3000/api/health").unwrap(),
    )
  }

  #[tokio::test]
  async fn test_http_probe_requires_success_status() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let probe = probe(fetcher.clone());

    fetcher.respond("/api/health", Response::new(200, ""));
    assert!(probe.probe().await);

    fetcher.respond("/api/health", Response::new(503, "maintenance"));
    assert!(!probe.probe().await);

    fetcher.fail("/api/health");
    assert!(!probe.probe().await);
    assert_eq!(fetcher.calls("/api/health"), 3);
  }
}
