//! Delivery of a batch of writes to the server.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

use crate::cache::{CacheStorage, Interceptor};
use crate::error::{is_terminal_status, FetchError};
use crate::http::Request;
use crate::queue::PendingWrite;

/// Server verdict for one item of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
  Accepted(serde_json::Value),
  Rejected { reason: String, retryable: bool },
}

impl ItemOutcome {
  pub fn retryable(reason: impl Into<String>) -> Self {
    ItemOutcome::Rejected {
      reason: reason.into(),
      retryable: true,
    }
  }

  pub fn terminal(reason: impl Into<String>) -> Self {
    ItemOutcome::Rejected {
      reason: reason.into(),
      retryable: false,
    }
  }
}

/// Sends batches of same-kind writes.
///
/// On success the returned outcomes correspond to `writes` by position.
pub trait BatchSender: Send + Sync {
  fn send<'a>(
    &'a self,
    resource_kind: &'a str,
    writes: &'a [PendingWrite],
  ) -> BoxFuture<'a, Result<Vec<ItemOutcome>, FetchError>>;
}

#[derive(Debug, Serialize)]
struct BatchBody<'a> {
  resource_kind: &'a str,
  items: Vec<BatchItem<'a>>,
}

#[derive(Debug, Serialize)]
struct BatchItem<'a> {
  /// Lets the server drop a write it has already applied
  idempotency_key: &'a str,
  created_at: String,
  payload: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct BatchReply {
  results: Vec<ItemReply>,
}

#[derive(Debug, Deserialize)]
struct ItemReply {
  ok: bool,
  #[serde(default)]
  data: serde_json::Value,
  #[serde(default)]
  error: Option<String>,
  /// Per-item HTTP-style status, used to tell final rejections from retryable ones
  #[serde(default)]
  status: Option<u16>,
}

impl From<ItemReply> for ItemOutcome {
  fn from(reply: ItemReply) -> Self {
    if reply.ok {
      return ItemOutcome::Accepted(reply.data);
    }
    let reason = reply
      .error
      .unwrap_or_else(|| "rejected by server".to_string());
    match reply.status {
      Some(status) if is_terminal_status(status) => ItemOutcome::terminal(reason),
      _ => ItemOutcome::retryable(reason),
    }
  }
}

/// Posts batches to the server's batch endpoint through the interception layer.
pub struct HttpBatchSender<S: CacheStorage> {
  interceptor: Arc<Interceptor<S>>,
  endpoint: Url,
}

impl<S: CacheStorage> HttpBatchSender<S> {
  pub fn new(interceptor: Arc<Interceptor<S>>, endpoint: Url) -> Self {
    Self {
      interceptor,
      endpoint,
    }
  }

  async fn post(
    &self,
    resource_kind: &str,
    writes: &[PendingWrite],
  ) -> Result<Vec<ItemOutcome>, FetchError> {
    let body = BatchBody {
      resource_kind,
      items: writes
        .iter()
        .map(|w| BatchItem {
          idempotency_key: &w.id,
          created_at: w.created_at.to_rfc3339(),
          payload: &w.payload,
        })
        .collect(),
    };

    let mut request = Request::post_json(self.endpoint.clone(), &body)?;
    if let [only] = writes {
      request = request.with_header("idempotency-key", &only.id);
    }

    let response = self.interceptor.fetch(&request).await?.data;
    if !response.is_success() {
      return Err(FetchError::Status {
        status: response.status,
        message: response.text(),
      });
    }

    let reply: BatchReply = response.parse_json()?;
    if reply.results.len() != writes.len() {
      return Err(FetchError::InvalidResponse(format!(
        "expected {} results, got {}",
        writes.len(),
        reply.results.len()
      )));
    }

    Ok(reply.results.into_iter().map(ItemOutcome::from).collect())
  }
}

impl<S: CacheStorage + 'static> BatchSender for HttpBatchSender<S> {
  fn send<'a>(
    &'a self,
    resource_kind: &'a str,
    writes: &'a [PendingWrite],
  ) -> BoxFuture<'a, Result<Vec<ItemOutcome>, FetchError>> {
    Box::pin(self.post(resource_kind, writes))
  }
}
