//! Request/response messaging between tasks.
//!
//! A call sends a request tagged with a correlation id and waits for the
//! matching reply, giving up after a timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
  /// The serving side has gone away.
  #[error("rpc channel closed")]
  Closed,

  /// No reply arrived in time.
  #[error("rpc call {id} timed out after {timeout:?}")]
  Timeout { id: u64, timeout: Duration },

  /// The server dropped the request without replying.
  #[error("rpc call {0} dropped without reply")]
  Dropped(u64),
}

/// A request delivered to the serving side.
#[derive(Debug)]
pub struct Envelope<Req, Resp> {
  pub id: u64,
  pub request: Req,
  reply: oneshot::Sender<Resp>,
}

impl<Req, Resp> Envelope<Req, Resp> {
  /// Answer the request. Returns `false` if the caller stopped waiting.
  pub fn reply(self, response: Resp) -> bool {
    self.reply.send(response).is_ok()
  }
}

/// Calling side of an RPC channel.
pub struct RpcClient<Req, Resp> {
  tx: mpsc::Sender<Envelope<Req, Resp>>,
  next_id: Arc<AtomicU64>,
  timeout: Duration,
}

impl<Req, Resp> Clone for RpcClient<Req, Resp> {
  fn clone(&self) -> Self {
    Self {
      tx: self.tx.clone(),
      next_id: Arc::clone(&self.next_id),
      timeout: self.timeout,
    }
  }
}

/// Create a channel; the receiver goes to the task that serves requests.
pub fn channel<Req, Resp>(
  capacity: usize,
  timeout: Duration,
) -> (RpcClient<Req, Resp>, mpsc::Receiver<Envelope<Req, Resp>>) {
  let (tx, rx) = mpsc::channel(capacity);
  (
    RpcClient {
      tx,
      next_id: Arc::new(AtomicU64::new(1)),
      timeout,
    },
    rx,
  )
}

impl<Req, Resp> RpcClient<Req, Resp> {
  pub async fn call(&self, request: Req) -> Result<Resp, RpcError> {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let (reply, rx) = oneshot::channel();

    self
      .tx
      .send(Envelope { id, request, reply })
      .await
      .map_err(|_| RpcError::Closed)?;

    match tokio::time::timeout(self.timeout, rx).await {
      Ok(Ok(response)) => Ok(response),
      Ok(Err(_)) => Err(RpcError::Dropped(id)),
      Err(_) => Err(RpcError::Timeout {
        id,
        timeout: self.timeout,
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_call_gets_correlated_reply() {
    let (client, mut rx) = channel::<u32, u32>(4, Duration::from_secs(1));
    tokio::spawn(async move {
      while let Some(envelope) = rx.recv().await {
        let value = envelope.request * 2;
        envelope.reply(value);
      }
    });

    assert_eq!(client.call(21).await.unwrap(), 42);
    assert_eq!(client.clone().call(5).await.unwrap(), 10);
  }

  #[tokio::test(start_paused = true)]
  async fn test_call_times_out() {
    let (client, mut rx) = channel::<(), ()>(4, Duration::from_millis(50));
    let server = tokio::spawn(async move {
      // Hold the envelope without replying
      let envelope = rx.recv().await;
      tokio::time::sleep(Duration::from_secs(10)).await;
      drop(envelope);
    });

    let result = client.call(()).await;
    assert!(matches!(result, Err(RpcError::Timeout { .. })));
    server.abort();
  }

  #[tokio::test]
  async fn test_call_on_closed_channel() {
    let (client, rx) = channel::<(), ()>(1, Duration::from_secs(1));
    drop(rx);
    assert_eq!(client.call(()).await, Err(RpcError::Closed));
  }

  #[tokio::test]
  async fn test_dropped_envelope() {
    let (client, mut rx) = channel::<(), ()>(1, Duration::from_secs(1));
    tokio::spawn(async move {
      let _ = rx.recv().await;
    });
    assert!(matches!(client.call(()).await, Err(RpcError::Dropped(_))));
  }
}
