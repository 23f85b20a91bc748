//! Control messages answered by the interception layer.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::layer::Interceptor;
use super::storage::CacheStorage;
use crate::rpc::{self, RpcClient};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
  /// Report the active cache generation
  GetVersion,
  /// Install and activate a new generation, deleting older partitions
  ActivateGeneration(String),
  /// Drop dynamic and API copies of the active generation
  ClearDynamic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
  Version(String),
  Activated { deleted: Vec<String> },
  Cleared(usize),
  Error(String),
}

pub type ControlClient = RpcClient<ControlRequest, ControlResponse>;

/// Serve control requests for an interceptor until every client is dropped.
pub fn spawn_control<S: CacheStorage + 'static>(
  interceptor: Arc<Interceptor<S>>,
  timeout: Duration,
) -> (ControlClient, JoinHandle<()>) {
  let (client, mut rx) = rpc::channel(16, timeout);

  let handle = tokio::spawn(async move {
    while let Some(envelope) = rx.recv().await {
      let response = match &envelope.request {
        ControlRequest::GetVersion => {
          ControlResponse::Version(interceptor.generation().tag().to_string())
        }
        ControlRequest::ActivateGeneration(tag) => match interceptor.upgrade(tag).await {
          Ok(deleted) => ControlResponse::Activated { deleted },
          Err(e) => ControlResponse::Error(e.to_string()),
        },
        ControlRequest::ClearDynamic => match interceptor.clear_dynamic() {
          Ok(count) => ControlResponse::Cleared(count),
          Err(e) => ControlResponse::Error(e.to_string()),
        },
      };
      tracing::debug!(id = envelope.id, ?response, "answered control request");
      envelope.reply(response);
    }
  });

  (client, handle)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::config::Config;
  use crate::db::Database;
  use crate::test_support::ScriptedFetcher;

  #[tokio::test]
  async fn test_version_and_activation_round_trip() {
    let storage = SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap()));
    let interceptor =
      Arc::new(Interceptor::new(&Config::default(), storage, Arc::new(ScriptedFetcher::new())).unwrap());
    interceptor.activate().unwrap();

    let (client, _handle) = spawn_control(interceptor, Duration::from_secs(1));

    assert_eq!(
      client.call(ControlRequest::GetVersion).await.unwrap(),
      ControlResponse::Version("v1".to_string())
    );

    match client
      .call(ControlRequest::ActivateGeneration("v2".to_string()))
      .await
      .unwrap()
    {
      ControlResponse::Activated { deleted } => assert_eq!(deleted.len(), 3),
      other => panic!("unexpected response: {:?}", other),
    }

    assert_eq!(
      client.call(ControlRequest::GetVersion).await.unwrap(),
      ControlResponse::Version("v2".to_string())
    );
    assert_eq!(
      client.call(ControlRequest::ClearDynamic).await.unwrap(),
      ControlResponse::Cleared(0)
    );
  }
}
