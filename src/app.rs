use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

use crate::cache::{spawn_control, ControlClient, Interceptor, SqliteStorage};
use crate::config::Config;
use crate::db::Database;
use crate::engine::{EngineConfig, HttpBatchSender, SyncEngine};
use crate::http::{Fetcher, HttpFetcher};
use crate::queue::WriteQueue;
use crate::sync::{Connectivity, ConnectivityMonitor, Coordinator, DrainReport, HttpProbe};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// The assembled pipeline: queue, cache layer, engine and coordinator over one
/// database.
pub struct App {
  config: Config,
  queue: WriteQueue,
  interceptor: Arc<Interceptor<SqliteStorage>>,
  engine: SyncEngine,
  coordinator: Arc<Coordinator>,
  health_url: Url,
}

impl App {
  /// Open the database under the data directory and talk to the configured server.
  pub fn open(config: Config) -> Result<Self> {
    let db_path = config.data_dir()?.join("inkwell.db");
    let db = Arc::new(Database::open(&db_path)?);
    let fetcher = HttpFetcher::new(config.server.request_timeout(), Config::api_token())
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    Self::with_database(config, db, Arc::new(fetcher))
  }

  pub fn with_database(config: Config, db: Arc<Database>, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
    let origin = Url::parse(&config.server.url)
      .map_err(|e| eyre!("Invalid server url {}: {}", config.server.url, e))?;
    let batch_url = origin
      .join(&config.server.batch_path)
      .map_err(|e| eyre!("Invalid batch path {}: {}", config.server.batch_path, e))?;
    let health_url = origin
      .join(&config.server.health_path)
      .map_err(|e| eyre!("Invalid health path {}: {}", config.server.health_path, e))?;

    let queue = WriteQueue::open(Arc::clone(&db))?;
    let interceptor = Arc::new(Interceptor::new(
      &config,
      SqliteStorage::new(Arc::clone(&db)),
      fetcher,
    )?);

    let sender = Arc::new(HttpBatchSender::new(Arc::clone(&interceptor), batch_url));
    let engine = SyncEngine::new(queue.clone(), sender, EngineConfig::from_config(&config));
    let probe = Arc::new(HttpProbe::new(Arc::clone(&interceptor), health_url.clone()));
    let coordinator = Arc::new(Coordinator::new(
      engine.clone(),
      queue.clone(),
      probe,
      config.retry.max_retries,
      Connectivity::Offline,
    ));

    Ok(Self {
      config,
      queue,
      interceptor,
      engine,
      coordinator,
      health_url,
    })
  }

  pub fn queue(&self) -> &WriteQueue {
    &self.queue
  }

  pub fn engine(&self) -> &SyncEngine {
    &self.engine
  }

  pub fn interceptor(&self) -> &Arc<Interceptor<SqliteStorage>> {
    &self.interceptor
  }

  pub fn coordinator(&self) -> &Arc<Coordinator> {
    &self.coordinator
  }

  /// Prepare the cache and hand queued writes to the engine.
  ///
  /// Must run before new writes are submitted. Returns the drain report when
  /// the server was reachable.
  pub async fn start(&self) -> Result<Option<DrainReport>> {
    let deleted = self.interceptor.activate()?;
    if !deleted.is_empty() {
      info!(?deleted, "removed stale cache partitions");
    }
    match self.interceptor.install().await {
      Ok(stored) => info!(stored, "cache generation installed"),
      Err(e) => warn!(error = %e, "cache install failed, continuing without precache"),
    }

    Ok(
      self
        .coordinator
        .on_connectivity_change(Connectivity::Online)
        .await,
    )
  }

  /// Send everything that can be sent now and wait for the engine to settle.
  pub async fn sync_once(&self) -> Result<Option<DrainReport>> {
    let report = self.start().await?;
    self.engine.wait_idle().await;
    Ok(report)
  }

  /// Serve cache control requests for this process.
  pub fn cache_control(&self) -> ControlClient {
    let (client, _handle) = spawn_control(Arc::clone(&self.interceptor), CONTROL_TIMEOUT);
    client
  }

  /// Run until ctrl-c: probe connectivity, drain on reconnect, retry failed
  /// writes periodically.
  pub async fn run(&self) -> Result<()> {
    self.start().await?;

    let (events, rx) = mpsc::channel(16);
    let monitor = ConnectivityMonitor::new(
      Arc::new(HttpProbe::new(
        Arc::clone(&self.interceptor),
        self.health_url.clone(),
      )),
      self.config.reconcile.probe_interval(),
    );
    let monitor = tokio::spawn(monitor.run(events));

    let coordinator = Arc::clone(&self.coordinator);
    let interval = self.config.reconcile.interval();
    let reconcile = tokio::spawn(async move { coordinator.run(rx, interval).await });

    info!(server = %self.config.server.url, "sync daemon running");
    tokio::signal::ctrl_c()
      .await
      .map_err(|e| eyre!("Failed to listen for ctrl-c: {}", e))?;
    info!("shutting down");

    // Stopping the monitor closes the event channel, which stops the coordinator
    monitor.abort();
    if let Err(e) = reconcile.await {
      warn!(error = %e, "coordinator task ended abnormally");
    }
    self.engine.shutdown();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Response;
  use crate::test_support::ScriptedFetcher;
  use serde_json::json;

  fn app(fetcher: Arc<ScriptedFetcher>) -> App {
    let db = Arc::new(Database::open_in_memory().unwrap());
    App::with_database(Config::default(), db, fetcher).unwrap()
  }

  #[tokio::test(start_paused = true)]
  async fn test_sync_once_sends_queued_writes() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.respond("/api/health", Response::new(200, ""));
    fetcher.respond(
      "/api/entries/batch",
      Response::json(200, &json!({"results": [{"ok": true}, {"ok": true}]})),
    );
    let app = app(fetcher.clone());
    app.queue().enqueue("journal_entry", json!({"text": "a"})).unwrap();
    app.queue().enqueue("journal_entry", json!({"text": "b"})).unwrap();

    let report = app.sync_once().await.unwrap().unwrap();
    assert_eq!(report.scheduled, 2);
    assert_eq!(fetcher.calls("/api/entries/batch"), 1);
    assert!(app.queue().is_empty().unwrap());
  }

  #[tokio::test(start_paused = true)]
  async fn test_unreachable_server_leaves_queue_untouched() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let app = app(fetcher.clone());
    app.queue().enqueue("journal_entry", json!({"text": "a"})).unwrap();

    assert!(app.sync_once().await.unwrap().is_none());
    assert_eq!(fetcher.calls("/api/entries/batch"), 0);
    assert_eq!(app.queue().len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_cache_control_reports_generation() {
    let app = app(Arc::new(ScriptedFetcher::new()));
    let control = app.cache_control();
    let response = control
      .call(crate::cache::ControlRequest::GetVersion)
      .await
      .unwrap();
    assert_eq!(response, crate::cache::ControlResponse::Version("v1".to_string()));
  }
}
