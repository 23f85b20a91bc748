use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{Connectivity, ReachabilityProbe};
use crate::engine::SyncEngine;
use crate::queue::WriteQueue;

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Kinds that had unsent writes
  pub kinds: usize,
  /// Writes newly handed to the engine
  pub scheduled: usize,
  /// Writes left alone because their retries are used up
  pub exhausted: usize,
  /// Kinds whose writes could not be read, with the error
  pub errors: Vec<(String, String)>,
}

/// Decides when unsent writes are handed to the sync engine.
pub struct Coordinator {
  engine: SyncEngine,
  queue: WriteQueue,
  probe: Arc<dyn ReachabilityProbe>,
  max_retries: u32,
  state: watch::Sender<Connectivity>,
}

impl Coordinator {
  /// Create a coordinator, applying `initial` to the engine.
  pub fn new(
    engine: SyncEngine,
    queue: WriteQueue,
    probe: Arc<dyn ReachabilityProbe>,
    max_retries: u32,
    initial: Connectivity,
  ) -> Self {
    engine.set_online(initial.is_online());
    let (state, _) = watch::channel(initial);
    Self {
      engine,
      queue,
      probe,
      max_retries,
      state,
    }
  }

  pub fn connectivity(&self) -> Connectivity {
    *self.state.borrow()
  }

  /// Observe connectivity changes.
  pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
    self.state.subscribe()
  }

  /// Apply a connectivity event.
  ///
  /// An online event is only trusted once the server answers the probe; a
  /// confirmed reconnect runs a full drain pass. An offline event pauses the
  /// engine and nothing else.
  pub async fn on_connectivity_change(&self, event: Connectivity) -> Option<DrainReport> {
    match event {
      Connectivity::Offline => {
        self.set_state(Connectivity::Offline);
        None
      }
      Connectivity::Online => {
        if !self.probe.probe().await {
          info!("online event not confirmed by reachability probe");
          self.set_state(Connectivity::Offline);
          return None;
        }
        self.set_state(Connectivity::Online);
        Some(self.drain_pass())
      }
    }
  }

  fn set_state(&self, next: Connectivity) {
    let changed = self.state.send_if_modified(|current| {
      if *current == next {
        false
      } else {
        *current = next;
        true
      }
    });
    if changed {
      info!(state = %next, "connectivity changed");
    }
    self.engine.set_online(next.is_online());
  }

  /// Hand every unsent write of every kind to the engine.
  ///
  /// Writes already forming or sending are skipped by the engine, so
  /// overlapping passes schedule nothing twice. A kind that cannot be read is
  /// reported and does not stop the others.
  pub fn drain_pass(&self) -> DrainReport {
    let mut report = DrainReport::default();

    let kinds = match self.queue.kinds() {
      Ok(kinds) => kinds,
      Err(e) => {
        warn!(error = %e, "could not list queued kinds");
        report.errors.push(("*".to_string(), e.to_string()));
        return report;
      }
    };

    for kind in kinds {
      let writes = match self.queue.drain(&kind) {
        Ok(writes) => writes,
        Err(e) => {
          warn!(kind, error = %e, "could not read queued writes");
          report.errors.push((kind, e.to_string()));
          continue;
        }
      };
      if writes.is_empty() {
        continue;
      }
      report.kinds += 1;

      let (eligible, exhausted): (Vec<_>, Vec<_>) = writes
        .into_iter()
        .partition(|w| w.retry_count < self.max_retries);
      report.exhausted += exhausted.len();
      report.scheduled += self.engine.resume(eligible);
    }

    if report.scheduled > 0 || !report.errors.is_empty() {
      info!(
        kinds = report.kinds,
        scheduled = report.scheduled,
        exhausted = report.exhausted,
        errors = report.errors.len(),
        "drain pass finished"
      );
    } else {
      debug!(exhausted = report.exhausted, "drain pass found nothing to schedule");
    }
    report
  }

  /// Periodic retry of failed writes; does nothing while offline.
  pub fn tick(&self) -> Option<DrainReport> {
    if self.connectivity().is_online() {
      Some(self.drain_pass())
    } else {
      None
    }
  }

  /// Apply connectivity events and run periodic passes until the event
  /// channel closes.
  pub async fn run(&self, mut events: mpsc::Receiver<Connectivity>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
      tokio::select! {
        event = events.recv() => match event {
          Some(event) => {
            self.on_connectivity_change(event).await;
          }
          None => break,
        },
        _ = ticker.tick() => {
          self.tick();
        }
      }
    }
    debug!("coordinator stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::engine::{Backoff, EngineConfig, ItemOutcome};
  use crate::test_support::ScriptedSender;
  use futures::future::BoxFuture;
  use serde_json::json;
  use std::sync::atomic::{AtomicBool, Ordering};

  struct FlagProbe(AtomicBool);

  impl ReachabilityProbe for FlagProbe {
    fn probe(&self) -> BoxFuture<'_, bool> {
      let up = self.0.load(Ordering::SeqCst);
      Box::pin(async move { up })
    }
  }

  fn engine_config() -> EngineConfig {
    EngineConfig {
      max_batch_size: 10,
      max_wait: Duration::from_millis(100),
      max_retries: 3,
      backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(30)),
      request_timeout: Duration::from_secs(10),
    }
  }

  struct Harness {
    coordinator: Coordinator,
    engine: SyncEngine,
    queue: WriteQueue,
    sender: Arc<ScriptedSender>,
    probe: Arc<FlagProbe>,
  }

  fn harness(db: Arc<Database>, initial: Connectivity) -> Harness {
    let queue = WriteQueue::open(db).unwrap();
    let sender = Arc::new(ScriptedSender::new());
    let engine = SyncEngine::new(queue.clone(), sender.clone(), engine_config());
    let probe = Arc::new(FlagProbe(AtomicBool::new(initial.is_online())));
    let coordinator = Coordinator::new(engine.clone(), queue.clone(), probe.clone(), 3, initial);
    Harness {
      coordinator,
      engine,
      queue,
      sender,
      probe,
    }
  }

  fn memory_db() -> Arc<Database> {
    Arc::new(Database::open_in_memory().unwrap())
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_writes_sent_in_order_on_reconnect() {
    let h = harness(memory_db(), Connectivity::Offline);

    let submissions: Vec<_> = (1..=3)
      .map(|n| {
        h.engine
          .submit("journal_entry", json!({ "text": format!("entry {}", n) }))
          .unwrap()
      })
      .collect();
    let ids: Vec<String> = submissions.iter().map(|s| s.id().to_string()).collect();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.sender.batches().is_empty());
    assert_eq!(h.queue.len().unwrap(), 3);

    h.probe.0.store(true, Ordering::SeqCst);
    let report = h
      .coordinator
      .on_connectivity_change(Connectivity::Online)
      .await
      .unwrap();
    // Already held by the engine since submission
    assert_eq!(report.scheduled, 0);
    assert_eq!(report.kinds, 1);

    for submission in submissions {
      submission.outcome().await.unwrap();
    }
    assert_eq!(h.sender.sent_ids(), ids);
    assert!(h.queue.is_empty().unwrap());
  }

  #[tokio::test(start_paused = true)]
  async fn test_unconfirmed_online_event_stays_offline() {
    let h = harness(memory_db(), Connectivity::Offline);
    h.queue.enqueue("journal_entry", json!({"text": "a"})).unwrap();

    let report = h.coordinator.on_connectivity_change(Connectivity::Online).await;
    assert!(report.is_none());
    assert_eq!(h.coordinator.connectivity(), Connectivity::Offline);
    assert!(!h.engine.is_online());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.sender.batches().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_writes_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inkwell.db");

    let ids: Vec<String> = {
      let h = harness(Arc::new(Database::open(&path).unwrap()), Connectivity::Offline);
      let first = h.engine.submit("journal_entry", json!({"text": "a"})).unwrap();
      let second = h.engine.submit("journal_entry", json!({"text": "b"})).unwrap();
      let ids = vec![first.id().to_string(), second.id().to_string()];
      h.engine.shutdown();
      assert!(matches!(first.outcome().await, Err(crate::error::SyncError::Closed(_))));
      assert!(second.outcome().await.unwrap_err().is_recoverable());
      ids
    };

    let h = harness(Arc::new(Database::open(&path).unwrap()), Connectivity::Online);
    let report = h.coordinator.drain_pass();
    assert_eq!(report.scheduled, 2);
    h.engine.wait_idle().await;

    assert_eq!(h.sender.sent_ids(), ids);
    assert!(h.queue.is_empty().unwrap());
  }

  #[tokio::test(start_paused = true)]
  async fn test_drain_pass_is_idempotent() {
    let h = harness(memory_db(), Connectivity::Online);
    h.engine.set_online(false);
    h.queue.enqueue("journal_entry", json!({"text": "a"})).unwrap();

    assert_eq!(h.coordinator.drain_pass().scheduled, 1);
    assert_eq!(h.coordinator.drain_pass().scheduled, 0);

    h.engine.set_online(true);
    h.engine.wait_idle().await;
    assert_eq!(h.sender.batch_sizes(), vec![1]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_exhausted_writes_skipped_without_blocking_other_kinds() {
    let h = harness(memory_db(), Connectivity::Online);
    let stuck = h.queue.enqueue("mood", json!({"mood": "??"})).unwrap();
    for _ in 0..3 {
      h.queue.mark_failed(&stuck.id).unwrap();
    }
    h.queue.enqueue("journal_entry", json!({"text": "a"})).unwrap();

    let report = h.coordinator.drain_pass();
    assert_eq!(report.kinds, 2);
    assert_eq!(report.scheduled, 1);
    assert_eq!(report.exhausted, 1);

    h.engine.wait_idle().await;
    let batches = h.sender.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].resource_kind, "journal_entry");
    assert_eq!(h.queue.len().unwrap(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_terminally_rejected_write_is_not_resent() {
    let h = harness(memory_db(), Connectivity::Online);
    let write = h.queue.enqueue("mood", json!({"mood": "??"})).unwrap();
    h.sender.always(&write.id, ItemOutcome::terminal("invalid mood"));

    assert_eq!(h.coordinator.drain_pass().scheduled, 1);
    h.engine.wait_idle().await;
    assert_eq!(h.queue.get(&write.id).unwrap().unwrap().retry_count, 3);

    for _ in 0..2 {
      let report = h.coordinator.tick().unwrap();
      assert_eq!(report.scheduled, 0);
      assert_eq!(report.exhausted, 1);
      h.engine.wait_idle().await;
    }
    assert_eq!(h.sender.batch_sizes(), vec![1]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_backoff_carries_over_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inkwell.db");

    let id = {
      let queue = WriteQueue::open(Arc::new(Database::open(&path).unwrap())).unwrap();
      let write = queue.enqueue("journal_entry", json!({"text": "a"})).unwrap();
      queue.mark_failed(&write.id).unwrap();
      queue.mark_failed(&write.id).unwrap();
      write.id
    };

    let h = harness(Arc::new(Database::open(&path).unwrap()), Connectivity::Online);
    let start = tokio::time::Instant::now();
    assert_eq!(h.coordinator.drain_pass().scheduled, 1);
    assert_eq!(h.engine.snapshot()[0].consecutive_failures, 2);
    h.engine.wait_idle().await;

    // Two recorded failures: the third attempt waits 2s from the last one,
    // not just the batch window
    let batches = h.sender.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].ids, vec![id]);
    assert!(batches[0].at - start >= Duration::from_millis(1900));
    assert!(h.queue.is_empty().unwrap());
  }

  #[tokio::test(start_paused = true)]
  async fn test_periodic_tick_resubmits_failed_writes() {
    let h = harness(memory_db(), Connectivity::Online);
    let write = h.queue.enqueue("journal_entry", json!({"text": "a"})).unwrap();
    h.sender.push_outcomes(vec![ItemOutcome::retryable("busy")]);

    let (events, rx) = mpsc::channel(4);
    let coordinator = Arc::new(h.coordinator);
    let runner = {
      let coordinator = Arc::clone(&coordinator);
      tokio::spawn(async move { coordinator.run(rx, Duration::from_secs(30)).await })
    };

    tokio::time::sleep(Duration::from_secs(31)).await;
    // First attempt failed and was retried from the engine's own backoff
    h.engine.wait_idle().await;
    assert_eq!(h.sender.batch_sizes(), vec![1, 1]);
    assert!(h.queue.get(&write.id).unwrap().is_none());

    drop(events);
    runner.await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_event_pauses_engine() {
    let h = harness(memory_db(), Connectivity::Online);
    let mut watcher = h.coordinator.subscribe();

    assert!(h
      .coordinator
      .on_connectivity_change(Connectivity::Offline)
      .await
      .is_none());
    assert!(watcher.has_changed().unwrap());
    assert_eq!(*watcher.borrow_and_update(), Connectivity::Offline);
    assert!(!h.engine.is_online());
    assert!(h.coordinator.tick().is_none());
  }
}
