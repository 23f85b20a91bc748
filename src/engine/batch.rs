//! Per-kind batching state.

use std::collections::{HashSet, VecDeque};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::SyncError;
use crate::queue::PendingWrite;

pub(crate) type Waiter = oneshot::Sender<Result<serde_json::Value, SyncError>>;

/// A write waiting in, or travelling with, a batch.
#[derive(Debug)]
pub(crate) struct QueuedItem {
  pub write: PendingWrite,
  /// Caller awaiting the outcome; absent for writes resumed from the queue
  pub waiter: Option<Waiter>,
}

impl QueuedItem {
  pub fn resolve(self, outcome: Result<serde_json::Value, SyncError>) {
    if let Some(waiter) = self.waiter {
      // The caller may have stopped listening; the outcome is already durable
      let _ = waiter.send(outcome);
    }
  }
}

/// Timer that closes the forming batch.
#[derive(Debug)]
pub(crate) struct BatchTimer {
  pub deadline: Instant,
  pub handle: JoinHandle<()>,
}

/// Batching state for one resource kind.
///
/// `forming` is kept sorted by authoring time so that retried writes go out
/// ahead of anything written after them.
#[derive(Debug, Default)]
pub(crate) struct KindState {
  pub forming: VecDeque<QueuedItem>,
  /// When the current forming batch received its first item
  pub forming_since: Option<Instant>,
  pub sending: bool,
  pub timer: Option<BatchTimer>,
  /// Consecutive batches that ended with writes scheduled for retry
  pub failures: u32,
  /// Earliest instant the next batch may be sent
  pub not_before: Option<Instant>,
  /// Ids currently forming or sending
  held: HashSet<String>,
}

impl KindState {
  /// Add a write unless it is already forming or sending.
  pub fn admit(&mut self, item: QueuedItem, now: Instant) -> Result<(), QueuedItem> {
    if self.held.contains(&item.write.id) {
      return Err(item);
    }
    self.held.insert(item.write.id.clone());
    self.insert_sorted(item, now);
    Ok(())
  }

  /// Put retried writes back into a forming batch.
  pub fn requeue(&mut self, items: Vec<QueuedItem>, now: Instant) {
    for item in items {
      self.insert_sorted(item, now);
    }
  }

  fn insert_sorted(&mut self, item: QueuedItem, now: Instant) {
    if self.forming.is_empty() {
      self.forming_since = Some(now);
    }
    let at = self
      .forming
      .partition_point(|queued| queued.write.created_at <= item.write.created_at);
    self.forming.insert(at, item);
  }

  /// Take up to `max` of the oldest writes for sending.
  pub fn take_batch(&mut self, max: usize, now: Instant) -> Vec<QueuedItem> {
    let count = max.min(self.forming.len());
    let batch: Vec<QueuedItem> = self.forming.drain(..count).collect();
    // Whatever is left starts a fresh batch
    self.forming_since = if self.forming.is_empty() {
      None
    } else {
      Some(now)
    };
    batch
  }

  /// Forget a write that has been resolved or dropped.
  pub fn release(&mut self, id: &str) {
    self.held.remove(id);
  }

  pub fn cancel_timer(&mut self) {
    if let Some(timer) = self.timer.take() {
      timer.handle.abort();
    }
  }

  pub fn is_idle(&self) -> bool {
    !self.sending && self.forming.is_empty()
  }

  pub fn held(&self) -> usize {
    self.held.len()
  }
}
