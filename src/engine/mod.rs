//! Batching and retry engine.
//!
//! Writes are grouped per resource kind. A forming batch is sent when it
//! reaches `max_batch_size` or when `max_wait` has passed since its first
//! write joined, whichever comes first. At most one batch per kind is in
//! flight; writes arriving meanwhile form the next batch.
//!
//! After a send, accepted writes are removed from the durable queue and
//! their callers resolved. Rejected writes have their retry count bumped and
//! either rejoin a fresh batch, delayed by exponential backoff for that kind,
//! or are rejected to the caller once retries are exhausted. Every admitted
//! write is resolved exactly once.

mod backoff;
mod batch;
mod sender;

pub use backoff::Backoff;
pub use sender::{BatchSender, HttpBatchSender, ItemOutcome};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use self::batch::{BatchTimer, KindState, QueuedItem};
use crate::config::Config;
use crate::error::{FetchError, SyncError};
use crate::queue::{PendingWrite, WriteQueue, WriteStatus};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  pub max_batch_size: usize,
  pub max_wait: Duration,
  pub max_retries: u32,
  pub backoff: Backoff,
  /// Sends taking longer than this count as failed
  pub request_timeout: Duration,
}

impl EngineConfig {
  pub fn from_config(config: &Config) -> Self {
    Self {
      max_batch_size: config.batching.max_batch_size.max(1),
      max_wait: config.batching.max_wait(),
      max_retries: config.retry.max_retries,
      backoff: Backoff::from_config(&config.retry),
      request_timeout: config.server.request_timeout(),
    }
  }
}

/// A write handed to the engine, awaiting its server result.
#[derive(Debug)]
pub struct Submission {
  write: PendingWrite,
  rx: oneshot::Receiver<Result<serde_json::Value, SyncError>>,
}

impl Submission {
  pub fn id(&self) -> &str {
    &self.write.id
  }

  /// The write as it was queued.
  pub fn write(&self) -> &PendingWrite {
    &self.write
  }

  /// Wait for the server result.
  ///
  /// Fails with `SyncError::Closed` if the engine shuts down first; the write
  /// is still queued in that case.
  ///
  /// Fails with `SyncError::Transient` if the write could not be claimed when
  /// its batch was sent, because another process holds it in flight or it was
  /// already removed. The write may still reach the server through that other
  /// sender, so this is not a rejection.
  pub async fn outcome(self) -> Result<serde_json::Value, SyncError> {
    match self.rx.await {
      Ok(outcome) => outcome,
      Err(_) => Err(SyncError::Closed(self.write.id)),
    }
  }
}

/// Point-in-time view of one kind, for status output and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindSnapshot {
  pub resource_kind: String,
  pub forming: usize,
  pub sending: bool,
  pub held: usize,
  pub consecutive_failures: u32,
  pub next_attempt_in: Option<Duration>,
}

#[derive(Debug, Default)]
struct EngineState {
  kinds: HashMap<String, KindState>,
  online: bool,
  closed: bool,
}

struct Inner {
  queue: WriteQueue,
  sender: Arc<dyn BatchSender>,
  config: EngineConfig,
  state: Mutex<EngineState>,
  idle: Notify,
}

/// Owns all batching state; one instance per process.
#[derive(Clone)]
pub struct SyncEngine {
  inner: Arc<Inner>,
}

impl SyncEngine {
  /// Create an engine. It starts online; call `set_online(false)` first when
  /// connectivity is unknown.
  pub fn new(queue: WriteQueue, sender: Arc<dyn BatchSender>, config: EngineConfig) -> Self {
    Self {
      inner: Arc::new(Inner {
        queue,
        sender,
        config,
        state: Mutex::new(EngineState {
          online: true,
          ..EngineState::default()
        }),
        idle: Notify::new(),
      }),
    }
  }

  /// Durably queue a write and schedule it for sending.
  ///
  /// Returns as soon as the write is persisted; never waits on the network.
  pub fn submit(
    &self,
    resource_kind: &str,
    payload: serde_json::Value,
  ) -> Result<Submission, SyncError> {
    let write = self.inner.queue.enqueue(resource_kind, payload)?;
    let (tx, rx) = oneshot::channel();

    self.inner.admit(
      resource_kind,
      vec![QueuedItem {
        write: write.clone(),
        waiter: Some(tx),
      }],
    );

    Ok(Submission { write, rx })
  }

  /// Queue a write and wait for its server result.
  pub async fn submit_write(
    &self,
    resource_kind: &str,
    payload: serde_json::Value,
  ) -> Result<serde_json::Value, SyncError> {
    self.submit(resource_kind, payload)?.outcome().await
  }

  /// Schedule writes read back from the durable queue.
  ///
  /// Writes already forming or sending are skipped. Returns how many were
  /// newly scheduled.
  pub fn resume(&self, writes: Vec<PendingWrite>) -> usize {
    let mut by_kind: HashMap<String, Vec<QueuedItem>> = HashMap::new();
    for write in writes {
      by_kind
        .entry(write.resource_kind.clone())
        .or_default()
        .push(QueuedItem {
          write,
          waiter: None,
        });
    }

    by_kind
      .into_iter()
      .map(|(kind, items)| self.inner.admit(&kind, items))
      .sum()
  }

  /// Pause or resume sending.
  ///
  /// While offline, writes keep forming but no batch is sent. Batches
  /// already in flight are left to finish or fail on their own.
  pub fn set_online(&self, online: bool) {
    let Ok(mut state) = self.inner.lock() else {
      return;
    };
    if state.online == online {
      return;
    }
    state.online = online;
    info!(online, "sync engine connectivity changed");

    let kinds: Vec<String> = state.kinds.keys().cloned().collect();
    for kind in kinds {
      if let Some(ks) = state.kinds.get_mut(&kind) {
        if online {
          self.inner.schedule(&kind, ks, true);
        } else {
          ks.cancel_timer();
        }
      }
    }
    drop(state);
    self.inner.idle.notify_waiters();
  }

  pub fn is_online(&self) -> bool {
    self.inner.lock().map(|s| s.online).unwrap_or(false)
  }

  /// Whether nothing is sending, and nothing is waiting to be sent while online.
  pub fn is_idle(&self) -> bool {
    self
      .inner
      .lock()
      .map(|state| Inner::idle_locked(&state))
      .unwrap_or(true)
  }

  /// Wait until `is_idle` holds.
  pub async fn wait_idle(&self) {
    loop {
      let notified = self.inner.idle.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if self.is_idle() {
        return;
      }
      notified.await;
    }
  }

  pub fn snapshot(&self) -> Vec<KindSnapshot> {
    let Ok(state) = self.inner.lock() else {
      return Vec::new();
    };
    let now = Instant::now();
    let mut snapshots: Vec<KindSnapshot> = state
      .kinds
      .iter()
      .map(|(kind, ks)| KindSnapshot {
        resource_kind: kind.clone(),
        forming: ks.forming.len(),
        sending: ks.sending,
        held: ks.held(),
        consecutive_failures: ks.failures,
        next_attempt_in: ks
          .not_before
          .filter(|nb| *nb > now)
          .map(|nb| nb - now),
      })
      .collect();
    snapshots.sort_by(|a, b| a.resource_kind.cmp(&b.resource_kind));
    snapshots
  }

  /// Stop sending and reject every write that has not been sent.
  ///
  /// Rejected writes stay in the durable queue. Batches in flight finish,
  /// but their retries are not rescheduled.
  pub fn shutdown(&self) {
    let pending: Vec<QueuedItem> = {
      let Ok(mut state) = self.inner.lock() else {
        return;
      };
      if state.closed {
        return;
      }
      state.closed = true;
      state
        .kinds
        .values_mut()
        .flat_map(|ks| {
          ks.cancel_timer();
          let items: Vec<QueuedItem> = ks.forming.drain(..).collect();
          for item in &items {
            ks.release(&item.write.id);
          }
          ks.forming_since = None;
          items
        })
        .collect()
    };

    info!(rejected = pending.len(), "sync engine shut down");
    for item in pending {
      let id = item.write.id.clone();
      item.resolve(Err(SyncError::Closed(id)));
    }
    self.inner.idle.notify_waiters();
  }
}

impl Inner {
  fn lock(&self) -> color_eyre::Result<MutexGuard<'_, EngineState>> {
    self
      .state
      .lock()
      .map_err(|e| color_eyre::eyre::eyre!("Lock poisoned: {}", e))
  }

  fn idle_locked(state: &EngineState) -> bool {
    state
      .kinds
      .values()
      .all(|ks| ks.is_idle() || (!ks.sending && (!state.online || state.closed)))
  }

  /// Add writes to a kind's forming batch and schedule it.
  fn admit(self: &Arc<Self>, kind: &str, items: Vec<QueuedItem>) -> usize {
    let mut state = match self.lock() {
      Ok(state) => state,
      Err(e) => {
        error!(error = %e, "sync engine state unavailable");
        return 0;
      }
    };
    if state.closed {
      // Dropping the waiters rejects the callers with `Closed`
      return 0;
    }

    let online = state.online;
    let now = Instant::now();
    let ks = state.kinds.entry(kind.to_string()).or_default();
    let mut admitted = 0;
    for item in items {
      let retry_count = item.write.retry_count;
      let resume_at = self.resume_at(&item.write, now);
      match ks.admit(item, now) {
        Ok(()) => {
          admitted += 1;
          // Carry backoff over from attempts made before a restart
          if retry_count > 0 {
            ks.failures = ks.failures.max(retry_count);
          }
          if let Some(resume_at) = resume_at {
            ks.not_before = Some(ks.not_before.map_or(resume_at, |nb| nb.max(resume_at)));
          }
        }
        Err(duplicate) => {
          debug!(id = %duplicate.write.id, "write already scheduled");
        }
      }
    }

    if admitted > 0 {
      self.schedule(kind, ks, online);
    }
    admitted
  }

  /// Earliest time a previously failed write may be sent again, measured from
  /// its last recorded attempt. `None` once that backoff has already passed.
  fn resume_at(&self, write: &PendingWrite, now: Instant) -> Option<Instant> {
    let last_attempt = write.last_attempt_at?;
    if write.retry_count == 0 {
      return None;
    }
    let delay = self.config.backoff.delay(write.retry_count - 1);
    let due = last_attempt + chrono::Duration::from_std(delay).ok()?;
    let remaining = (due - Utc::now()).to_std().ok()?;
    Some(now + remaining)
  }

  /// When the forming batch of a kind may be sent.
  fn ready_at(&self, ks: &KindState, now: Instant) -> Instant {
    let ready = if ks.forming.len() >= self.config.max_batch_size {
      now
    } else {
      ks.forming_since.unwrap_or(now) + self.config.max_wait
    };
    match ks.not_before {
      Some(not_before) => ready.max(not_before),
      None => ready,
    }
  }

  /// Arrange for the forming batch of a kind to be sent when it is ready.
  fn schedule(self: &Arc<Self>, kind: &str, ks: &mut KindState, online: bool) {
    if ks.sending || ks.forming.is_empty() || !online {
      return;
    }

    let now = Instant::now();
    let ready_at = self.ready_at(ks, now);
    if ready_at <= now {
      ks.cancel_timer();
      let inner = Arc::clone(self);
      let kind = kind.to_string();
      tokio::spawn(async move { inner.flush(kind).await });
      return;
    }

    // A timer that fires earlier re-checks readiness and re-arms itself;
    // arrivals never push an armed deadline later.
    if let Some(timer) = &ks.timer {
      if timer.deadline <= ready_at && !timer.handle.is_finished() {
        return;
      }
    }
    ks.cancel_timer();

    let inner = Arc::clone(self);
    let kind_owned = kind.to_string();
    let handle = tokio::spawn(async move {
      tokio::time::sleep_until(ready_at).await;
      // Flush in its own task so cancelling this timer never cancels a send
      tokio::spawn(async move { inner.flush(kind_owned).await });
    });
    ks.timer = Some(BatchTimer {
      deadline: ready_at,
      handle,
    });
  }

  /// Send the forming batch of a kind if it is ready.
  async fn flush(self: Arc<Self>, kind: String) {
    let batch = {
      let mut state = match self.lock() {
        Ok(state) => state,
        Err(e) => {
          error!(error = %e, "sync engine state unavailable");
          return;
        }
      };
      let online = state.online && !state.closed;
      let Some(ks) = state.kinds.get_mut(&kind) else {
        return;
      };
      if ks.sending || ks.forming.is_empty() || !online {
        return;
      }

      let now = Instant::now();
      if self.ready_at(ks, now) > now {
        self.schedule(&kind, ks, online);
        return;
      }

      ks.cancel_timer();
      ks.sending = true;
      ks.take_batch(self.config.max_batch_size, now)
    };

    self.send_batch(&kind, batch).await;
  }

  async fn send_batch(self: &Arc<Self>, kind: &str, batch: Vec<QueuedItem>) {
    // Claim every write; a write another sender holds must not go out twice
    let mut claimed = Vec::with_capacity(batch.len());
    let mut deferred = Vec::new();
    let mut dropped = Vec::new();
    for item in batch {
      match self.queue.mark_in_flight(&item.write.id) {
        Ok(true) => claimed.push(item),
        Ok(false) => dropped.push(item),
        Err(e) => {
          warn!(id = %item.write.id, error = %e, "could not claim write, deferring");
          deferred.push(item);
        }
      }
    }

    let mut finished: Vec<(QueuedItem, Result<serde_json::Value, SyncError>)> = Vec::new();
    for item in dropped {
      debug!(id = %item.write.id, "write no longer claimable, skipping");
      let reason = format!("write {} is already in flight or gone", item.write.id);
      finished.push((item, Err(SyncError::Transient(reason))));
    }

    let mut retry = deferred;
    let mut any_retry = !retry.is_empty();

    if !claimed.is_empty() {
      let writes: Vec<PendingWrite> = claimed.iter().map(|i| i.write.clone()).collect();
      debug!(kind, size = writes.len(), "sending batch");

      let outcomes = self.send_with_timeout(kind, &writes).await;

      for (mut item, outcome) in claimed.into_iter().zip(outcomes) {
        let id = item.write.id.clone();
        match outcome {
          ItemOutcome::Accepted(value) => {
            if let Err(e) = self.queue.mark_synced(&id) {
              // The row stays in flight and is resent after restart
              warn!(id = %id, error = %e, "could not remove synced write");
            }
            finished.push((item, Ok(value)));
          }
          ItemOutcome::Rejected { reason, retryable } => {
            let attempts = match self.queue.mark_failed(&id) {
              Ok(attempts) => attempts,
              Err(e) => {
                // Unrecorded attempts do not count; retry like a failed claim
                warn!(id = %id, error = %e, "could not record failed attempt, deferring");
                if let Err(e) = self.queue.release(&id) {
                  warn!(id = %id, error = %e, "could not release write");
                }
                any_retry = true;
                retry.push(item);
                continue;
              }
            };
            item.write.retry_count = attempts;
            item.write.status = WriteStatus::Failed;
            item.write.last_attempt_at = Some(Utc::now());

            if retryable && attempts < self.config.max_retries {
              debug!(id = %id, attempts, reason = %reason, "write will be retried");
              any_retry = true;
              retry.push(item);
            } else {
              if !retryable {
                // Keep drain passes from sending it again
                if let Err(e) = self.queue.mark_exhausted(&id, self.config.max_retries) {
                  warn!(id = %id, error = %e, "could not mark write exhausted");
                }
              }
              error!(id = %id, attempts, reason = %reason, "write failed permanently");
              finished.push((
                item,
                Err(SyncError::Terminal {
                  id,
                  attempts,
                  reason,
                }),
              ));
            }
          }
        }
      }
    }

    let mut closed_out = Vec::new();
    match self.lock() {
      Ok(mut state) => {
        let online = state.online;
        let closed = state.closed;
        let ks = state.kinds.entry(kind.to_string()).or_default();
        ks.sending = false;
        for (item, _) in &finished {
          ks.release(&item.write.id);
        }

        let now = Instant::now();
        if any_retry {
          let delay = self.config.backoff.delay(ks.failures);
          ks.failures = ks.failures.saturating_add(1);
          ks.not_before = Some(now + delay);
          debug!(kind, retries = retry.len(), ?delay, "batch retry scheduled");
        } else {
          ks.failures = 0;
          ks.not_before = None;
        }

        if closed {
          for item in retry.drain(..) {
            ks.release(&item.write.id);
            closed_out.push(item);
          }
        } else {
          ks.requeue(std::mem::take(&mut retry), now);
          self.schedule(kind, ks, online);
        }
      }
      Err(e) => {
        // Without state the retries cannot be tracked; they stay in the
        // durable queue for the next drain pass.
        error!(error = %e, "sync engine state unavailable after send");
        closed_out.append(&mut retry);
      }
    }

    for (item, outcome) in finished {
      item.resolve(outcome);
    }
    for item in closed_out {
      let id = item.write.id.clone();
      if let Err(e) = self.queue.release(&id) {
        warn!(id = %id, error = %e, "could not release write");
      }
      item.resolve(Err(SyncError::Closed(id)));
    }
    self.idle.notify_waiters();
  }

  /// Send a batch, turning transport failures and timeouts into per-item
  /// rejections so every write gets exactly one outcome.
  async fn send_with_timeout(&self, kind: &str, writes: &[PendingWrite]) -> Vec<ItemOutcome> {
    let timeout = self.config.request_timeout;
    let result = match tokio::time::timeout(timeout, self.sender.send(kind, writes)).await {
      Ok(result) => result,
      Err(_) => Err(FetchError::Timeout(timeout)),
    };

    match result {
      Ok(outcomes) if outcomes.len() == writes.len() => outcomes,
      Ok(outcomes) => {
        warn!(
          kind,
          expected = writes.len(),
          got = outcomes.len(),
          "server returned wrong number of results"
        );
        vec![ItemOutcome::retryable("result count mismatch"); writes.len()]
      }
      Err(e) => {
        warn!(kind, size = writes.len(), error = %e, "batch send failed");
        let outcome = ItemOutcome::Rejected {
          reason: e.to_string(),
          retryable: e.is_retryable(),
        };
        vec![outcome; writes.len()]
      }
    }
  }
}
