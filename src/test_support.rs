//! Scripted collaborators shared by unit tests.

use chrono::{TimeZone, Utc};
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::engine::{BatchSender, ItemOutcome};
use crate::error::FetchError;
use crate::http::{Fetcher, Request, Response};
use crate::queue::{PendingWrite, WriteStatus};

/// A write authored `secs` seconds after a fixed instant.
pub fn make_write(id: &str, secs: i64) -> PendingWrite {
  let base = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
  PendingWrite {
    id: id.to_string(),
    resource_kind: "journal_entry".to_string(),
    payload: serde_json::json!({ "text": id }),
    created_at: base + chrono::Duration::seconds(secs),
    status: WriteStatus::Pending,
    retry_count: 0,
    last_attempt_at: None,
  }
}

#[derive(Debug, Clone)]
enum Route {
  Respond(Response),
  Fail,
}

#[derive(Debug, Default)]
struct FetcherState {
  routes: HashMap<String, Route>,
  calls: HashMap<String, usize>,
  last: HashMap<String, Request>,
}

/// Fetcher answering from a per-path script. Unknown paths fail as if the
/// network were down.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
  state: Mutex<FetcherState>,
  offline: AtomicBool,
}

impl ScriptedFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, path: &str, response: Response) {
    let mut state = self.state.lock().unwrap();
    state.routes.insert(path.to_string(), Route::Respond(response));
  }

  pub fn fail(&self, path: &str) {
    let mut state = self.state.lock().unwrap();
    state.routes.insert(path.to_string(), Route::Fail);
  }

  /// Fail every request regardless of script.
  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self, path: &str) -> usize {
    let state = self.state.lock().unwrap();
    state.calls.get(path).copied().unwrap_or(0)
  }

  pub fn last_body(&self, path: &str) -> Option<Vec<u8>> {
    let state = self.state.lock().unwrap();
    state.last.get(path).and_then(|r| r.body.clone())
  }

  pub fn last_headers(&self, path: &str) -> Option<Vec<(String, String)>> {
    let state = self.state.lock().unwrap();
    state.last.get(path).map(|r| r.headers.clone())
  }
}

impl Fetcher for ScriptedFetcher {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
    let result = {
      let mut state = self.state.lock().unwrap();
      let path = request.url.path().to_string();
      *state.calls.entry(path.clone()).or_default() += 1;
      state.last.insert(path.clone(), request.clone());

      if self.offline.load(Ordering::SeqCst) {
        Err(FetchError::Network("offline".to_string()))
      } else {
        match state.routes.get(&path) {
          Some(Route::Respond(response)) => Ok(response.clone()),
          Some(Route::Fail) | None => Err(FetchError::Network(format!("no route to {}", path))),
        }
      }
    };
    Box::pin(async move { result })
  }
}

/// One call received by a `ScriptedSender`.
#[derive(Debug, Clone)]
pub struct SentBatch {
  pub resource_kind: String,
  pub ids: Vec<String>,
  pub at: Instant,
}

#[derive(Debug)]
enum Reply {
  Outcomes(Vec<ItemOutcome>),
  Error(FetchError),
}

#[derive(Debug, Default)]
struct SenderState {
  replies: VecDeque<Reply>,
  sticky: HashMap<String, ItemOutcome>,
  sent: Vec<SentBatch>,
}

/// Batch sender replaying scripted replies, accepting everything once the
/// script runs out.
#[derive(Debug, Default)]
pub struct ScriptedSender {
  state: Mutex<SenderState>,
  delay: Option<Duration>,
  unreachable: AtomicBool,
  in_flight: AtomicUsize,
  max_in_flight: AtomicUsize,
}

impl ScriptedSender {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every send take `delay` before answering.
  pub fn with_delay(delay: Duration) -> Self {
    Self {
      delay: Some(delay),
      ..Self::default()
    }
  }

  /// Answer the next unscripted call with these per-item outcomes.
  pub fn push_outcomes(&self, outcomes: Vec<ItemOutcome>) {
    let mut state = self.state.lock().unwrap();
    state.replies.push_back(Reply::Outcomes(outcomes));
  }

  /// Fail the next unscripted call as a whole.
  pub fn push_error(&self, error: FetchError) {
    let mut state = self.state.lock().unwrap();
    state.replies.push_back(Reply::Error(error));
  }

  /// Answer every send of `id` with `outcome` once the script runs out.
  pub fn always(&self, id: &str, outcome: ItemOutcome) {
    let mut state = self.state.lock().unwrap();
    state.sticky.insert(id.to_string(), outcome);
  }

  /// Fail every send with a network error while set.
  pub fn set_unreachable(&self, unreachable: bool) {
    self.unreachable.store(unreachable, Ordering::SeqCst);
  }

  pub fn batches(&self) -> Vec<SentBatch> {
    self.state.lock().unwrap().sent.clone()
  }

  pub fn batch_sizes(&self) -> Vec<usize> {
    self.batches().iter().map(|b| b.ids.len()).collect()
  }

  /// Ids in the order they were sent.
  pub fn sent_ids(&self) -> Vec<String> {
    self.batches().into_iter().flat_map(|b| b.ids).collect()
  }

  pub fn max_concurrent(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }
}

impl BatchSender for ScriptedSender {
  fn send<'a>(
    &'a self,
    resource_kind: &'a str,
    writes: &'a [PendingWrite],
  ) -> BoxFuture<'a, Result<Vec<ItemOutcome>, FetchError>> {
    Box::pin(async move {
      let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      self.max_in_flight.fetch_max(current, Ordering::SeqCst);

      let reply = {
        let mut state = self.state.lock().unwrap();
        state.sent.push(SentBatch {
          resource_kind: resource_kind.to_string(),
          ids: writes.iter().map(|w| w.id.clone()).collect(),
          at: Instant::now(),
        });
        state.replies.pop_front()
      };

      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }

      let result = if self.unreachable.load(Ordering::SeqCst) {
        Err(FetchError::Network("unreachable".to_string()))
      } else {
        match reply {
          Some(Reply::Outcomes(outcomes)) => Ok(outcomes),
          Some(Reply::Error(e)) => Err(e),
          None => {
            let state = self.state.lock().unwrap();
            Ok(
              writes
                .iter()
                .map(|w| {
                  state
                    .sticky
                    .get(&w.id)
                    .cloned()
                    .unwrap_or_else(|| ItemOutcome::Accepted(serde_json::json!({ "id": w.id })))
                })
                .collect(),
            )
          }
        }
      };

      self.in_flight.fetch_sub(1, Ordering::SeqCst);
      result
    })
  }
}
