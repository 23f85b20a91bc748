use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Connectivity, ReachabilityProbe};

/// Turns periodic reachability probes into connectivity events.
///
/// Only transitions are reported; the first probe always reports.
pub struct ConnectivityMonitor {
  probe: Arc<dyn ReachabilityProbe>,
  interval: Duration,
}

impl ConnectivityMonitor {
  pub fn new(probe: Arc<dyn ReachabilityProbe>, interval: Duration) -> Self {
    Self { probe, interval }
  }

  /// Probe until the receiving side of `events` is dropped.
  pub async fn run(self, events: mpsc::Sender<Connectivity>) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last: Option<Connectivity> = None;

    loop {
      tokio::select! {
        _ = ticker.tick() => {}
        _ = events.closed() => break,
      }

      let state = if self.probe.probe().await {
        Connectivity::Online
      } else {
        Connectivity::Offline
      };
      if last == Some(state) {
        continue;
      }

      debug!(%state, "reachability changed");
      last = Some(state);
      if events.send(state).await.is_err() {
        break;
      }
    }
  }
}
