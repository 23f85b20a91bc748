//! Records held by the durable write queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a queued write is in its delivery lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
  /// Waiting to be sent
  Pending,
  /// Claimed by an active send
  InFlight,
  /// Acknowledged by the server (transient; synced rows are deleted)
  Synced,
  /// Last attempt failed
  Failed,
}

impl WriteStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      WriteStatus::Pending => "pending",
      WriteStatus::InFlight => "in_flight",
      WriteStatus::Synced => "synced",
      WriteStatus::Failed => "failed",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "pending" => Some(WriteStatus::Pending),
      "in_flight" => Some(WriteStatus::InFlight),
      "synced" => Some(WriteStatus::Synced),
      "failed" => Some(WriteStatus::Failed),
      _ => None,
    }
  }
}

impl std::fmt::Display for WriteStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
  pub id: String,
  /// Target resource, also the batch key (e.g. "journal_entry")
  pub resource_kind: String,
  pub payload: serde_json::Value,
  /// When the user authored the write, kept even if it syncs much later
  pub created_at: DateTime<Utc>,
  pub status: WriteStatus,
  pub retry_count: u32,
  /// When the last failed send was recorded
  pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Per-kind totals used for the "pending sync" indicator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
  pub resource_kind: String,
  pub pending: usize,
  pub in_flight: usize,
  pub failed: usize,
}

impl KindCounts {
  pub fn unsent(&self) -> usize {
    self.pending + self.in_flight + self.failed
  }
}
