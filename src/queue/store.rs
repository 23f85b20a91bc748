//! SQLite-backed write queue.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;

use super::types::{KindCounts, PendingWrite, WriteStatus};
use crate::db::Database;

const SELECT_COLUMNS: &str =
  "SELECT id, resource_kind, payload, created_at, status, retry_count, last_attempt_at
   FROM pending_writes";

/// Durable queue of unsent writes.
///
/// This is the only component that deletes a write, and it does so only in
/// `mark_synced`.
#[derive(Clone)]
pub struct WriteQueue {
  db: Arc<Database>,
}

impl WriteQueue {
  /// Open the queue on an existing database.
  ///
  /// Rows left `in_flight` by a process that died mid-send are released back
  /// to the queue, since their sends were never acknowledged.
  pub fn open(db: Arc<Database>) -> Result<Self> {
    let queue = Self { db };
    let recovered = queue.recover()?;
    if recovered > 0 {
      tracing::info!(recovered, "released writes left in flight by a previous run");
    }
    Ok(queue)
  }

  /// Persist a new pending write authored now.
  pub fn enqueue(&self, resource_kind: &str, payload: serde_json::Value) -> Result<PendingWrite> {
    self.enqueue_at(resource_kind, payload, Utc::now())
  }

  /// Persist a new pending write with an explicit authoring time.
  pub fn enqueue_at(
    &self,
    resource_kind: &str,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
  ) -> Result<PendingWrite> {
    let write = PendingWrite {
      id: uuid::Uuid::new_v4().to_string(),
      resource_kind: resource_kind.to_string(),
      payload,
      created_at,
      status: WriteStatus::Pending,
      retry_count: 0,
      last_attempt_at: None,
    };

    let payload_json = serde_json::to_string(&write.payload)
      .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT INTO pending_writes (id, resource_kind, payload, created_at, status, retry_count)
         VALUES (?, ?, ?, ?, ?, 0)",
        params![
          write.id,
          write.resource_kind,
          payload_json,
          format_timestamp(&write.created_at),
          WriteStatus::Pending.as_str(),
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue write: {}", e))?;

    tracing::debug!(id = %write.id, kind = %write.resource_kind, "enqueued write");
    Ok(write)
  }

  /// Writes of a kind that still need sending, oldest first.
  ///
  /// Entries claimed by an active send are excluded.
  pub fn drain(&self, resource_kind: &str) -> Result<Vec<PendingWrite>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(&format!(
        "{} WHERE resource_kind = ? AND status IN ('pending', 'failed')
         ORDER BY created_at, rowid",
        SELECT_COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare drain query: {}", e))?;

    let writes = stmt
      .query_map(params![resource_kind], read_row)
      .map_err(|e| eyre!("Failed to drain {}: {}", resource_kind, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queued write: {}", e))?;

    Ok(writes)
  }

  /// Claim a write for sending.
  ///
  /// Returns `false` if the write is already in flight or no longer queued,
  /// in which case the caller must not send it.
  pub fn mark_in_flight(&self, id: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    let changed = conn
      .execute(
        "UPDATE pending_writes SET status = 'in_flight'
         WHERE id = ? AND status IN ('pending', 'failed')",
        params![id],
      )
      .map_err(|e| eyre!("Failed to claim write {}: {}", id, e))?;
    Ok(changed == 1)
  }

  /// Give up a claim without recording an outcome.
  pub fn release(&self, id: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "UPDATE pending_writes
         SET status = CASE WHEN retry_count > 0 THEN 'failed' ELSE 'pending' END
         WHERE id = ? AND status = 'in_flight'",
        params![id],
      )
      .map_err(|e| eyre!("Failed to release write {}: {}", id, e))?;
    Ok(())
  }

  /// Remove a write the server acknowledged.
  ///
  /// Returns `false` if it was already gone.
  pub fn mark_synced(&self, id: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    let deleted = conn
      .execute("DELETE FROM pending_writes WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove synced write {}: {}", id, e))?;
    Ok(deleted == 1)
  }

  /// Record a failed attempt and return the new retry count.
  pub fn mark_failed(&self, id: &str) -> Result<u32> {
    let conn = self.db.conn()?;
    conn
      .query_row(
        "UPDATE pending_writes
         SET status = 'failed', retry_count = retry_count + 1, last_attempt_at = ?
         WHERE id = ? RETURNING retry_count",
        params![format_timestamp(&Utc::now()), id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to mark write {} failed: {}", id, e))?
      .ok_or_else(|| eyre!("No queued write with id {}", id))
  }

  /// Mark a write the server refused for good, so no drain picks it up again.
  ///
  /// Raises `retry_count` to at least `max_retries`; `requeue` undoes it.
  pub fn mark_exhausted(&self, id: &str, max_retries: u32) -> Result<bool> {
    let conn = self.db.conn()?;
    let updated = conn
      .execute(
        "UPDATE pending_writes SET status = 'failed', retry_count = MAX(retry_count, ?)
         WHERE id = ?",
        params![max_retries, id],
      )
      .map_err(|e| eyre!("Failed to mark write {} exhausted: {}", id, e))?;
    Ok(updated == 1)
  }

  /// Reset a failed write so it is retried from scratch.
  pub fn requeue(&self, id: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    let changed = conn
      .execute(
        "UPDATE pending_writes SET status = 'pending', retry_count = 0, last_attempt_at = NULL
         WHERE id = ? AND status = 'failed'",
        params![id],
      )
      .map_err(|e| eyre!("Failed to requeue write {}: {}", id, e))?;
    Ok(changed == 1)
  }

  pub fn get(&self, id: &str) -> Result<Option<PendingWrite>> {
    let conn = self.db.conn()?;
    conn
      .query_row(
        &format!("{} WHERE id = ?", SELECT_COLUMNS),
        params![id],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to load write {}: {}", id, e))
  }

  /// Every queued write, optionally limited to one kind, oldest first.
  pub fn list(&self, resource_kind: Option<&str>) -> Result<Vec<PendingWrite>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(&format!(
        "{} WHERE (?1 IS NULL OR resource_kind = ?1) ORDER BY created_at, rowid",
        SELECT_COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare list query: {}", e))?;

    let writes = stmt
      .query_map(params![resource_kind], read_row)
      .map_err(|e| eyre!("Failed to list writes: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queued write: {}", e))?;

    Ok(writes)
  }

  /// Kinds that have writes waiting to be sent.
  pub fn kinds(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT DISTINCT resource_kind FROM pending_writes
         WHERE status IN ('pending', 'failed') ORDER BY resource_kind",
      )
      .map_err(|e| eyre!("Failed to prepare kinds query: {}", e))?;

    let kinds = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list kinds: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read kind: {}", e))?;

    Ok(kinds)
  }

  /// Per-kind status totals.
  pub fn counts(&self) -> Result<Vec<KindCounts>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT resource_kind, status, COUNT(*) FROM pending_writes
         GROUP BY resource_kind, status ORDER BY resource_kind",
      )
      .map_err(|e| eyre!("Failed to prepare counts query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, i64>(2)?,
        ))
      })
      .map_err(|e| eyre!("Failed to count writes: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read counts: {}", e))?;

    let mut counts: Vec<KindCounts> = Vec::new();
    for (kind, status, count) in rows {
      if counts.last().map(|c| c.resource_kind != kind).unwrap_or(true) {
        counts.push(KindCounts {
          resource_kind: kind,
          ..KindCounts::default()
        });
      }
      if let Some(entry) = counts.last_mut() {
        let count = count as usize;
        match WriteStatus::parse(&status) {
          Some(WriteStatus::Pending) => entry.pending += count,
          Some(WriteStatus::InFlight) => entry.in_flight += count,
          Some(WriteStatus::Failed) => entry.failed += count,
          Some(WriteStatus::Synced) | None => {}
        }
      }
    }

    Ok(counts)
  }

  pub fn len(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM pending_writes", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count writes: {}", e))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Release every in-flight claim. Only valid when no send is active.
  fn recover(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    let released = conn
      .execute(
        "UPDATE pending_writes
         SET status = CASE WHEN retry_count > 0 THEN 'failed' ELSE 'pending' END
         WHERE status = 'in_flight'",
        [],
      )
      .map_err(|e| eyre!("Failed to release in-flight writes: {}", e))?;
    Ok(released)
  }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
  // Fixed width so lexical order in SQLite matches chronological order
  ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<PendingWrite> {
  let payload: String = row.get(2)?;
  let created_at: String = row.get(3)?;
  let status: String = row.get(4)?;
  let last_attempt_at: Option<String> = row.get(6)?;

  let payload = serde_json::from_str(&payload)
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e)))?;
  let created_at = DateTime::parse_from_rfc3339(&created_at)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e)))?;
  let status = WriteStatus::parse(&status).ok_or_else(|| {
    rusqlite::Error::FromSqlConversionFailure(
      4,
      rusqlite::types::Type::Text,
      format!("unknown write status '{}'", status).into(),
    )
  })?;

  Ok(PendingWrite {
    id: row.get(0)?,
    resource_kind: row.get(1)?,
    payload,
    created_at,
    status,
    retry_count: row.get(5)?,
    last_attempt_at: last_attempt_at
      .map(|ts| {
        DateTime::parse_from_rfc3339(&ts)
          .map(|dt| dt.with_timezone(&Utc))
          .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
          })
      })
      .transpose()?,
  })
}
