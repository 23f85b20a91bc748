//! Versioned schema migrations.
//!
//! `PRAGMA user_version` records how many migrations have been applied.
//! Migrations only ever append; a database written by an older release is
//! brought forward on open, and one written by a newer release is refused.

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;

const MIGRATIONS: &[&str] = &[
  // 1: durable write queue
  r#"
CREATE TABLE IF NOT EXISTS pending_writes (
    id TEXT PRIMARY KEY,
    resource_kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_pending_writes_kind
    ON pending_writes(resource_kind, status, created_at);
"#,
  // 2: cache partitions
  r#"
CREATE TABLE IF NOT EXISTS cache_partitions (
    name TEXT PRIMARY KEY,
    class TEXT NOT NULL,
    generation TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    request TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (partition, cache_key),
    FOREIGN KEY (partition) REFERENCES cache_partitions(name) ON DELETE CASCADE
);
"#,
  // 3: time of the last failed send, so backoff survives restarts
  r#"
ALTER TABLE pending_writes ADD COLUMN last_attempt_at TEXT;
"#,
];

/// Version a fully migrated database reports.
pub const SCHEMA_VERSION: u32 = MIGRATIONS.len() as u32;

pub fn current_version(conn: &Connection) -> Result<u32> {
  conn
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(|e| eyre!("Failed to read schema version: {}", e))
}

/// Apply every migration newer than the stored version.
pub fn migrate(conn: &mut Connection) -> Result<()> {
  let version = current_version(conn)?;
  if version > SCHEMA_VERSION {
    return Err(eyre!(
      "Database schema version {} is newer than supported version {}",
      version,
      SCHEMA_VERSION
    ));
  }

  for (index, sql) in MIGRATIONS.iter().enumerate().skip(version as usize) {
    let target = index as u32 + 1;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin migration {}: {}", target, e))?;
    tx.execute_batch(sql)
      .map_err(|e| eyre!("Failed to run migration {}: {}", target, e))?;
    tx.pragma_update(None, "user_version", target)
      .map_err(|e| eyre!("Failed to record migration {}: {}", target, e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit migration {}: {}", target, e))?;
    tracing::debug!(version = target, "applied schema migration");
  }

  Ok(())
}
