pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Shared SQLite connection for the durable queue and the cache partitions.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at the given path
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    // WAL keeps readers off the writer; FULL makes every commit durable
    // before the call that issued it returns.
    conn
      .execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")
      .map_err(|e| eyre!("Failed to configure database: {}", e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory database
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(mut conn: Connection) -> Result<Self> {
    conn
      .execute_batch("PRAGMA foreign_keys = ON;")
      .map_err(|e| eyre!("Failed to configure database: {}", e))?;
    schema::migrate(&mut conn)?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Lock the connection for a unit of work
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Current schema version
  pub fn schema_version(&self) -> Result<u32> {
    let conn = self.conn()?;
    schema::current_version(&conn)
  }
}
