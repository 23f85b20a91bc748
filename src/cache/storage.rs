//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::traits::CacheClass;
use crate::db::Database;
use crate::http::{Request, Response};

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The cached response
  pub response: Response,
  /// When the response was cached
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Create a partition if it does not exist yet.
  fn ensure_partition(&self, name: &str, class: CacheClass, generation: &str) -> Result<()>;

  /// Names of every partition currently stored.
  fn partitions(&self) -> Result<Vec<String>>;

  /// Delete a partition and all of its entries.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  /// Remove all entries from a partition, keeping the partition.
  fn clear_partition(&self, name: &str) -> Result<usize>;

  /// Look up the response stored for a request.
  fn get(&self, partition: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// Store a response, replacing any earlier copy for the same request.
  fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()>;

  /// Store a response only if the request has no entry yet.
  fn put_if_absent(&self, partition: &str, request: &Request, response: &Response)
    -> Result<bool>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn ensure_partition(&self, _name: &str, _class: CacheClass, _generation: &str) -> Result<()> {
    Ok(())
  }

  fn partitions(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete_partition(&self, _name: &str) -> Result<bool> {
    Ok(false)
  }

  fn clear_partition(&self, _name: &str) -> Result<usize> {
    Ok(0)
  }

  fn get(&self, _partition: &str, _request: &Request) -> Result<Option<CachedResponse>> {
    Ok(None) // Always miss
  }

  fn put(&self, _partition: &str, _request: &Request, _response: &Response) -> Result<()> {
    Ok(()) // Discard
  }

  fn put_if_absent(
    &self,
    _partition: &str,
    _request: &Request,
    _response: &Response,
  ) -> Result<bool> {
    Ok(false)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  fn insert(
    &self,
    verb: &str,
    partition: &str,
    request: &Request,
    response: &Response,
  ) -> Result<usize> {
    let conn = self.db.conn()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        &format!(
          "{} INTO cache_entries (partition, cache_key, request, status, headers, body, cached_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)",
          verb
        ),
        params![
          partition,
          cache_key(request),
          request.cache_identity(),
          response.status,
          headers,
          response.body,
          Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry in {}: {}", partition, e))
  }
}

impl CacheStorage for SqliteStorage {
  fn ensure_partition(&self, name: &str, class: CacheClass, generation: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_partitions (name, class, generation, created_at)
         VALUES (?, ?, ?, ?)",
        params![
          name,
          class.as_str(),
          generation,
          Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
        ],
      )
      .map_err(|e| eyre!("Failed to create cache partition {}: {}", name, e))?;
    Ok(())
  }

  fn partitions(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_partitions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache partition: {}", e))?;

    Ok(names)
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE partition = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let deleted = tx
      .execute("DELETE FROM cache_partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache partition {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(deleted == 1)
  }

  fn clear_partition(&self, name: &str) -> Result<usize> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "DELETE FROM cache_entries WHERE partition = ?",
        params![name],
      )
      .map_err(|e| eyre!("Failed to clear cache partition {}: {}", name, e))
  }

  fn get(&self, partition: &str, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.db.conn()?;
    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE partition = ? AND cache_key = ?",
        params![partition, cache_key(request)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
        let cached_at = DateTime::parse_from_rfc3339(&cached_at)
          .map(|dt| dt.with_timezone(&Utc))
          .map_err(|e| eyre!("Failed to parse datetime '{}': {}", cached_at, e))?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()> {
    self.insert("INSERT OR REPLACE", partition, request, response)?;
    Ok(())
  }

  fn put_if_absent(
    &self,
    partition: &str,
    request: &Request,
    response: &Response,
  ) -> Result<bool> {
    Ok(self.insert("INSERT OR IGNORE", partition, request, response)? == 1)
  }
}

/// SHA256 of the request identity, for stable fixed-length keys.
fn cache_key(request: &Request) -> String {
  let mut hasher = Sha256::new();
  hasher.update(request.cache_identity().as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  fn request(path: &str) -> Request {
    Request::get(Url::parse("https://journal.test").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_put_and_get() {
    let storage = storage();
    storage
      .ensure_partition("inkwell-api-v1", CacheClass::Api, "v1")
      .unwrap();
    let response = Response::json(200, &serde_json::json!({"prompt": "hi"}));

    storage
      .put("inkwell-api-v1", &request("/api/prompts/daily"), &response)
      .unwrap();

    let cached = storage
      .get("inkwell-api-v1", &request("/api/prompts/daily"))
      .unwrap()
      .unwrap();
    assert_eq!(cached.response, response);
    assert!(storage
      .get("inkwell-api-v1", &request("/api/other"))
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_put_replaces_put_if_absent_keeps() {
    let storage = storage();
    storage
      .ensure_partition("p", CacheClass::Dynamic, "v1")
      .unwrap();
    let req = request("/page");

    storage.put("p", &req, &Response::new(200, "one")).unwrap();
    storage.put("p", &req, &Response::new(200, "two")).unwrap();
    assert!(!storage
      .put_if_absent("p", &req, &Response::new(200, "three"))
      .unwrap());

    let cached = storage.get("p", &req).unwrap().unwrap();
    assert_eq!(cached.response.body, b"two".to_vec());
  }

  #[test]
  fn test_put_into_missing_partition_fails() {
    let storage = storage();
    let result = storage.put("nope", &request("/x"), &Response::new(200, "x"));
    assert!(result.is_err());
  }

  #[test]
  fn test_delete_partition_drops_entries() {
    let storage = storage();
    storage
      .ensure_partition("old", CacheClass::Static, "v0")
      .unwrap();
    storage
      .put("old", &request("/app.js"), &Response::new(200, "js"))
      .unwrap();

    assert!(storage.delete_partition("old").unwrap());
    assert!(storage.partitions().unwrap().is_empty());
    assert!(storage.get("old", &request("/app.js")).unwrap().is_none());
  }

  #[test]
  fn test_noop_storage_always_misses() {
    let storage = NoopStorage;
    storage
      .put("p", &request("/x"), &Response::new(200, "x"))
      .unwrap();
    assert!(storage.get("p", &request("/x")).unwrap().is_none());
  }
}
