//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};

use super::traits::CacheEntry;
use crate::db::{Database, PoisonedLock};
use crate::endpoint::EndpointKey;

/// Error raised by a cache storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error(transparent)]
  Lock(#[from] PoisonedLock),

  #[error("invalid timestamp {0} in cache row")]
  Timestamp(i64),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Get the cached response for an endpoint.
  fn get(&self, key: &EndpointKey) -> StoreResult<Option<CacheEntry>>;

  /// Store a response, replacing any previous entry for the same key.
  fn set(&self, key: &EndpointKey, payload: &[u8]) -> StoreResult<()>;

  /// Remove every entry.
  fn clear_all(&self) -> StoreResult<()>;

  /// Number of cached endpoints.
  fn len(&self) -> StoreResult<usize>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get(&self, _key: &EndpointKey) -> StoreResult<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &EndpointKey, _payload: &[u8]) -> StoreResult<()> {
    Ok(()) // Discard
  }

  fn clear_all(&self) -> StoreResult<()> {
    Ok(())
  }

  fn len(&self) -> StoreResult<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteStorage {
  fn get(&self, key: &EndpointKey) -> StoreResult<Option<CacheEntry>> {
    let conn = self.db.lock()?;

    let row: Option<(Vec<u8>, i64)> = conn
      .query_row(
        "SELECT payload, stored_at FROM response_cache WHERE key_hash = ?",
        params![key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    match row {
      Some((payload, stored_at)) => Ok(Some(CacheEntry {
        key: key.clone(),
        payload,
        stored_at: millis_to_datetime(stored_at)?,
      })),
      None => Ok(None),
    }
  }

  fn set(&self, key: &EndpointKey, payload: &[u8]) -> StoreResult<()> {
    let conn = self.db.lock()?;

    conn.execute(
      "INSERT OR REPLACE INTO response_cache (key_hash, endpoint, payload, stored_at)
       VALUES (?, ?, ?, ?)",
      params![
        key.cache_hash(),
        key.as_str(),
        payload,
        Utc::now().timestamp_millis()
      ],
    )?;

    Ok(())
  }

  fn clear_all(&self) -> StoreResult<()> {
    let conn = self.db.lock()?;
    conn.execute("DELETE FROM response_cache", [])?;
    Ok(())
  }

  fn len(&self) -> StoreResult<usize> {
    let conn = self.db.lock()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM response_cache", [], |row| row.get(0))?;
    Ok(count as usize)
  }
}

fn millis_to_datetime(millis: i64) -> StoreResult<DateTime<Utc>> {
  Utc
    .timestamp_millis_opt(millis)
    .single()
    .ok_or(StoreError::Timestamp(millis))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Database::open_in_memory().unwrap())
  }

  #[test]
  fn test_get_missing_key() {
    let storage = storage();
    assert!(storage.get(&EndpointKey::new("/work-hours")).unwrap().is_none());
  }

  #[test]
  fn test_set_overwrites_by_key() {
    let storage = storage();
    let key = EndpointKey::new("/work-hours");

    storage.set(&key, b"first").unwrap();
    storage.set(&key, b"second").unwrap();

    let entry = storage.get(&key).unwrap().unwrap();
    assert_eq!(entry.payload, b"second");
    assert_eq!(entry.key, key);
    assert_eq!(storage.len().unwrap(), 1);
  }

  #[test]
  fn test_equivalent_queries_share_an_entry() {
    let storage = storage();
    storage
      .set(&EndpointKey::new("/cpd-hours?year=2024&page=1"), b"page one")
      .unwrap();

    let entry = storage
      .get(&EndpointKey::new("/cpd-hours?page=1&year=2024"))
      .unwrap()
      .unwrap();
    assert_eq!(entry.payload, b"page one");
  }

  #[test]
  fn test_clear_all() {
    let storage = storage();
    storage.set(&EndpointKey::new("/a"), b"1").unwrap();
    storage.set(&EndpointKey::new("/b"), b"2").unwrap();

    storage.clear_all().unwrap();

    assert_eq!(storage.len().unwrap(), 0);
  }

  #[test]
  fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");
    let key = EndpointKey::new("/appraisals");

    SqliteStorage::new(Database::open(&path).unwrap())
      .set(&key, b"{\"success\":true}")
      .unwrap();

    let reopened = SqliteStorage::new(Database::open(&path).unwrap());
    let entry = reopened.get(&key).unwrap().unwrap();
    assert_eq!(entry.payload, b"{\"success\":true}");
  }

  #[test]
  fn test_noop_storage_always_misses() {
    let key = EndpointKey::new("/a");
    NoopStorage.set(&key, b"1").unwrap();
    assert!(NoopStorage.get(&key).unwrap().is_none());
  }
}
