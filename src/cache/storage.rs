//! Cache storage implementations: in-memory and SQLite.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use super::traits::{Bucket, CacheEntry, CacheKey, CacheStorage, EntryStamp};
use crate::db::Database;
use crate::http::Headers;

/// Storage that keeps every bucket in process memory.
///
/// Each bucket has its own lock, so work on one bucket never waits on another.
pub struct MemoryStorage {
  buckets: [RwLock<HashMap<CacheKey, CacheEntry>>; 5],
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self {
      buckets: Default::default(),
    }
  }

  fn bucket(&self, bucket: Bucket) -> &RwLock<HashMap<CacheKey, CacheEntry>> {
    &self.buckets[bucket.index()]
  }
}

impl Default for MemoryStorage {
  fn default() -> Self {
    Self::new()
  }
}

impl CacheStorage for MemoryStorage {
  fn get(&self, bucket: Bucket, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let map = self
      .bucket(bucket)
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(map.get(key).cloned())
  }

  fn put(&self, entry: &CacheEntry) -> Result<()> {
    let mut map = self
      .bucket(entry.bucket)
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    map.insert(entry.key.clone(), entry.clone());
    Ok(())
  }

  fn delete(&self, bucket: Bucket, key: &CacheKey) -> Result<bool> {
    let mut map = self
      .bucket(bucket)
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(map.remove(key).is_some())
  }

  fn stamps(&self, bucket: Bucket) -> Result<Vec<EntryStamp>> {
    let map = self
      .bucket(bucket)
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      map
        .values()
        .map(|e| EntryStamp {
          key: e.key.clone(),
          stored_at: e.stored_at,
        })
        .collect(),
    )
  }

  fn count(&self, bucket: Bucket) -> Result<usize> {
    let map = self
      .bucket(bucket)
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(map.len())
  }

  fn clear(&self, bucket: Bucket) -> Result<usize> {
    let mut map = self
      .bucket(bucket)
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let removed = map.len();
    map.clear();
    Ok(removed)
  }
}

/// SQLite-based cache storage implementation.
///
/// All rows are tagged with the cache version they were written under, so a
/// new deployment can drop the previous generation in one statement.
pub struct SqliteStorage {
  conn: Arc<Mutex<Connection>>,
  version: String,
}

impl SqliteStorage {
  pub fn new(db: &Database, version: impl Into<String>) -> Self {
    Self {
      conn: db.conn(),
      version: version.into(),
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for SqliteStorage {
  fn get(&self, bucket: Bucket, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, i64)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM cache_entries
         WHERE version = ? AND bucket = ? AND key_hash = ?",
        params![self.version, bucket.as_str(), key.digest()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers: Headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;
        Ok(Some(CacheEntry {
          key: key.clone(),
          bucket,
          status,
          headers,
          body,
          stored_at: from_micros(stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, entry: &CacheEntry) -> Result<()> {
    let conn = self.lock()?;
    let headers =
      serde_json::to_string(&entry.headers).map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (version, bucket, key_hash, cache_key, status, headers, body, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          self.version,
          entry.bucket.as_str(),
          entry.key.digest(),
          entry.key.as_str(),
          entry.status,
          headers,
          entry.body,
          entry.stored_at.timestamp_micros(),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", entry.key, e))?;

    Ok(())
  }

  fn delete(&self, bucket: Bucket, key: &CacheKey) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE version = ? AND bucket = ? AND key_hash = ?",
        params![self.version, bucket.as_str(), key.digest()],
      )
      .map_err(|e| eyre!("Failed to delete cache entry {}: {}", key, e))?;
    Ok(removed > 0)
  }

  fn stamps(&self, bucket: Bucket) -> Result<Vec<EntryStamp>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT cache_key, stored_at FROM cache_entries
         WHERE version = ? AND bucket = ?
         ORDER BY stored_at",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, i64)> = stmt
      .query_map(params![self.version, bucket.as_str()], |row| {
        Ok((row.get(0)?, row.get(1)?))
      })
      .map_err(|e| eyre!("Failed to list bucket {}: {}", bucket, e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read bucket {}: {}", bucket, e))?;

    rows
      .into_iter()
      .map(|(key, stored_at)| {
        Ok(EntryStamp {
          key: CacheKey::from_raw(key),
          stored_at: from_micros(stored_at)?,
        })
      })
      .collect()
  }

  fn count(&self, bucket: Bucket) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE version = ? AND bucket = ?",
        params![self.version, bucket.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count bucket {}: {}", bucket, e))?;
    Ok(count as usize)
  }

  fn clear(&self, bucket: Bucket) -> Result<usize> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE version = ? AND bucket = ?",
        params![self.version, bucket.as_str()],
      )
      .map_err(|e| eyre!("Failed to clear bucket {}: {}", bucket, e))?;
    Ok(removed)
  }

  fn purge_other_versions(&self) -> Result<usize> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE version <> ?",
        params![self.version],
      )
      .map_err(|e| eyre!("Failed to purge old cache versions: {}", e))?;
    Ok(removed)
  }
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_micros(micros).ok_or_else(|| eyre!("Invalid stored_at value: {}", micros))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use url::Url;

  fn entry(bucket: Bucket, url: &str, stored_at: DateTime<Utc>) -> CacheEntry {
    CacheEntry {
      key: CacheKey::for_url(&Url::parse(url).unwrap()),
      bucket,
      status: 200,
      headers: vec![("content-type".into(), "text/html".into())],
      body: format!("body of {}", url).into_bytes(),
      stored_at,
    }
  }

  fn exercise(storage: &dyn CacheStorage) {
    let now = DateTime::from_timestamp_micros(Utc::now().timestamp_micros()).unwrap();
    let a = entry(Bucket::Pages, "https://myth.example/a", now);
    let b = entry(Bucket::Pages, "https://myth.example/b", now + Duration::seconds(1));
    let img = entry(Bucket::Images, "https://myth.example/a", now);

    storage.put(&a).unwrap();
    storage.put(&b).unwrap();
    storage.put(&img).unwrap();

    assert_eq!(storage.get(Bucket::Pages, &a.key).unwrap(), Some(a.clone()));
    assert_eq!(storage.count(Bucket::Pages).unwrap(), 2);
    assert_eq!(storage.count(Bucket::Images).unwrap(), 1);

    let mut stamps = storage.stamps(Bucket::Pages).unwrap();
    stamps.sort_by_key(|s| s.stored_at);
    assert_eq!(stamps[0].key, a.key);
    assert_eq!(stamps[1].stored_at, b.stored_at);

    // Overwrite replaces the whole entry
    let mut refreshed = a.clone();
    refreshed.body = b"new".to_vec();
    refreshed.stored_at = now + Duration::seconds(5);
    storage.put(&refreshed).unwrap();
    assert_eq!(storage.get(Bucket::Pages, &a.key).unwrap(), Some(refreshed));
    assert_eq!(storage.count(Bucket::Pages).unwrap(), 2);

    assert!(storage.delete(Bucket::Pages, &a.key).unwrap());
    assert!(!storage.delete(Bucket::Pages, &a.key).unwrap());

    assert_eq!(storage.clear(Bucket::Pages).unwrap(), 1);
    assert_eq!(storage.count(Bucket::Pages).unwrap(), 0);
    // Other buckets untouched
    assert_eq!(storage.count(Bucket::Images).unwrap(), 1);
  }

  #[test]
  fn test_memory_storage() {
    exercise(&MemoryStorage::new());
  }

  #[test]
  fn test_sqlite_storage() {
    let db = Database::open_in_memory().unwrap();
    exercise(&SqliteStorage::new(&db, "v1"));
  }

  #[test]
  fn test_sqlite_versions_are_isolated() {
    let db = Database::open_in_memory().unwrap();
    let old = SqliteStorage::new(&db, "v1");
    let new = SqliteStorage::new(&db, "v2");

    let e = entry(Bucket::Static, "https://myth.example/app.js", Utc::now());
    old.put(&e).unwrap();
    assert_eq!(new.get(Bucket::Static, &e.key).unwrap(), None);

    assert_eq!(new.purge_other_versions().unwrap(), 1);
    assert_eq!(old.count(Bucket::Static).unwrap(), 0);
  }
}
