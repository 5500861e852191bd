//! Bucketed response store with write serialization and capacity bounds.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::lru;
use super::traits::{Bucket, CacheEntry, CacheKey, CacheStorage};
use super::ttl;
use crate::clock::Clock;
use crate::config::{BucketConfig, BucketsConfig};
use crate::error::{EngineError, Result};
use crate::event::{EngineEvent, EventBus};
use crate::http::Response;

/// Per-bucket view returned by `GET_CACHE_STATS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketStats {
  pub bucket: Bucket,
  pub count: usize,
  pub max_entries: usize,
  pub ttl_secs: Option<u64>,
  pub entries: Vec<EntryStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryStats {
  pub key: CacheKey,
  pub stored_at: DateTime<Utc>,
  pub expired: bool,
}

/// The cache as seen by the rest of the engine.
///
/// Every mutation of a bucket happens under that bucket's write lock, and a
/// put runs its eviction pass before releasing it, so `count <= max_entries`
/// holds whenever the lock is free. Reads never take the write lock.
pub struct CacheStore {
  storage: Arc<dyn CacheStorage>,
  buckets: BucketsConfig,
  clock: Arc<dyn Clock>,
  write_locks: [Mutex<()>; 5],
  last_stamp: Mutex<Option<DateTime<Utc>>>,
  events: EventBus,
}

impl CacheStore {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    buckets: BucketsConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
  ) -> Self {
    Self {
      storage,
      buckets,
      clock,
      write_locks: Default::default(),
      last_stamp: Mutex::new(None),
      events,
    }
  }

  pub fn bucket_config(&self, bucket: Bucket) -> &BucketConfig {
    self.buckets.get(bucket)
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  pub fn is_expired(&self, entry: &CacheEntry, ttl: Option<Duration>) -> bool {
    ttl::is_expired(entry, ttl, self.clock.now())
  }

  pub fn get(&self, bucket: Bucket, key: &CacheKey) -> Result<Option<CacheEntry>> {
    self.storage.get(bucket, key).map_err(EngineError::storage)
  }

  /// Store `response` under `key`, replacing any previous entry, then trim
  /// the bucket back to capacity.
  pub fn put(&self, bucket: Bucket, key: &CacheKey, response: &Response) -> Result<CacheEntry> {
    let _guard = self.lock_bucket(bucket);

    let entry = CacheEntry {
      key: key.clone(),
      bucket,
      status: response.status,
      // Cookies belong to the live exchange, not to replays from cache
      headers: response
        .headers
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case("set-cookie"))
        .cloned()
        .collect(),
      body: response.body.clone(),
      stored_at: self.next_stamp(),
    };
    self.storage.put(&entry).map_err(EngineError::storage)?;

    let max_entries = self.buckets.get(bucket).max_entries;
    let evicted = lru::enforce(self.storage.as_ref(), bucket, max_entries).map_err(EngineError::storage)?;
    if evicted > 0 {
      debug!(%bucket, evicted, "Evicted oldest cache entries");
      self.events.emit(EngineEvent::EntriesEvicted {
        bucket,
        count: evicted,
      });
    }

    Ok(entry)
  }

  pub fn delete(&self, bucket: Bucket, key: &CacheKey) -> Result<bool> {
    let _guard = self.lock_bucket(bucket);
    self.storage.delete(bucket, key).map_err(EngineError::storage)
  }

  pub fn keys(&self, bucket: Bucket) -> Result<Vec<CacheKey>> {
    let mut stamps = self.storage.stamps(bucket).map_err(EngineError::storage)?;
    stamps.sort_by(|a, b| a.stored_at.cmp(&b.stored_at).then_with(|| a.key.cmp(&b.key)));
    Ok(stamps.into_iter().map(|s| s.key).collect())
  }

  pub fn count(&self, bucket: Bucket) -> Result<usize> {
    self.storage.count(bucket).map_err(EngineError::storage)
  }

  pub fn clear(&self, bucket: Bucket) -> Result<usize> {
    let _guard = self.lock_bucket(bucket);
    self.storage.clear(bucket).map_err(EngineError::storage)
  }

  pub fn clear_all(&self) -> Result<usize> {
    Bucket::ALL
      .into_iter()
      .try_fold(0, |total, bucket| Ok(total + self.clear(bucket)?))
  }

  /// Delete every entry that has outlived its own bucket's TTL.
  pub fn cleanup_expired(&self) -> Result<usize> {
    let mut removed = 0;
    for bucket in Bucket::ALL {
      let ttl = self.buckets.get(bucket).ttl();
      if ttl.is_none() {
        continue;
      }

      let _guard = self.lock_bucket(bucket);
      let now = self.clock.now();
      for stamp in self.storage.stamps(bucket).map_err(EngineError::storage)? {
        if ttl::is_stamp_expired(stamp.stored_at, ttl, now)
          && self.storage.delete(bucket, &stamp.key).map_err(EngineError::storage)?
        {
          removed += 1;
        }
      }
    }
    Ok(removed)
  }

  pub fn stats(&self) -> Result<Vec<BucketStats>> {
    let now = self.clock.now();
    Bucket::ALL
      .into_iter()
      .map(|bucket| -> Result<BucketStats> {
        let config = self.buckets.get(bucket);
        let ttl = config.ttl();
        let mut stamps = self.storage.stamps(bucket).map_err(EngineError::storage)?;
        stamps.sort_by(|a, b| a.stored_at.cmp(&b.stored_at).then_with(|| a.key.cmp(&b.key)));
        Ok(BucketStats {
          bucket,
          count: stamps.len(),
          max_entries: config.max_entries,
          ttl_secs: config.ttl_secs,
          entries: stamps
            .into_iter()
            .map(|s| EntryStats {
              expired: ttl::is_stamp_expired(s.stored_at, ttl, now),
              key: s.key,
              stored_at: s.stored_at,
            })
            .collect(),
        })
      })
      .collect()
  }

  pub fn purge_other_versions(&self) -> Result<usize> {
    self
      .storage
      .purge_other_versions()
      .map_err(EngineError::storage)
  }

  fn lock_bucket(&self, bucket: Bucket) -> MutexGuard<'_, ()> {
    // Poisoning is ignored; the next put re-runs eviction
    self.write_locks[bucket.index()]
      .lock()
      .unwrap_or_else(|e| e.into_inner())
  }

  /// Strictly increasing write time at microsecond precision.
  fn next_stamp(&self) -> DateTime<Utc> {
    let now = self.clock.now();
    let now = DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now);

    let mut last = self.last_stamp.lock().unwrap_or_else(|e| e.into_inner());
    let stamp = match *last {
      Some(prev) if now <= prev => prev + Duration::microseconds(1),
      _ => now,
    };
    *last = Some(stamp);
    stamp
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{MemoryStorage, SqliteStorage};
  use crate::clock::{ManualClock, SystemClock};
  use crate::db::Database;
  use url::Url;

  fn key(path: &str) -> CacheKey {
    CacheKey::for_url(&Url::parse(&format!("https://myth.example{}", path)).unwrap())
  }

  fn ok(body: &str) -> Response {
    Response::new(200, vec![], body.as_bytes().to_vec())
  }

  fn buckets_with_images(max_entries: usize) -> BucketsConfig {
    let mut buckets = BucketsConfig::default();
    buckets.images = BucketConfig {
      max_entries,
      ttl_secs: Some(60),
    };
    buckets
  }

  fn memory_store(buckets: BucketsConfig, clock: Arc<dyn Clock>) -> CacheStore {
    CacheStore::new(
      Arc::new(MemoryStorage::new()),
      buckets,
      clock,
      EventBus::default(),
    )
  }

  #[test]
  fn test_lru_keeps_newest_three() {
    let clock = Arc::new(ManualClock::default());
    let store = memory_store(buckets_with_images(3), clock.clone());

    for i in 1..=4 {
      store
        .put(Bucket::Images, &key(&format!("/img/{}.png", i)), &ok("png"))
        .unwrap();
      clock.advance(Duration::seconds(1));
    }

    assert_eq!(store.count(Bucket::Images).unwrap(), 3);
    assert!(store.get(Bucket::Images, &key("/img/1.png")).unwrap().is_none());
    for i in 2..=4 {
      assert!(store
        .get(Bucket::Images, &key(&format!("/img/{}.png", i)))
        .unwrap()
        .is_some());
    }
  }

  #[test]
  fn test_same_instant_writes_still_order() {
    // The clock never moves, stamps must still be distinct and increasing
    let clock = Arc::new(ManualClock::default());
    let store = memory_store(buckets_with_images(2), clock);

    let a = store.put(Bucket::Images, &key("/a.png"), &ok("a")).unwrap();
    let b = store.put(Bucket::Images, &key("/b.png"), &ok("b")).unwrap();
    assert!(b.stored_at > a.stored_at);

    store.put(Bucket::Images, &key("/c.png"), &ok("c")).unwrap();
    assert_eq!(
      store.keys(Bucket::Images).unwrap(),
      vec![key("/b.png"), key("/c.png")]
    );
  }

  #[test]
  fn test_overwrite_replaces_entry() {
    let clock = Arc::new(ManualClock::default());
    let store = memory_store(BucketsConfig::default(), clock.clone());

    let first = store.put(Bucket::Dynamic, &key("/api/gods"), &ok("v1")).unwrap();
    clock.advance(Duration::seconds(10));
    let second = store.put(Bucket::Dynamic, &key("/api/gods"), &ok("v2")).unwrap();

    let stored = store.get(Bucket::Dynamic, &key("/api/gods")).unwrap().unwrap();
    assert_eq!(stored.body, b"v2");
    assert_eq!(stored.stored_at, second.stored_at);
    assert!(second.stored_at > first.stored_at);
    assert_eq!(store.count(Bucket::Dynamic).unwrap(), 1);
  }

  #[test]
  fn test_concurrent_puts_respect_capacity() {
    let db = Database::open_in_memory().unwrap();
    let store = Arc::new(CacheStore::new(
      Arc::new(SqliteStorage::new(&db, "v1")),
      buckets_with_images(5),
      Arc::new(SystemClock),
      EventBus::default(),
    ));

    let handles: Vec<_> = (0..8)
      .map(|t| {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
          for i in 0..25 {
            store
              .put(Bucket::Images, &key(&format!("/img/{}-{}.png", t, i)), &ok("x"))
              .unwrap();
            assert!(store.count(Bucket::Images).unwrap() <= 5 + 8);
          }
        })
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }

    assert_eq!(store.count(Bucket::Images).unwrap(), 5);
  }

  #[test]
  fn test_cleanup_uses_each_bucket_ttl() {
    let clock = Arc::new(ManualClock::default());
    let mut buckets = BucketsConfig::default();
    buckets.pages.ttl_secs = Some(60);
    buckets.images.ttl_secs = Some(3600);
    buckets.fonts.ttl_secs = None;
    let store = memory_store(buckets, clock.clone());

    store.put(Bucket::Pages, &key("/"), &ok("home")).unwrap();
    store.put(Bucket::Images, &key("/zeus.png"), &ok("img")).unwrap();
    store.put(Bucket::Fonts, &key("/serif.woff2"), &ok("font")).unwrap();

    clock.advance(Duration::seconds(120));
    assert_eq!(store.cleanup_expired().unwrap(), 1);
    assert!(store.get(Bucket::Pages, &key("/")).unwrap().is_none());
    assert!(store.get(Bucket::Images, &key("/zeus.png")).unwrap().is_some());

    clock.advance(Duration::days(365));
    assert_eq!(store.cleanup_expired().unwrap(), 1);
    assert!(store.get(Bucket::Fonts, &key("/serif.woff2")).unwrap().is_some());

    // Repeating the sweep changes nothing
    assert_eq!(store.cleanup_expired().unwrap(), 0);
  }

  #[test]
  fn test_stats_report_capacity_and_stamps() {
    let clock = Arc::new(ManualClock::default());
    let store = memory_store(buckets_with_images(3), clock);

    let entry = store.put(Bucket::Images, &key("/odin.png"), &ok("img")).unwrap();
    let stats = store.stats().unwrap();
    assert_eq!(stats.len(), Bucket::ALL.len());

    let images = stats.iter().find(|s| s.bucket == Bucket::Images).unwrap();
    assert_eq!(images.count, 1);
    assert_eq!(images.max_entries, 3);
    assert_eq!(images.entries[0].key, key("/odin.png"));
    assert_eq!(images.entries[0].stored_at, entry.stored_at);
    assert!(!images.entries[0].expired);
  }

  #[test]
  fn test_clear_all() {
    let store = memory_store(BucketsConfig::default(), Arc::new(SystemClock));
    store.put(Bucket::Static, &key("/app.js"), &ok("js")).unwrap();
    store.put(Bucket::Pages, &key("/"), &ok("home")).unwrap();

    assert_eq!(store.clear_all().unwrap(), 2);
    assert_eq!(store.clear_all().unwrap(), 0);
  }
}
