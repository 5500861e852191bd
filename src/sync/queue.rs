//! Durable store for writes that could not reach the server.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use url::Url;

use crate::clock::Clock;
use crate::db::Database;
use crate::error::{EngineError, Result};
use crate::http::{Headers, Method, Request};

/// A mutating request captured when its network attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
  pub id: i64,
  pub url: Url,
  pub method: Method,
  pub headers: Headers,
  #[serde(skip)]
  pub body: Vec<u8>,
  pub enqueued_at: DateTime<Utc>,
}

impl SyncQueueItem {
  /// Rebuild the request exactly as it was first attempted.
  pub fn to_request(&self) -> Request {
    Request {
      headers: self.headers.clone(),
      body: self.body.clone(),
      ..Request::new(self.method, self.url.clone())
    }
  }
}

/// Durable FIFO of failed mutating requests.
///
/// Ids come from an AUTOINCREMENT column, so they are never reused and id
/// order is enqueue order. Each enqueue is a single INSERT, committed or not
/// at all.
#[derive(Clone)]
pub struct SyncQueue {
  conn: Arc<Mutex<Connection>>,
  clock: Arc<dyn Clock>,
}

impl SyncQueue {
  pub fn new(db: &Database, clock: Arc<dyn Clock>) -> Self {
    Self {
      conn: db.conn(),
      clock,
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| EngineError::QueuePersistence(format!("Lock poisoned: {}", e)))
  }

  pub fn enqueue(&self, request: &Request) -> Result<SyncQueueItem> {
    if !request.method.is_mutating() {
      return Err(EngineError::NotReplayable(request.method));
    }

    let headers = serde_json::to_string(&request.headers)
      .map_err(|e| EngineError::QueuePersistence(format!("Failed to serialize headers: {}", e)))?;
    let now = self.clock.now();
    let enqueued_at = DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now);

    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO sync_queue (url, method, headers, body, enqueued_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          request.url.as_str(),
          request.method.as_str(),
          headers,
          request.body,
          enqueued_at.timestamp_micros(),
        ],
      )
      .map_err(|e| EngineError::QueuePersistence(format!("Failed to insert queue item: {}", e)))?;

    Ok(SyncQueueItem {
      id: conn.last_insert_rowid(),
      url: request.url.clone(),
      method: request.method,
      headers: request.headers.clone(),
      body: request.body.clone(),
      enqueued_at,
    })
  }

  /// Every queued item, oldest first.
  pub fn dequeue_all(&self) -> Result<Vec<SyncQueueItem>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, headers, body, enqueued_at FROM sync_queue ORDER BY id",
      )
      .map_err(|e| EngineError::QueuePersistence(format!("Failed to prepare query: {}", e)))?;

    let rows: Vec<(i64, String, String, String, Vec<u8>, i64)> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .and_then(|rows| rows.collect())
      .map_err(|e| EngineError::QueuePersistence(format!("Failed to read queue: {}", e)))?;

    rows
      .into_iter()
      .map(|(id, url, method, headers, body, enqueued_at)| {
        let corrupt = |what: &str, detail: String| {
          EngineError::QueuePersistence(format!("Queue item {} has invalid {}: {}", id, what, detail))
        };
        Ok(SyncQueueItem {
          id,
          url: Url::parse(&url).map_err(|e| corrupt("url", e.to_string()))?,
          method: method.parse().map_err(|e| corrupt("method", e))?,
          headers: serde_json::from_str(&headers).map_err(|e| corrupt("headers", e.to_string()))?,
          body,
          enqueued_at: DateTime::from_timestamp_micros(enqueued_at)
            .ok_or_else(|| corrupt("timestamp", enqueued_at.to_string()))?,
        })
      })
      .collect()
  }

  /// Delete one item. Returns false if it was already gone.
  pub fn remove(&self, id: i64) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM sync_queue WHERE id = ?", params![id])
      .map_err(|e| EngineError::QueuePersistence(format!("Failed to remove item {}: {}", id, e)))?;
    Ok(removed > 0)
  }

  pub fn len(&self) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
      .map_err(|e| EngineError::QueuePersistence(format!("Failed to count queue: {}", e)))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}
