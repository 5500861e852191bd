//! Engine notifications fanned out to subscribers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::cache::Bucket;
use crate::http::Method;
use crate::notification::Notification;

/// Engine events observers can subscribe to
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
  /// A background sync pass finished
  SyncCompleted { synced: usize, total: usize },
  /// A failed mutating request was stored for replay
  RequestQueued { id: i64, method: Method, url: String },
  /// A background refresh wrote a new entry
  CacheRefreshed { bucket: Bucket, key: String },
  /// A write pushed a bucket over capacity
  EntriesEvicted { bucket: Bucket, count: usize },
  /// A push payload ready for display
  Notification(Notification),
}

/// Fan-out channel for engine events.
///
/// Sending never blocks; events are dropped when nobody is listening and
/// slow receivers observe `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
  tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn emit(&self, event: EngineEvent) {
    let _ = self.tx.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
    self.tx.subscribe()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(64)
  }
}
