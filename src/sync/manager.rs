//! Replays the sync queue when connectivity returns.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::queue::{SyncQueue, SyncQueueItem};
use crate::error::{EngineError, Result};
use crate::event::{EngineEvent, EventBus};
use crate::network::Fetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
  Idle,
  Syncing,
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
  pub synced: usize,
  pub total: usize,
}

/// Drains the sync queue: Idle -> Syncing -> Idle.
///
/// Items are replayed one at a time in enqueue order. Successful replays are
/// removed; anything else stays queued for the next trigger.
pub struct BackgroundSyncManager {
  queue: SyncQueue,
  fetcher: Arc<dyn Fetcher>,
  timeout: Duration,
  syncing: AtomicBool,
  events: EventBus,
}

/// Resets the state flag even if the pass is cancelled midway.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

impl BackgroundSyncManager {
  pub fn new(
    queue: SyncQueue,
    fetcher: Arc<dyn Fetcher>,
    timeout: Duration,
    events: EventBus,
  ) -> Self {
    Self {
      queue,
      fetcher,
      timeout,
      syncing: AtomicBool::new(false),
      events,
    }
  }

  pub fn state(&self) -> SyncState {
    if self.syncing.load(Ordering::Acquire) {
      SyncState::Syncing
    } else {
      SyncState::Idle
    }
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  /// Run one pass. Returns `None` when a pass is already running.
  pub async fn sync(&self) -> Result<Option<SyncSummary>> {
    if self
      .syncing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("Sync already in progress, ignoring trigger");
      return Ok(None);
    }
    let _guard = SyncingGuard(&self.syncing);

    let items = self.queue.dequeue_all()?;
    let total = items.len();
    let mut synced = 0;

    for item in &items {
      match self.replay(item).await {
        Ok(()) => {
          // The server already has it; a stuck row only means a repeat next pass
          if let Err(e) = self.queue.remove(item.id) {
            warn!(id = item.id, error = %e, "Replayed item could not be removed from the queue");
          }
          synced += 1;
        }
        Err(e) => warn!(id = item.id, error = %e, "Replay failed, keeping item queued"),
      }
    }

    let summary = SyncSummary { synced, total };
    if total > 0 {
      info!(synced, total, "Background sync finished");
    }
    self.events.emit(EngineEvent::SyncCompleted { synced, total });
    Ok(Some(summary))
  }

  async fn replay(&self, item: &SyncQueueItem) -> Result<()> {
    let request = item.to_request();
    let response = tokio::time::timeout(self.timeout, self.fetcher.fetch(&request))
      .await
      .map_err(|_| EngineError::Replay {
        id: item.id,
        reason: format!("timed out after {}ms", self.timeout.as_millis()),
      })?
      .map_err(|e| EngineError::Replay {
        id: item.id,
        reason: e.to_string(),
      })?;

    if response.is_success() {
      debug!(id = item.id, method = %item.method, url = %item.url, "Replayed queued request");
      Ok(())
    } else {
      Err(EngineError::Replay {
        id: item.id,
        reason: format!("server answered {}", response.status),
      })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::SystemClock;
  use crate::db::Database;
  use crate::http::{Method, Request};
  use crate::testing::MockFetcher;
  use url::Url;

  fn setup() -> (Arc<MockFetcher>, BackgroundSyncManager, EventBus) {
    let fetcher = Arc::new(MockFetcher::new());
    let events = EventBus::default();
    let manager = BackgroundSyncManager::new(
      SyncQueue::new(&Database::open_in_memory().unwrap(), Arc::new(SystemClock)),
      fetcher.clone(),
      Duration::from_millis(200),
      events.clone(),
    );
    (fetcher, manager, events)
  }

  fn post(path: &str, body: &str) -> Request {
    Request::new(
      Method::Post,
      Url::parse(&format!("https://myth.example{}", path)).unwrap(),
    )
    .with_body(body)
  }

  #[tokio::test]
  async fn test_partial_replay_keeps_failed_item() {
    let (fetcher, manager, events) = setup();
    let mut rx = events.subscribe();

    manager.queue().enqueue(&post("/api/submit", "first")).unwrap();
    let second = manager.queue().enqueue(&post("/api/vote", "second")).unwrap();
    fetcher.reply("https://myth.example/api/submit", 201, "ok");
    fetcher.fail("https://myth.example/api/vote");

    let summary = manager.sync().await.unwrap();
    assert_eq!(summary, Some(SyncSummary { synced: 1, total: 2 }));
    assert_eq!(manager.queue().dequeue_all().unwrap(), vec![second]);
    assert_eq!(manager.state(), SyncState::Idle);
    assert_eq!(
      rx.recv().await.unwrap(),
      EngineEvent::SyncCompleted { synced: 1, total: 2 }
    );
  }

  #[tokio::test]
  async fn test_replays_in_order_with_original_body() {
    let (fetcher, manager, _) = setup();
    fetcher.reply("https://myth.example/api/a", 200, "");
    fetcher.reply("https://myth.example/api/b", 200, "");
    manager.queue().enqueue(&post("/api/a", "1")).unwrap();
    manager.queue().enqueue(&post("/api/b", "2")).unwrap();

    manager.sync().await.unwrap();

    let calls = fetcher.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].url.path(), "/api/a");
    assert_eq!(calls[0].body, b"1");
    assert_eq!(calls[1].url.path(), "/api/b");
    assert!(manager.queue().is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_error_status_stays_queued() {
    let (fetcher, manager, _) = setup();
    fetcher.reply("https://myth.example/api/submit", 500, "boom");
    manager.queue().enqueue(&post("/api/submit", "x")).unwrap();

    let summary = manager.sync().await.unwrap().unwrap();
    assert_eq!(summary, SyncSummary { synced: 0, total: 1 });
    assert_eq!(manager.queue().len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_trigger_is_ignored() {
    let (fetcher, manager, _) = setup();
    fetcher.reply("https://myth.example/api/slow", 200, "");
    fetcher.delay("https://myth.example/api/slow", Duration::from_millis(50));
    manager.queue().enqueue(&post("/api/slow", "")).unwrap();

    let (first, second) = tokio::join!(manager.sync(), manager.sync());
    let results = [first.unwrap(), second.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_none()).count(), 1);
    assert_eq!(fetcher.call_count(Method::Post, "https://myth.example/api/slow"), 1);
  }

  #[tokio::test]
  async fn test_remove_failure_does_not_abort_pass() {
    let db = Database::open_in_memory().unwrap();
    let fetcher = Arc::new(MockFetcher::new());
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let manager = BackgroundSyncManager::new(
      SyncQueue::new(&db, Arc::new(SystemClock)),
      fetcher.clone(),
      Duration::from_millis(200),
      events.clone(),
    );
    fetcher.reply("https://myth.example/api/a", 200, "");
    fetcher.reply("https://myth.example/api/b", 200, "");
    manager.queue().enqueue(&post("/api/a", "1")).unwrap();
    manager.queue().enqueue(&post("/api/b", "2")).unwrap();

    db.conn()
      .lock()
      .unwrap()
      .execute_batch(
        "CREATE TRIGGER keep_queue BEFORE DELETE ON sync_queue
         BEGIN SELECT RAISE(ABORT, 'read only'); END;",
      )
      .unwrap();

    let summary = manager.sync().await.unwrap();
    assert_eq!(summary, Some(SyncSummary { synced: 2, total: 2 }));
    assert_eq!(fetcher.calls().len(), 2);
    assert_eq!(manager.queue().len().unwrap(), 2);
    assert_eq!(manager.state(), SyncState::Idle);
    assert_eq!(
      rx.recv().await.unwrap(),
      EngineEvent::SyncCompleted { synced: 2, total: 2 }
    );
  }
}
