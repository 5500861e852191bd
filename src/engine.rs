//! The engine instance that owns every component and answers intercepted
//! requests, control messages, sync triggers and push payloads.

use color_eyre::Result as EyreResult;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{Bucket, BucketStats, CacheStorage, CacheStore, MemoryStorage, SqliteStorage};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, StorageBackend};
use crate::control::{ControlCommand, ControlResponse};
use crate::db::Database;
use crate::error::{EngineError, Result};
use crate::event::{EngineEvent, EventBus};
use crate::http::{Request, Response};
use crate::network::Fetcher;
use crate::notification::Notification;
use crate::offline::FallbackDocuments;
use crate::routing::RouteMatcher;
use crate::strategy::StrategyExecutor;
use crate::sync::{BackgroundSyncManager, SyncQueue, SyncState, SyncSummary};

/// Parallel fetches when warming or precaching
const PREFETCH_CONCURRENCY: usize = 4;

/// Lifecycle: Installed -> Active -> ShutDown.
///
/// An installed engine already serves requests; activation only drops the
/// cache generations left behind by other versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
  Installed,
  Active,
  ShutDown,
}

pub struct CacheEngine {
  config: Config,
  store: Arc<CacheStore>,
  router: RouteMatcher,
  executor: StrategyExecutor,
  fallbacks: FallbackDocuments,
  sync: BackgroundSyncManager,
  events: EventBus,
  state: Mutex<EngineState>,
}

impl CacheEngine {
  pub fn new(config: Config, fetcher: Arc<dyn Fetcher>, db: &Database) -> EyreResult<Self> {
    Self::with_clock(config, fetcher, db, Arc::new(SystemClock))
  }

  /// Build the engine and pre-load the fallback documents into the pages
  /// bucket. Nothing touches the network until [`CacheEngine::install`].
  pub fn with_clock(
    config: Config,
    fetcher: Arc<dyn Fetcher>,
    db: &Database,
    clock: Arc<dyn Clock>,
  ) -> EyreResult<Self> {
    config.validate()?;

    let storage: Arc<dyn CacheStorage> = match config.storage.backend {
      StorageBackend::Sqlite => Arc::new(SqliteStorage::new(db, config.version.clone())),
      StorageBackend::Memory => Arc::new(MemoryStorage::new()),
    };
    let events = EventBus::default();
    let store = Arc::new(CacheStore::new(
      storage,
      config.buckets.clone(),
      Arc::clone(&clock),
      events.clone(),
    ));
    let router = RouteMatcher::new(&config)?;
    let executor = StrategyExecutor::new(
      Arc::clone(&store),
      Arc::clone(&fetcher),
      config.network_timeout(),
      events.clone(),
    );
    let sync = BackgroundSyncManager::new(
      SyncQueue::new(db, clock),
      fetcher,
      config.network_timeout(),
      events.clone(),
    );

    let fallbacks = FallbackDocuments::from_config(&config)?;
    let preloaded = fallbacks.preload(&store)?;
    debug!(preloaded, version = %config.version, "Engine created");

    Ok(Self {
      config,
      store,
      router,
      executor,
      fallbacks,
      sync,
      events,
      state: Mutex::new(EngineState::Installed),
    })
  }

  /// Fetch the precache list into the static bucket. Individual failures are
  /// logged and skipped. Returns how many URLs were stored.
  pub async fn install(&self) -> Result<usize> {
    self.ensure_running()?;
    let urls = self.config.precache.clone();
    let stored = self.fetch_all(&urls, |_| Some(Bucket::Static)).await;
    info!(stored, total = urls.len(), "Precache finished");
    Ok(stored)
  }

  /// Drop entries written by other versions and start serving as Active.
  pub fn activate(&self) -> Result<usize> {
    self.ensure_running()?;
    let purged = self.store.purge_other_versions()?;
    self.set_state(EngineState::Active);
    info!(version = %self.config.version, purged, "Engine activated");
    Ok(purged)
  }

  pub fn state(&self) -> EngineState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  pub fn queue(&self) -> &SyncQueue {
    self.sync.queue()
  }

  pub fn sync_state(&self) -> SyncState {
    self.sync.state()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
    self.events.subscribe()
  }

  /// Answer one intercepted request.
  ///
  /// Only a failure the cache can't cover is returned as an error; failed
  /// mutating requests come back as a 202 "queued" acknowledgment.
  pub async fn handle(&self, request: Request) -> Result<Response> {
    self.ensure_running()?;
    let (rule, policy) = self.router.resolve(&request);
    debug!(method = %request.method, url = %request.url, rule, strategy = %policy.strategy, "Routing request");

    if self.router.is_auth_endpoint(&request) {
      return self.executor.fetch(&request).await;
    }

    // Third-party writes are passed through untouched
    if request.method.is_mutating() && self.router.in_scope(&request) {
      return match self.executor.fetch(&request).await {
        Ok(response) => Ok(response),
        Err(err) if err.is_network() => self.queue_for_replay(&request, err),
        Err(err) => Err(err),
      };
    }

    if request.is_navigation() && self.router.in_scope(&request) {
      return Ok(self.executor.navigate(&request, &policy, &self.fallbacks).await);
    }

    self.executor.execute(&request, &policy).await
  }

  fn queue_for_replay(&self, request: &Request, cause: EngineError) -> Result<Response> {
    let item = self.sync.queue().enqueue(request).map_err(|e| {
      warn!(url = %request.url, error = %e, "Could not queue failed request");
      e
    })?;
    info!(id = item.id, method = %item.method, url = %item.url, cause = %cause, "Queued request for background sync");
    self.events.emit(EngineEvent::RequestQueued {
      id: item.id,
      method: item.method,
      url: item.url.to_string(),
    });
    Ok(Response::queued(item.id))
  }

  /// Run one control command. Failures are reported as `ERROR` responses.
  pub async fn handle_control(&self, command: ControlCommand) -> ControlResponse {
    debug!(command = command.name(), "Control command");
    match self.run_control(command).await {
      Ok(response) => response,
      Err(err) => {
        warn!(error = %err, "Control command failed");
        err.into()
      }
    }
  }

  async fn run_control(&self, command: ControlCommand) -> Result<ControlResponse> {
    self.ensure_running()?;
    Ok(match command {
      ControlCommand::SkipWaiting => ControlResponse::Activated {
        purged: self.activate()?,
      },
      ControlCommand::ClearCache => ControlResponse::CacheCleared {
        removed: self.store.clear_all()?,
      },
      ControlCommand::ClearCacheType { cache_type } => {
        let bucket: Bucket = cache_type.parse()?;
        ControlResponse::CacheTypeCleared {
          cache_type: bucket,
          removed: self.store.clear(bucket)?,
        }
      }
      ControlCommand::CacheUrls { urls, cache_type } => {
        let bucket = match cache_type {
          Some(name) => name.parse::<Bucket>()?,
          None => Bucket::Dynamic,
        };
        ControlResponse::CacheComplete {
          count: self.fetch_all(&urls, |_| Some(bucket)).await,
        }
      }
      ControlCommand::WarmCache { urls } => ControlResponse::CacheComplete {
        count: self
          .fetch_all(&urls, |request| self.router.match_request(request).bucket)
          .await,
      },
      ControlCommand::GetVersion => ControlResponse::VersionInfo {
        version: self.config.version.clone(),
        buckets: Bucket::ALL
          .iter()
          .map(|b| format!("{}-{}", b, self.config.version))
          .collect(),
      },
      ControlCommand::GetCacheStats => ControlResponse::CacheStats {
        per_bucket: self.stats()?,
      },
      ControlCommand::CleanupExpired => ControlResponse::CleanupComplete {
        removed: self.cleanup_expired()?,
      },
    })
  }

  pub fn stats(&self) -> Result<Vec<BucketStats>> {
    self.store.stats()
  }

  pub fn cleanup_expired(&self) -> Result<usize> {
    let removed = self.store.cleanup_expired()?;
    if removed > 0 {
      info!(removed, "Removed expired cache entries");
    }
    Ok(removed)
  }

  /// Fetch each URL into the bucket chosen for it, a few at a time. Returns
  /// how many were stored. Authentication endpoints and URLs without a bucket
  /// are skipped.
  async fn fetch_all(
    &self,
    urls: &[String],
    bucket_for: impl Fn(&Request) -> Option<Bucket>,
  ) -> usize {
    use futures::StreamExt;

    let requests: Vec<(Request, Bucket)> = urls
      .iter()
      .filter_map(|raw| match self.config.resolve_url(raw) {
        Ok(url) => Some(Request::get(url)),
        Err(e) => {
          warn!(url = %raw, error = %e, "Skipping URL");
          None
        }
      })
      .filter_map(|request| {
        if self.router.is_auth_endpoint(&request) {
          warn!(url = %request.url, "Refusing to cache authentication endpoint");
          return None;
        }
        match bucket_for(&request) {
          Some(bucket) => Some((request, bucket)),
          None => {
            debug!(url = %request.url, "No cache bucket for URL, skipped");
            None
          }
        }
      })
      .collect();

    futures::stream::iter(requests)
      .map(|(request, bucket)| async move {
        match self.executor.fetch_into(&request, bucket).await {
          Ok(true) => true,
          Ok(false) => {
            warn!(url = %request.url, "Response not cacheable, skipped");
            false
          }
          Err(e) => {
            warn!(url = %request.url, error = %e, "Failed to cache URL");
            false
          }
        }
      })
      .buffer_unordered(PREFETCH_CONCURRENCY)
      .filter(|stored| futures::future::ready(*stored))
      .count()
      .await
  }

  /// Connectivity came back: replay the sync queue once.
  pub async fn handle_sync_trigger(&self) -> Result<Option<SyncSummary>> {
    self.ensure_running()?;
    self.sync.sync().await
  }

  /// Turn a push payload into a notification for the host to display.
  pub fn handle_push(&self, payload: &[u8]) -> Notification {
    let notification = Notification::from_payload(payload, &self.config.notifications);
    self
      .events
      .emit(EngineEvent::Notification(notification.clone()));
    notification
  }

  /// Wait for outstanding background refreshes.
  pub async fn settle(&self) {
    self.executor.settle().await;
  }

  /// Periodic expiry sweep, plus a sync pass when enabled. The task exits on
  /// its own once the engine is shut down.
  pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
    let engine = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      // The first tick completes immediately
      ticker.tick().await;

      loop {
        ticker.tick().await;
        if engine.state() == EngineState::ShutDown {
          break;
        }
        debug!("Running maintenance");
        engine.handle_control(ControlCommand::CleanupExpired).await;
        if engine.config.maintenance.sync {
          if let Err(e) = engine.handle_sync_trigger().await {
            warn!(error = %e, "Maintenance sync failed");
          }
        }
      }
    })
  }

  /// Stop accepting work, give background refreshes `grace` to finish, then
  /// cancel whatever is left.
  pub async fn shutdown(&self, grace: Duration) {
    if self.state() == EngineState::ShutDown {
      return;
    }
    self.set_state(EngineState::ShutDown);

    if tokio::time::timeout(grace, self.executor.settle())
      .await
      .is_err()
    {
      warn!("Background refreshes still running at shutdown, aborting");
      self.executor.abort_background();
    }
    info!("Engine shut down");
  }

  fn ensure_running(&self) -> Result<()> {
    match self.state() {
      EngineState::ShutDown => Err(EngineError::ShutDown),
      _ => Ok(()),
    }
  }

  fn set_state(&self, state: EngineState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
  }
}
