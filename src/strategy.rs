//! Fetch strategies over the cache store and the network.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Duration as TtlDuration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::{Bucket, CacheEntry, CacheKey, CacheStore};
use crate::error::{EngineError, Result};
use crate::event::{EngineEvent, EventBus};
use crate::http::{Request, Response, ResponseSource};
use crate::network::Fetcher;
use crate::offline::FallbackDocuments;
use crate::routing::{Policy, Strategy};

/// Fire-and-forget refreshes, tracked so they can be awaited or aborted.
struct BackgroundTasks {
  tasks: Mutex<JoinSet<()>>,
  in_flight: Mutex<HashSet<(Bucket, CacheKey)>>,
}

impl BackgroundTasks {
  fn new() -> Self {
    Self {
      tasks: Mutex::new(JoinSet::new()),
      in_flight: Mutex::new(HashSet::new()),
    }
  }
}

/// Executes a routing policy for one request.
///
/// Clone is cheap; clones share the store, the fetcher and the background
/// task set.
#[derive(Clone)]
pub struct StrategyExecutor {
  store: Arc<CacheStore>,
  fetcher: Arc<dyn Fetcher>,
  timeout: Duration,
  background: Arc<BackgroundTasks>,
  events: EventBus,
}

impl StrategyExecutor {
  pub fn new(
    store: Arc<CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    timeout: Duration,
    events: EventBus,
  ) -> Self {
    Self {
      store,
      fetcher,
      timeout,
      background: Arc::new(BackgroundTasks::new()),
      events,
    }
  }

  pub async fn execute(&self, request: &Request, policy: &Policy) -> Result<Response> {
    // Without a bucket there is nothing to read or write
    let bucket = match (policy.strategy, policy.bucket) {
      (Strategy::NetworkOnly, _) | (_, None) => return self.fetch(request).await,
      (_, Some(bucket)) => bucket,
    };

    match policy.strategy {
      Strategy::NetworkOnly => self.fetch(request).await,
      Strategy::NetworkFirst => self.network_first(request, bucket, policy.ttl).await,
      Strategy::CacheFirst => self.cache_first(request, bucket, policy.ttl).await,
      Strategy::StaleWhileRevalidate => {
        self
          .stale_while_revalidate(request, bucket, policy.ttl)
          .await
      }
      Strategy::CacheOnly => self.cache_only(request, bucket, policy.ttl),
    }
  }

  /// Network-first into the pages bucket, then the fixed fallback chain:
  /// cached page, cached root document, offline document, 503.
  pub async fn navigate(
    &self,
    request: &Request,
    policy: &Policy,
    fallbacks: &FallbackDocuments,
  ) -> Response {
    let bucket = policy.bucket.unwrap_or(Bucket::Pages);
    let err = match self.network_first(request, bucket, policy.ttl).await {
      Ok(response) => return response,
      Err(err) => err,
    };
    debug!(url = %request.url, error = %err, "Navigation failed, using fallback chain");

    if let Some(root) = self.lookup(Bucket::Pages, fallbacks.root_key()) {
      return root.to_response(false).with_source(ResponseSource::Fallback);
    }

    if let Some(offline) = fallbacks.offline_page() {
      let response = match self.lookup(Bucket::Pages, &offline.key) {
        Some(entry) => entry.to_response(false),
        None => offline.response.clone(),
      };
      return response.with_source(ResponseSource::Fallback);
    }

    let error_page = fallbacks.error_page();
    Response::service_unavailable(
      error_page.map(|doc| (doc.content_type(), doc.response.body.as_slice())),
    )
  }

  /// One network round-trip bounded by the configured timeout. The in-flight
  /// call is dropped, and so cancelled, when the deadline passes.
  pub async fn fetch(&self, request: &Request) -> Result<Response> {
    match tokio::time::timeout(self.timeout, self.fetcher.fetch(request)).await {
      Ok(result) => result,
      Err(_) => Err(EngineError::NetworkTimeout {
        url: request.url.to_string(),
        timeout_ms: self.timeout.as_millis() as u64,
      }),
    }
  }

  /// Fetch `request` and store it in `bucket`. Returns whether it was stored.
  pub async fn fetch_into(&self, request: &Request, bucket: Bucket) -> Result<bool> {
    let response = self.fetch(request).await?;
    if !response.is_cacheable() {
      debug!(url = %request.url, status = response.status, "Not caching response");
      return Ok(false);
    }
    self
      .store
      .put(bucket, &CacheKey::for_request(request), &response)?;
    Ok(true)
  }

  async fn network_first(
    &self,
    request: &Request,
    bucket: Bucket,
    ttl: Option<TtlDuration>,
  ) -> Result<Response> {
    let key = CacheKey::for_request(request);
    match self.fetch(request).await {
      Ok(response) => {
        self.remember(bucket, &key, &response);
        Ok(response)
      }
      Err(err) => match self.lookup(bucket, &key) {
        Some(entry) => {
          let stale = self.store.is_expired(&entry, ttl);
          debug!(%key, stale, error = %err, "Network failed, serving from cache");
          Ok(entry.to_response(stale))
        }
        None => Err(err),
      },
    }
  }

  async fn cache_first(
    &self,
    request: &Request,
    bucket: Bucket,
    ttl: Option<TtlDuration>,
  ) -> Result<Response> {
    let key = CacheKey::for_request(request);
    if let Some(entry) = self.lookup(bucket, &key) {
      let stale = self.store.is_expired(&entry, ttl);
      if stale {
        self.spawn_refresh(request.clone(), bucket);
      }
      debug!(%key, stale, "Cache hit");
      return Ok(entry.to_response(stale));
    }

    let response = self.fetch(request).await?;
    self.remember(bucket, &key, &response);
    Ok(response)
  }

  async fn stale_while_revalidate(
    &self,
    request: &Request,
    bucket: Bucket,
    ttl: Option<TtlDuration>,
  ) -> Result<Response> {
    let key = CacheKey::for_request(request);
    if let Some(entry) = self.lookup(bucket, &key) {
      let stale = self.store.is_expired(&entry, ttl);
      self.spawn_refresh(request.clone(), bucket);
      debug!(%key, stale, "Serving cached entry while revalidating");
      return Ok(entry.to_response(stale));
    }

    let response = self.fetch(request).await?;
    self.remember(bucket, &key, &response);
    Ok(response)
  }

  fn cache_only(&self, request: &Request, bucket: Bucket, ttl: Option<TtlDuration>) -> Result<Response> {
    let key = CacheKey::for_request(request);
    match self.lookup(bucket, &key) {
      Some(entry) => {
        let stale = self.store.is_expired(&entry, ttl);
        Ok(entry.to_response(stale))
      }
      None => Err(EngineError::NotInCache(request.url.to_string())),
    }
  }

  /// Cache read that treats storage failures as a miss.
  fn lookup(&self, bucket: Bucket, key: &CacheKey) -> Option<CacheEntry> {
    match self.store.get(bucket, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(%bucket, %key, error = %e, "Cache read failed");
        None
      }
    }
  }

  /// Store a network response if it may be cached. Failures are logged only.
  fn remember(&self, bucket: Bucket, key: &CacheKey, response: &Response) {
    if !response.is_cacheable() {
      return;
    }
    if let Err(e) = self.store.put(bucket, key, response) {
      warn!(%bucket, %key, error = %e, "Cache write failed");
    }
  }

  /// Refresh `request` into `bucket` without the caller waiting on it.
  fn spawn_refresh(&self, request: Request, bucket: Bucket) {
    let slot = (bucket, CacheKey::for_request(&request));
    {
      let mut in_flight = self
        .background
        .in_flight
        .lock()
        .unwrap_or_else(|e| e.into_inner());
      if !in_flight.insert(slot.clone()) {
        debug!(key = %slot.1, "Refresh already in flight");
        return;
      }
    }

    let this = self.clone();
    let mut tasks = self
      .background
      .tasks
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    // Reap finished tasks so the set doesn't grow without bound
    while tasks.try_join_next().is_some() {}

    tasks.spawn(async move {
      let (bucket, key) = &slot;
      match this.fetch(&request).await {
        Ok(response) if response.is_cacheable() => match this.store.put(*bucket, key, &response) {
          Ok(_) => {
            debug!(%key, "Background refresh stored");
            this.events.emit(EngineEvent::CacheRefreshed {
              bucket: *bucket,
              key: key.to_string(),
            });
          }
          Err(e) => warn!(%key, error = %e, "Background refresh could not be stored"),
        },
        Ok(response) => debug!(%key, status = response.status, "Background refresh not cacheable"),
        Err(e) => warn!(%key, error = %e, "Background refresh failed"),
      }

      this
        .background
        .in_flight
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&slot);
    });
  }

  /// Wait until every background refresh, including ones spawned meanwhile,
  /// has finished.
  pub async fn settle(&self) {
    loop {
      let mut tasks = {
        let mut guard = self
          .background
          .tasks
          .lock()
          .unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, JoinSet::new())
      };
      if tasks.is_empty() {
        break;
      }
      while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
          warn!(error = %e, "Background refresh task panicked");
        }
      }
    }
  }

  /// Cancel outstanding background refreshes.
  pub fn abort_background(&self) {
    self
      .background
      .tasks
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .abort_all();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::clock::ManualClock;
  use crate::config::BucketsConfig;
  use crate::http::Method;
  use crate::testing::MockFetcher;
  use std::time::Instant;
  use url::Url;

  const URL: &str = "https://myth.example/scripts/app.js";

  struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<CacheStore>,
    net: Arc<MockFetcher>,
    exec: StrategyExecutor,
  }

  fn harness() -> Harness {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(CacheStore::new(
      Arc::new(MemoryStorage::new()),
      BucketsConfig::default(),
      clock.clone(),
      EventBus::default(),
    ));
    let net = Arc::new(MockFetcher::new());
    let exec = StrategyExecutor::new(
      store.clone(),
      net.clone(),
      Duration::from_millis(200),
      EventBus::default(),
    );
    Harness {
      clock,
      store,
      net,
      exec,
    }
  }

  fn policy(strategy: Strategy) -> Policy {
    Policy {
      strategy,
      bucket: Some(Bucket::Static),
      ttl: Some(TtlDuration::minutes(10)),
    }
  }

  fn request() -> Request {
    Request::get(Url::parse(URL).unwrap())
  }

  fn key() -> CacheKey {
    CacheKey::for_url(&Url::parse(URL).unwrap())
  }

  fn seed(h: &Harness, body: &str) -> CacheEntry {
    h.store
      .put(Bucket::Static, &key(), &Response::new(200, vec![], body.as_bytes().to_vec()))
      .unwrap()
  }

  #[tokio::test]
  async fn test_network_only_never_touches_cache() {
    let h = harness();
    h.net.reply(URL, 200, "fresh");

    let response = h.exec.execute(&request(), &Policy::NETWORK_ONLY).await.unwrap();
    assert_eq!(response.body, b"fresh");
    assert_eq!(h.store.count(Bucket::Static).unwrap(), 0);

    h.net.set_offline(true);
    seed(&h, "cached");
    let err = h.exec.execute(&request(), &Policy::NETWORK_ONLY).await.unwrap_err();
    assert!(matches!(err, EngineError::NetworkUnreachable { .. }));
  }

  #[tokio::test]
  async fn test_network_first_stores_then_falls_back() {
    let h = harness();
    h.net.reply(URL, 200, "fresh");

    let response = h.exec.execute(&request(), &policy(Strategy::NetworkFirst)).await.unwrap();
    assert_eq!(response.source, ResponseSource::Network);
    assert_eq!(h.store.get(Bucket::Static, &key()).unwrap().unwrap().body, b"fresh");

    // Offline and past the TTL: stale entry is still served, not an error
    h.net.set_offline(true);
    h.clock.advance(TtlDuration::hours(1));
    let response = h.exec.execute(&request(), &policy(Strategy::NetworkFirst)).await.unwrap();
    assert_eq!(response.body, b"fresh");
    assert_eq!(response.source, ResponseSource::Cache { stale: true });
  }

  #[tokio::test]
  async fn test_network_first_empty_cache_propagates_error() {
    let h = harness();
    h.net.set_offline(true);
    let err = h
      .exec
      .execute(&request(), &policy(Strategy::NetworkFirst))
      .await
      .unwrap_err();
    assert!(err.is_network());
  }

  #[tokio::test]
  async fn test_network_first_timeout_falls_back_to_cache() {
    let h = harness();
    seed(&h, "cached");
    h.net.reply(URL, 200, "slow");
    h.net.delay(URL, Duration::from_secs(5));

    let started = Instant::now();
    let response = h.exec.execute(&request(), &policy(Strategy::NetworkFirst)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(response.body, b"cached");
    assert_eq!(response.source, ResponseSource::Cache { stale: false });
  }

  #[tokio::test]
  async fn test_timeout_without_cache_is_typed() {
    let h = harness();
    h.net.delay(URL, Duration::from_secs(5));
    let err = h
      .exec
      .execute(&request(), &policy(Strategy::NetworkFirst))
      .await
      .unwrap_err();
    assert!(matches!(err, EngineError::NetworkTimeout { timeout_ms: 200, .. }));
  }

  #[tokio::test]
  async fn test_cache_first_fresh_hit_skips_network() {
    let h = harness();
    seed(&h, "cached");

    let response = h.exec.execute(&request(), &policy(Strategy::CacheFirst)).await.unwrap();
    h.exec.settle().await;
    assert_eq!(response.body, b"cached");
    assert_eq!(response.source, ResponseSource::Cache { stale: false });
    assert!(h.net.calls().is_empty());
  }

  #[tokio::test]
  async fn test_cache_first_stale_hit_refreshes_in_background() {
    let h = harness();
    let old = seed(&h, "old");
    h.net.reply(URL, 200, "new");
    h.clock.advance(TtlDuration::minutes(11));

    let response = h.exec.execute(&request(), &policy(Strategy::CacheFirst)).await.unwrap();
    assert_eq!(response.body, b"old");
    assert_eq!(response.source, ResponseSource::Cache { stale: true });

    h.exec.settle().await;
    let refreshed = h.store.get(Bucket::Static, &key()).unwrap().unwrap();
    assert_eq!(refreshed.body, b"new");
    assert!(refreshed.stored_at > old.stored_at);
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let h = harness();
    h.net.reply(URL, 200, "fetched");

    let response = h.exec.execute(&request(), &policy(Strategy::CacheFirst)).await.unwrap();
    assert_eq!(response.source, ResponseSource::Network);
    assert!(h.store.get(Bucket::Static, &key()).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_failed_refresh_leaves_cached_response_alone() {
    let h = harness();
    seed(&h, "old");
    h.net.set_offline(true);
    h.clock.advance(TtlDuration::minutes(11));

    let response = h.exec.execute(&request(), &policy(Strategy::CacheFirst)).await.unwrap();
    h.exec.settle().await;
    assert_eq!(response.body, b"old");
    assert_eq!(h.store.get(Bucket::Static, &key()).unwrap().unwrap().body, b"old");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_always_refreshes() {
    let h = harness();
    seed(&h, "old");
    h.net.reply(URL, 200, "new");

    // Fresh entry still triggers a refresh
    let response = h
      .exec
      .execute(&request(), &policy(Strategy::StaleWhileRevalidate))
      .await
      .unwrap();
    assert_eq!(response.body, b"old");
    h.exec.settle().await;

    assert_eq!(h.net.call_count(Method::Get, URL), 1);
    assert_eq!(h.store.get(Bucket::Static, &key()).unwrap().unwrap().body, b"new");
  }

  #[tokio::test]
  async fn test_concurrent_refreshes_are_deduplicated() {
    let h = harness();
    seed(&h, "old");
    h.net.reply(URL, 200, "new");
    h.net.delay(URL, Duration::from_millis(50));

    let swr = policy(Strategy::StaleWhileRevalidate);
    h.exec.execute(&request(), &swr).await.unwrap();
    h.exec.execute(&request(), &swr).await.unwrap();
    h.exec.settle().await;

    assert_eq!(h.net.call_count(Method::Get, URL), 1);
  }

  #[tokio::test]
  async fn test_cache_only() {
    let h = harness();
    let err = h
      .exec
      .execute(&request(), &policy(Strategy::CacheOnly))
      .await
      .unwrap_err();
    assert!(matches!(err, EngineError::NotInCache(url) if url == URL));

    seed(&h, "cached");
    let response = h.exec.execute(&request(), &policy(Strategy::CacheOnly)).await.unwrap();
    assert_eq!(response.body, b"cached");
    assert!(h.net.calls().is_empty());
  }

  #[tokio::test]
  async fn test_error_responses_are_not_cached() {
    let h = harness();
    h.net.reply(URL, 500, "boom");

    let response = h.exec.execute(&request(), &policy(Strategy::NetworkFirst)).await.unwrap();
    assert_eq!(response.status, 500);
    assert_eq!(h.store.count(Bucket::Static).unwrap(), 0);
  }
}
