//! Test doubles shared by the module tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::ManualClock;
use crate::config::Config;
use crate::db::Database;
use crate::engine::CacheEngine;
use crate::error::EngineError;
use crate::http::{Method, Request, Response};
use crate::network::Fetcher;

/// Scripted network. Unknown URLs answer 404; `set_offline` fails everything.
#[derive(Default)]
pub(crate) struct MockFetcher {
  replies: Mutex<HashMap<String, (u16, Vec<u8>)>>,
  unreachable: Mutex<HashSet<String>>,
  delays: Mutex<HashMap<String, Duration>>,
  offline: AtomicBool,
  calls: Mutex<Vec<Request>>,
}

impl MockFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn reply(&self, url: &str, status: u16, body: &str) {
    self
      .replies
      .lock()
      .unwrap()
      .insert(url.to_string(), (status, body.as_bytes().to_vec()));
  }

  pub fn fail(&self, url: &str) {
    self.unreachable.lock().unwrap().insert(url.to_string());
  }

  pub fn delay(&self, url: &str, by: Duration) {
    self.delays.lock().unwrap().insert(url.to_string(), by);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self, method: Method, url: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.method == method && r.url.as_str() == url)
      .count()
  }
}

#[async_trait]
impl Fetcher for MockFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, EngineError> {
    self.calls.lock().unwrap().push(request.clone());
    let url = request.url.as_str().to_string();

    let delay = self.delays.lock().unwrap().get(&url).copied();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if self.offline.load(Ordering::SeqCst) || self.unreachable.lock().unwrap().contains(&url) {
      return Err(EngineError::NetworkUnreachable {
        url,
        reason: "connection refused".to_string(),
      });
    }

    let reply = self.replies.lock().unwrap().get(&url).cloned();
    Ok(match reply {
      Some((status, body)) => Response::new(
        status,
        vec![("content-type".to_string(), "text/plain".to_string())],
        body,
      ),
      None => Response::new(404, vec![], b"not found".to_vec()),
    })
  }
}

/// Engine over an in-memory database, a manual clock and the given fetcher.
pub(crate) fn engine_with(
  config: Config,
  fetcher: Arc<MockFetcher>,
) -> (Arc<CacheEngine>, Arc<ManualClock>) {
  let clock = Arc::new(ManualClock::default());
  let db = Database::open_in_memory().unwrap();
  let engine = CacheEngine::with_clock(config, fetcher, &db, clock.clone()).unwrap();
  (Arc::new(engine), clock)
}
