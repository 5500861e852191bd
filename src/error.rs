//! Error taxonomy for the offline engine.

use std::fmt::Display;

use thiserror::Error;

use crate::http::Method;

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("Request to {url} timed out after {timeout_ms}ms")]
  NetworkTimeout { url: String, timeout_ms: u64 },

  #[error("Network unreachable for {url}: {reason}")]
  NetworkUnreachable { url: String, reason: String },

  #[error("Not available in cache: {0}")]
  NotInCache(String),

  #[error("Unknown cache bucket: {0}")]
  BucketNotFound(String),

  #[error("Failed to persist queued request: {0}")]
  QueuePersistence(String),

  #[error("Replay of queued request {id} failed: {reason}")]
  Replay { id: i64, reason: String },

  #[error("{0} requests cannot be queued for replay")]
  NotReplayable(Method),

  #[error("Cache storage error: {0}")]
  Storage(String),

  #[error("Engine has been shut down")]
  ShutDown,
}

impl EngineError {
  /// Wrap a storage backend failure, keeping the full context chain.
  pub fn storage(err: impl Display) -> Self {
    EngineError::Storage(format!("{:#}", err))
  }

  /// True for failures where the request never got a response.
  pub fn is_network(&self) -> bool {
    matches!(
      self,
      EngineError::NetworkTimeout { .. } | EngineError::NetworkUnreachable { .. }
    )
  }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
