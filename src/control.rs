//! Out-of-band commands from the application and the maintenance timer.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::{Bucket, BucketStats};
use crate::engine::CacheEngine;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCommand {
  /// Activate the current version now, dropping older cache generations
  SkipWaiting,
  ClearCache,
  ClearCacheType {
    #[serde(rename = "cacheType")]
    cache_type: String,
  },
  /// Fetch and store the given URLs; the bucket defaults to dynamic
  CacheUrls {
    urls: Vec<String>,
    #[serde(rename = "cacheType", default, skip_serializing_if = "Option::is_none")]
    cache_type: Option<String>,
  },
  GetVersion,
  GetCacheStats,
  CleanupExpired,
  /// Fetch the given URLs into whichever bucket their route selects
  WarmCache { urls: Vec<String> },
}

impl ControlCommand {
  pub fn name(&self) -> &'static str {
    match self {
      ControlCommand::SkipWaiting => "SKIP_WAITING",
      ControlCommand::ClearCache => "CLEAR_CACHE",
      ControlCommand::ClearCacheType { .. } => "CLEAR_CACHE_TYPE",
      ControlCommand::CacheUrls { .. } => "CACHE_URLS",
      ControlCommand::GetVersion => "GET_VERSION",
      ControlCommand::GetCacheStats => "GET_CACHE_STATS",
      ControlCommand::CleanupExpired => "CLEANUP_EXPIRED",
      ControlCommand::WarmCache { .. } => "WARM_CACHE",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlResponse {
  Activated {
    purged: usize,
  },
  CacheCleared {
    removed: usize,
  },
  CacheTypeCleared {
    #[serde(rename = "cacheType")]
    cache_type: Bucket,
    removed: usize,
  },
  CacheComplete {
    count: usize,
  },
  VersionInfo {
    version: String,
    buckets: Vec<String>,
  },
  CacheStats {
    #[serde(rename = "perBucket")]
    per_bucket: Vec<BucketStats>,
  },
  CleanupComplete {
    removed: usize,
  },
  Error {
    message: String,
  },
}

impl From<EngineError> for ControlResponse {
  fn from(err: EngineError) -> Self {
    ControlResponse::Error {
      message: err.to_string(),
    }
  }
}

type Envelope = (ControlCommand, Option<oneshot::Sender<ControlResponse>>);

/// Message loop in front of [`CacheEngine::handle_control`].
///
/// Commands are handled one at a time in arrival order.
#[derive(Clone)]
pub struct ControlChannel {
  tx: mpsc::Sender<Envelope>,
}

impl ControlChannel {
  /// Start the loop. It ends once every sender has been dropped.
  pub fn spawn(engine: Arc<CacheEngine>, capacity: usize) -> (Self, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Envelope>(capacity);

    let handle = tokio::spawn(async move {
      while let Some((command, reply)) = rx.recv().await {
        let name = command.name();
        let response = engine.handle_control(command).await;
        match reply {
          Some(reply) => {
            if reply.send(response).is_err() {
              debug!(command = name, "Control caller went away before the reply");
            }
          }
          None => debug!(command = name, ?response, "Handled posted control command"),
        }
      }
    });

    (Self { tx }, handle)
  }

  /// Send a command and wait for its response.
  pub async fn send(&self, command: ControlCommand) -> Result<ControlResponse> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self
      .tx
      .send((command, Some(reply_tx)))
      .await
      .map_err(|_| EngineError::ShutDown)?;
    reply_rx.await.map_err(|_| EngineError::ShutDown)
  }

  /// Queue a command without waiting for it to run.
  pub async fn post(&self, command: ControlCommand) -> Result<()> {
    self
      .tx
      .send((command, None))
      .await
      .map_err(|_| EngineError::ShutDown)
  }
}
