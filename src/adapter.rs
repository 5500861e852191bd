//! JSON-lines front end for the engine.
//!
//! One message per input line, one reply per output line:
//!
//! ```text
//! {"kind":"fetch","url":"/gods/zeus","mode":"navigate"}
//! {"kind":"control","command":{"type":"GET_CACHE_STATS"}}
//! {"kind":"sync"}
//! {"kind":"push","payload":{"title":"New myth"}}
//! ```

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::control::{ControlCommand, ControlResponse};
use crate::engine::CacheEngine;
use crate::http::{Headers, Method, Request, RequestMode, ResponseSource};
use crate::notification::Notification;
use crate::sync::SyncSummary;

#[derive(Debug, Deserialize)]
pub struct FetchMessage {
  #[serde(default = "default_method")]
  pub method: Method,
  /// Absolute, or relative to the configured origin
  pub url: String,
  #[serde(default)]
  pub headers: Headers,
  #[serde(default)]
  pub body: Option<String>,
  #[serde(default)]
  pub mode: RequestMode,
}

fn default_method() -> Method {
  Method::Get
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Inbound {
  Fetch(FetchMessage),
  Control { command: ControlCommand },
  Sync,
  Push {
    #[serde(default)]
    payload: serde_json::Value,
  },
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Outbound {
  Response {
    status: u16,
    headers: Headers,
    /// Lossy UTF-8 rendering of the body
    body: String,
    source: ResponseSource,
  },
  Control {
    response: ControlResponse,
  },
  Sync {
    summary: Option<SyncSummary>,
  },
  Notification {
    notification: Notification,
  },
  Error {
    message: String,
  },
}

impl Outbound {
  fn error(err: impl std::fmt::Display) -> Self {
    Outbound::Error {
      message: err.to_string(),
    }
  }
}

/// Handle one protocol line.
pub async fn dispatch(engine: &CacheEngine, line: &str) -> Outbound {
  let message: Inbound = match serde_json::from_str(line) {
    Ok(message) => message,
    Err(e) => return Outbound::error(format!("Invalid message: {}", e)),
  };

  match message {
    Inbound::Fetch(fetch) => {
      let url = match engine.config().resolve_url(&fetch.url) {
        Ok(url) => url,
        Err(e) => return Outbound::error(e),
      };
      let request = Request {
        method: fetch.method,
        url,
        headers: fetch.headers,
        body: fetch.body.map(String::into_bytes).unwrap_or_default(),
        mode: fetch.mode,
      };
      match engine.handle(request).await {
        Ok(response) => Outbound::Response {
          status: response.status,
          body: String::from_utf8_lossy(&response.body).into_owned(),
          headers: response.headers,
          source: response.source,
        },
        Err(e) => Outbound::error(e),
      }
    }
    Inbound::Control { command } => Outbound::Control {
      response: engine.handle_control(command).await,
    },
    Inbound::Sync => match engine.handle_sync_trigger().await {
      Ok(summary) => Outbound::Sync { summary },
      Err(e) => Outbound::error(e),
    },
    Inbound::Push { payload } => {
      let bytes = match payload {
        serde_json::Value::Null => Vec::new(),
        serde_json::Value::String(text) => text.into_bytes(),
        other => other.to_string().into_bytes(),
      };
      Outbound::Notification {
        notification: engine.handle_push(&bytes),
      }
    }
  }
}

/// Read messages until end of input, answering each in order. Returns how
/// many messages were handled.
pub async fn serve<R, W>(engine: &CacheEngine, input: R, mut output: W) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut lines = input.lines();
  let mut handled = 0;

  while let Some(line) = lines
    .next_line()
    .await
    .map_err(|e| eyre!("Failed to read input: {}", e))?
  {
    if line.trim().is_empty() {
      continue;
    }
    let reply = dispatch(engine, &line).await;
    debug!(?reply, "Replying");

    let mut encoded =
      serde_json::to_vec(&reply).map_err(|e| eyre!("Failed to encode reply: {}", e))?;
    encoded.push(b'\n');
    output
      .write_all(&encoded)
      .await
      .map_err(|e| eyre!("Failed to write reply: {}", e))?;
    output
      .flush()
      .await
      .map_err(|e| eyre!("Failed to flush output: {}", e))?;
    handled += 1;
  }

  Ok(handled)
}
