//! Network access for the engine.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Client;
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::error::EngineError;
use crate::http::{Headers, Method, Request, Response};

/// Performs a single network round-trip.
///
/// An HTTP error status is still a response; only failures to obtain one are
/// errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, EngineError>;
}

/// reqwest-backed fetcher.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpFetcher {
  client: Client,
  connect_timeout_ms: u64,
}

impl HttpFetcher {
  /// The overall deadline is applied by the caller, so the client itself only
  /// bounds connection setup.
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let client = Client::builder()
      .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
      .user_agent(config.user_agent.clone())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      connect_timeout_ms: config.connect_timeout_ms,
    })
  }

  fn method(method: Method) -> reqwest::Method {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Head => reqwest::Method::HEAD,
      Method::Options => reqwest::Method::OPTIONS,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    }
  }

  fn map_error(&self, url: &str, err: reqwest::Error) -> EngineError {
    if err.is_timeout() {
      EngineError::NetworkTimeout {
        url: url.to_string(),
        timeout_ms: self.connect_timeout_ms,
      }
    } else {
      EngineError::NetworkUnreachable {
        url: url.to_string(),
        reason: err.to_string(),
      }
    }
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, EngineError> {
    let url = request.url.as_str();
    let mut builder = self
      .client
      .request(Self::method(request.method), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| self.map_error(url, e))?;

    let status = response.status().as_u16();
    let headers: Headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| self.map_error(url, e))?;

    Ok(Response::new(status, headers, body.to_vec()))
  }
}
