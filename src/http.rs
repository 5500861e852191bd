//! Request and response types crossing the interception boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Ordered header list. Names compare case-insensitively.
pub type Headers = Vec<(String, String)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Options,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Options => "OPTIONS",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }

  /// Methods whose failed attempts are queued for background replay.
  pub fn is_mutating(&self) -> bool {
    matches!(
      self,
      Method::Post | Method::Put | Method::Patch | Method::Delete
    )
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "OPTIONS" => Ok(Method::Options),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(format!("Unsupported HTTP method: {}", other)),
    }
  }
}

/// Whether a request is a top-level page load or a subresource fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMode {
  Navigate,
  #[default]
  Subresource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Vec<u8>,
  pub mode: RequestMode,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: Vec::new(),
      mode: RequestMode::Subresource,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  /// A top-level page load.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate && self.method == Method::Get
  }
}

/// Where a response handed back to the caller came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
  Network,
  Cache { stale: bool },
  /// A fallback document served in place of the requested page
  Fallback,
  /// Mutating request accepted for later replay
  Queued,
  /// Produced by the engine itself (e.g. the terminal 503)
  Synthetic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl Response {
  pub fn new(status: u16, headers: Headers, body: Vec<u8>) -> Self {
    Self {
      status,
      headers,
      body,
      source: ResponseSource::Network,
    }
  }

  pub fn with_source(mut self, source: ResponseSource) -> Self {
    self.source = source;
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  /// Only successful responses that don't forbid storage may enter a bucket.
  pub fn is_cacheable(&self) -> bool {
    self.is_success()
      && !self
        .header("cache-control")
        .is_some_and(|v| v.to_ascii_lowercase().contains("no-store"))
  }

  /// 202 acknowledgment returned when a mutating request was queued.
  pub fn queued(id: i64) -> Self {
    let body = serde_json::json!({
      "queued": true,
      "id": id,
      "message": "Request queued for background sync",
    });
    Self {
      status: 202,
      headers: vec![("content-type".into(), "application/json".into())],
      body: body.to_string().into_bytes(),
      source: ResponseSource::Queued,
    }
  }

  /// Terminal response when neither network nor any fallback could answer.
  pub fn service_unavailable(body: Option<(&str, &[u8])>) -> Self {
    let (content_type, body) =
      body.unwrap_or(("text/plain; charset=utf-8", &b"Service Unavailable"[..]));
    Self {
      status: 503,
      headers: vec![("content-type".into(), content_type.to_string())],
      body: body.to_vec(),
      source: ResponseSource::Synthetic,
    }
  }
}

fn find_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}
