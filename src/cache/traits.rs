//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::EngineError;
use crate::http::{Headers, Method, Request, Response, ResponseSource};

/// Named cache partitions. The set is fixed at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
  Static,
  Dynamic,
  Images,
  Fonts,
  Pages,
}

impl Bucket {
  pub const ALL: [Bucket; 5] = [
    Bucket::Static,
    Bucket::Dynamic,
    Bucket::Images,
    Bucket::Fonts,
    Bucket::Pages,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Bucket::Static => "static",
      Bucket::Dynamic => "dynamic",
      Bucket::Images => "images",
      Bucket::Fonts => "fonts",
      Bucket::Pages => "pages",
    }
  }

  /// Position in `Bucket::ALL`, used for per-bucket lock tables.
  pub(crate) fn index(self) -> usize {
    self as usize
  }
}

impl fmt::Display for Bucket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Bucket {
  type Err = EngineError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Bucket::ALL
      .into_iter()
      .find(|b| b.as_str().eq_ignore_ascii_case(s.trim()))
      .ok_or_else(|| EngineError::BucketNotFound(s.to_string()))
  }
}

/// Canonical request identity: `GET <url without fragment>`.
///
/// Only GET requests are ever cached, so the method is fixed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
  pub fn for_url(url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self(format!("{} {}", Method::Get, url))
  }

  pub fn for_request(request: &Request) -> Self {
    Self::for_url(&request.url)
  }

  /// Rebuild a key from its stored string form.
  pub fn from_raw(raw: impl Into<String>) -> Self {
    Self(raw.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// The URL portion of the key.
  pub fn url(&self) -> &str {
    self.0.split_once(' ').map(|(_, u)| u).unwrap_or(&self.0)
  }

  /// SHA256 of the key for stable, fixed-length storage ids.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.0.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// A stored response. Never mutated after the write that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub bucket: Bucket,
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn to_response(&self, stale: bool) -> Response {
    Response {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
      source: ResponseSource::Cache { stale },
    }
  }
}

/// Key plus write time, enough for eviction and expiry sweeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStamp {
  pub key: CacheKey,
  pub stored_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Backends are plain maps; ordering of writes and eviction is the
/// responsibility of `CacheStore`.
pub trait CacheStorage: Send + Sync {
  fn get(&self, bucket: Bucket, key: &CacheKey) -> Result<Option<CacheEntry>>;

  /// Insert or fully replace the entry for `entry.key` in `entry.bucket`.
  fn put(&self, entry: &CacheEntry) -> Result<()>;

  /// Returns whether an entry was removed.
  fn delete(&self, bucket: Bucket, key: &CacheKey) -> Result<bool>;

  fn stamps(&self, bucket: Bucket) -> Result<Vec<EntryStamp>>;

  fn count(&self, bucket: Bucket) -> Result<usize>;

  /// Returns the number of entries removed.
  fn clear(&self, bucket: Bucket) -> Result<usize>;

  /// Remove entries written under other cache versions.
  fn purge_other_versions(&self) -> Result<usize> {
    Ok(0)
  }
}
