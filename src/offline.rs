//! Static documents served when a navigation can't be satisfied.

use color_eyre::{eyre::eyre, Result};
use tracing::debug;

use crate::cache::{Bucket, CacheKey, CacheStore};
use crate::config::Config;
use crate::error::EngineError;
use crate::http::Response;

const OFFLINE_PAGE: &str = include_str!("../assets/offline.html");
const ERROR_PAGE: &str = include_str!("../assets/error.html");

#[derive(Debug, Clone)]
pub struct Document {
  pub key: CacheKey,
  pub response: Response,
}

impl Document {
  fn html(key: CacheKey, body: Vec<u8>) -> Self {
    Self {
      key,
      response: Response::new(
        200,
        vec![("content-type".to_string(), "text/html; charset=utf-8".to_string())],
        body,
      ),
    }
  }

  pub fn content_type(&self) -> &str {
    self
      .response
      .header("content-type")
      .unwrap_or("text/html; charset=utf-8")
  }
}

/// The terminal steps of the navigation fallback chain.
#[derive(Debug, Clone)]
pub struct FallbackDocuments {
  root_key: CacheKey,
  offline_page: Option<Document>,
  error_page: Option<Document>,
}

impl FallbackDocuments {
  pub fn from_config(config: &Config) -> Result<Self> {
    let root_key = CacheKey::for_url(&config.resolve_url(&config.offline.root_url)?);
    if !config.offline.enabled {
      return Ok(Self {
        root_key,
        offline_page: None,
        error_page: None,
      });
    }

    let offline_body = match &config.offline.page_file {
      Some(path) => std::fs::read(path)
        .map_err(|e| eyre!("Failed to read offline page {}: {}", path.display(), e))?,
      None => OFFLINE_PAGE.as_bytes().to_vec(),
    };

    Ok(Self {
      root_key,
      offline_page: Some(Document::html(
        CacheKey::for_url(&config.resolve_url(&config.offline.page_url)?),
        offline_body,
      )),
      error_page: Some(Document::html(
        CacheKey::for_url(&config.resolve_url(&config.offline.error_url)?),
        ERROR_PAGE.as_bytes().to_vec(),
      )),
    })
  }

  pub fn root_key(&self) -> &CacheKey {
    &self.root_key
  }

  pub fn offline_page(&self) -> Option<&Document> {
    self.offline_page.as_ref()
  }

  pub fn error_page(&self) -> Option<&Document> {
    self.error_page.as_ref()
  }

  /// Write the documents into the pages bucket.
  pub fn preload(&self, store: &CacheStore) -> Result<usize, EngineError> {
    let mut stored = 0;
    for doc in self.offline_page.iter().chain(self.error_page.iter()) {
      store.put(Bucket::Pages, &doc.key, &doc.response)?;
      debug!(key = %doc.key, "Preloaded fallback document");
      stored += 1;
    }
    Ok(stored)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_builtin_documents() {
    let docs = FallbackDocuments::from_config(&Config::default()).unwrap();
    assert_eq!(docs.root_key().url(), "http://localhost:3000/");

    let offline = docs.offline_page().unwrap();
    assert_eq!(offline.key.url(), "http://localhost:3000/offline.html");
    assert!(String::from_utf8_lossy(&offline.response.body).contains("You are offline"));
    assert_eq!(offline.content_type(), "text/html; charset=utf-8");
    assert!(docs.error_page().is_some());
  }

  #[test]
  fn test_custom_offline_page() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "<p>No signal from Olympus</p>").unwrap();

    let mut config = Config::default();
    config.offline.page_file = Some(file.path().to_path_buf());
    let docs = FallbackDocuments::from_config(&config).unwrap();
    assert_eq!(
      docs.offline_page().unwrap().response.body,
      b"<p>No signal from Olympus</p>"
    );
  }

  #[test]
  fn test_disabled() {
    let mut config = Config::default();
    config.offline.enabled = false;
    let docs = FallbackDocuments::from_config(&config).unwrap();
    assert!(docs.offline_page().is_none());
    assert!(docs.error_page().is_none());
  }
}
