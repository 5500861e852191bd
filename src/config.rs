//! YAML configuration, its search order and validation.

use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;
use url::Url;

use crate::cache::Bucket;
use crate::routing::Strategy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Cache generation. Entries written under any other version are purged on activation.
  pub version: String,
  pub scope: ScopeConfig,
  pub network: NetworkConfig,
  pub storage: StorageConfig,
  pub buckets: BucketsConfig,
  /// Path prefixes of authentication endpoints. Always network-only.
  pub auth_paths: Vec<String>,
  /// TTL of the fallback policy for in-scope requests no route matches
  pub default_ttl_secs: Option<u64>,
  /// Ordered route table. First match wins.
  pub routes: Vec<RouteConfig>,
  pub offline: OfflineConfig,
  /// App-shell URLs fetched into the static bucket at startup
  pub precache: Vec<String>,
  pub maintenance: MaintenanceConfig,
  pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
  /// Origin of the owning application; relative URLs resolve against it
  pub origin: Url,
  /// Additional hosts whose traffic the engine may cache (font CDNs etc.)
  pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_ms: u64,
  pub connect_timeout_ms: u64,
  pub user_agent: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// Durable storage in a SQLite file
  #[default]
  Sqlite,
  /// Buckets live in memory; the sync queue still uses SQLite
  Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  pub backend: StorageBackend,
  /// Database file (default: $XDG_DATA_HOME/offline-cache/cache.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct BucketConfig {
  pub max_entries: usize,
  /// Seconds before an entry is stale. `null` = never expires.
  pub ttl_secs: Option<u64>,
}

impl BucketConfig {
  pub fn ttl(&self) -> Option<chrono::Duration> {
    self.ttl_secs.map(secs_to_duration)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BucketsConfig {
  #[serde(rename = "static")]
  pub static_assets: BucketConfig,
  pub dynamic: BucketConfig,
  pub images: BucketConfig,
  pub fonts: BucketConfig,
  pub pages: BucketConfig,
}

impl BucketsConfig {
  pub fn get(&self, bucket: Bucket) -> &BucketConfig {
    match bucket {
      Bucket::Static => &self.static_assets,
      Bucket::Dynamic => &self.dynamic,
      Bucket::Images => &self.images,
      Bucket::Fonts => &self.fonts,
      Bucket::Pages => &self.pages,
    }
  }
}

impl Default for BucketsConfig {
  fn default() -> Self {
    const HOUR: u64 = 60 * 60;
    const DAY: u64 = 24 * HOUR;
    Self {
      static_assets: BucketConfig {
        max_entries: 100,
        ttl_secs: Some(7 * DAY),
      },
      dynamic: BucketConfig {
        max_entries: 50,
        ttl_secs: Some(DAY),
      },
      images: BucketConfig {
        max_entries: 100,
        ttl_secs: Some(30 * DAY),
      },
      fonts: BucketConfig {
        max_entries: 30,
        ttl_secs: None,
      },
      pages: BucketConfig {
        max_entries: 25,
        ttl_secs: Some(HOUR),
      },
    }
  }
}

/// One row of the route table. Every condition that is set must hold.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
  pub name: String,
  /// Exact host, case-insensitive
  #[serde(default)]
  pub host: Option<String>,
  #[serde(default)]
  pub path_prefix: Option<String>,
  /// Regex tested against the URL path
  #[serde(default)]
  pub pattern: Option<String>,
  pub strategy: Strategy,
  #[serde(default)]
  pub bucket: Option<Bucket>,
  /// Overrides the bucket TTL for this route
  #[serde(default)]
  pub ttl_secs: Option<u64>,
}

impl RouteConfig {
  fn new(name: &str, strategy: Strategy, bucket: Bucket) -> Self {
    Self {
      name: name.to_string(),
      host: None,
      path_prefix: None,
      pattern: None,
      strategy,
      bucket: Some(bucket),
      ttl_secs: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
  pub enabled: bool,
  /// Root document tried before the offline page
  pub root_url: String,
  pub page_url: String,
  /// Replaces the built-in offline page
  pub page_file: Option<PathBuf>,
  pub error_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
  pub interval_secs: u64,
  /// Also run a background sync pass on every maintenance tick
  pub sync: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub default_title: String,
  pub default_icon: Option<String>,
  pub default_url: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      scope: ScopeConfig::default(),
      network: NetworkConfig::default(),
      storage: StorageConfig::default(),
      buckets: BucketsConfig::default(),
      auth_paths: vec![
        "/api/auth/".to_string(),
        "/auth/".to_string(),
        "/api/token".to_string(),
      ],
      default_ttl_secs: Some(60 * 60),
      routes: default_routes(),
      offline: OfflineConfig::default(),
      precache: Vec::new(),
      maintenance: MaintenanceConfig::default(),
      notifications: NotificationConfig::default(),
    }
  }
}

impl Default for ScopeConfig {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:3000/").expect("static URL"),
      hosts: vec![
        "fonts.googleapis.com".to_string(),
        "fonts.gstatic.com".to_string(),
      ],
    }
  }
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_ms: 5000,
      connect_timeout_ms: 3000,
      user_agent: concat!("offline-cache/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

impl Default for OfflineConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      root_url: "/".to_string(),
      page_url: "/offline.html".to_string(),
      page_file: None,
      error_url: "/error.html".to_string(),
    }
  }
}

impl Default for MaintenanceConfig {
  fn default() -> Self {
    Self {
      interval_secs: 60 * 60,
      sync: true,
    }
  }
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      default_title: "Mythology Encyclopedia".to_string(),
      default_icon: Some("/icons/icon-192x192.png".to_string()),
      default_url: "/".to_string(),
    }
  }
}

/// Route table shipped with the application. More specific rows come first.
fn default_routes() -> Vec<RouteConfig> {
  vec![
    RouteConfig {
      host: Some("fonts.googleapis.com".to_string()),
      ..RouteConfig::new("font-stylesheets", Strategy::CacheFirst, Bucket::Fonts)
    },
    RouteConfig {
      host: Some("fonts.gstatic.com".to_string()),
      ..RouteConfig::new("font-files", Strategy::CacheFirst, Bucket::Fonts)
    },
    RouteConfig {
      path_prefix: Some("/_next/static/".to_string()),
      ..RouteConfig::new("build-assets", Strategy::CacheFirst, Bucket::Static)
    },
    RouteConfig {
      pattern: Some(r"(?i)\.(png|jpe?g|gif|webp|avif|svg|ico)$".to_string()),
      ..RouteConfig::new("images", Strategy::CacheFirst, Bucket::Images)
    },
    RouteConfig {
      pattern: Some(r"\.(js|css)$".to_string()),
      ..RouteConfig::new("scripts-and-styles", Strategy::StaleWhileRevalidate, Bucket::Static)
    },
    RouteConfig {
      path_prefix: Some("/api/".to_string()),
      ttl_secs: Some(5 * 60),
      ..RouteConfig::new("api", Strategy::NetworkFirst, Bucket::Dynamic)
    },
  ]
}

pub(crate) fn secs_to_duration(secs: u64) -> chrono::Duration {
  i64::try_from(secs)
    .ok()
    .and_then(chrono::Duration::try_seconds)
    .unwrap_or(chrono::Duration::MAX)
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-cache/config.yaml
  ///
  /// Falls back to the built-in defaults when no file exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        tracing::debug!("No configuration file found, using defaults");
        Self::default()
      }
    };

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-cache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Reject configurations that would break engine invariants.
  pub fn validate(&self) -> Result<()> {
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    if self.network.timeout_ms == 0 {
      return Err(eyre!("network.timeout_ms must be greater than zero"));
    }

    for bucket in Bucket::ALL {
      if self.buckets.get(bucket).max_entries == 0 {
        return Err(eyre!("buckets.{}.max_entries must be at least 1", bucket));
      }
    }

    for route in &self.routes {
      if route.host.is_none() && route.path_prefix.is_none() && route.pattern.is_none() {
        return Err(eyre!("Route '{}' has no match condition", route.name));
      }
      if route.strategy != Strategy::NetworkOnly && route.bucket.is_none() {
        return Err(eyre!(
          "Route '{}' uses {} but names no bucket",
          route.name,
          route.strategy
        ));
      }
      if let Some(pattern) = &route.pattern {
        Regex::new(pattern)
          .map_err(|e| eyre!("Route '{}' has an invalid pattern: {}", route.name, e))?;
      }
      if let Some(host) = &route.host {
        if !self.in_scope(host) {
          return Err(eyre!(
            "Route '{}' targets host {} outside the application scope",
            route.name,
            host
          ));
        }
      }
    }

    Ok(())
  }

  /// Whether traffic to `host` belongs to the owning application.
  pub fn in_scope(&self, host: &str) -> bool {
    self
      .scope
      .origin
      .host_str()
      .is_some_and(|origin| origin.eq_ignore_ascii_case(host))
      || self.scope.hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
  }

  pub fn network_timeout(&self) -> StdDuration {
    StdDuration::from_millis(self.network.timeout_ms)
  }

  /// Resolve an application-relative URL against the origin.
  pub fn resolve_url(&self, url: &str) -> Result<Url> {
    self
      .scope
      .origin
      .join(url)
      .map_err(|e| eyre!("Invalid URL {}: {}", url, e))
  }

  /// Database file, honouring the configured override.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(p) => Ok(p.clone()),
      None => crate::db::Database::default_path(),
    }
  }
}
