//! Maps an intercepted request to the policy used to satisfy it.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cache::Bucket;
use crate::config::{secs_to_duration, Config, RouteConfig};
use crate::http::{Method, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  NetworkOnly,
  NetworkFirst,
  CacheFirst,
  StaleWhileRevalidate,
  CacheOnly,
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Strategy::NetworkOnly => "network-only",
      Strategy::NetworkFirst => "network-first",
      Strategy::CacheFirst => "cache-first",
      Strategy::StaleWhileRevalidate => "stale-while-revalidate",
      Strategy::CacheOnly => "cache-only",
    };
    f.write_str(name)
  }
}

/// How a request is satisfied. `bucket` is `None` only for network-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
  pub strategy: Strategy,
  pub bucket: Option<Bucket>,
  /// `None` = cached entries never go stale
  pub ttl: Option<Duration>,
}

impl Policy {
  pub const NETWORK_ONLY: Policy = Policy {
    strategy: Strategy::NetworkOnly,
    bucket: None,
    ttl: None,
  };
}

/// Compiled conditions of one route. All present conditions must hold.
#[derive(Debug)]
struct RouteMatch {
  host: Option<String>,
  path_prefix: Option<String>,
  pattern: Option<Regex>,
}

impl RouteMatch {
  fn matches(&self, request: &Request) -> bool {
    let host_ok = self.host.as_deref().map_or(true, |h| {
      request
        .url
        .host_str()
        .is_some_and(|rh| rh.eq_ignore_ascii_case(h))
    });
    let prefix_ok = self
      .path_prefix
      .as_deref()
      .map_or(true, |p| request.url.path().starts_with(p));
    let pattern_ok = self
      .pattern
      .as_ref()
      .map_or(true, |re| re.is_match(request.url.path()));

    host_ok && prefix_ok && pattern_ok
  }
}

#[derive(Debug)]
struct Route {
  name: String,
  matcher: RouteMatch,
  policy: Policy,
}

/// Ordered route table.
///
/// Resolution order:
/// 1. Authentication endpoints: network-only, before anything else
/// 2. Non-GET requests and hosts outside the application scope: network-only
/// 3. Navigations: network-first into the pages bucket
/// 4. First matching configured route
/// 5. The default policy (network-first, dynamic bucket)
#[derive(Debug)]
pub struct RouteMatcher {
  auth_paths: Vec<String>,
  origin_host: Option<String>,
  scope_hosts: Vec<String>,
  routes: Vec<Route>,
  navigation: Policy,
  default: Policy,
}

impl RouteMatcher {
  pub fn new(config: &Config) -> Result<Self> {
    let routes = config
      .routes
      .iter()
      .map(|r| Self::compile(r, config))
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      auth_paths: config.auth_paths.clone(),
      origin_host: config.scope.origin.host_str().map(str::to_ascii_lowercase),
      scope_hosts: config
        .scope
        .hosts
        .iter()
        .map(|h| h.to_ascii_lowercase())
        .collect(),
      routes,
      navigation: Policy {
        strategy: Strategy::NetworkFirst,
        bucket: Some(Bucket::Pages),
        ttl: config.buckets.pages.ttl(),
      },
      default: Policy {
        strategy: Strategy::NetworkFirst,
        bucket: Some(Bucket::Dynamic),
        ttl: config.default_ttl_secs.map(secs_to_duration),
      },
    })
  }

  fn compile(route: &RouteConfig, config: &Config) -> Result<Route> {
    let pattern = route
      .pattern
      .as_deref()
      .map(Regex::new)
      .transpose()
      .map_err(|e| eyre!("Route '{}' has an invalid pattern: {}", route.name, e))?;

    let policy = match (route.strategy, route.bucket) {
      (Strategy::NetworkOnly, _) => Policy::NETWORK_ONLY,
      (strategy, Some(bucket)) => Policy {
        strategy,
        bucket: Some(bucket),
        ttl: match route.ttl_secs {
          Some(secs) => Some(secs_to_duration(secs)),
          None => config.buckets.get(bucket).ttl(),
        },
      },
      (strategy, None) => {
        return Err(eyre!(
          "Route '{}' uses {} but names no bucket",
          route.name,
          strategy
        ))
      }
    };

    Ok(Route {
      name: route.name.clone(),
      matcher: RouteMatch {
        host: route.host.as_ref().map(|h| h.to_ascii_lowercase()),
        path_prefix: route.path_prefix.clone(),
        pattern,
      },
      policy,
    })
  }

  /// Token endpoints must never be cached or served stale.
  pub fn is_auth_endpoint(&self, request: &Request) -> bool {
    let path = request.url.path();
    self.auth_paths.iter().any(|p| path.starts_with(p.as_str()))
  }

  pub fn in_scope(&self, request: &Request) -> bool {
    match request.url.host_str() {
      Some(host) => {
        let host = host.to_ascii_lowercase();
        self.origin_host.as_deref() == Some(host.as_str()) || self.scope_hosts.contains(&host)
      }
      None => false,
    }
  }

  pub fn match_request(&self, request: &Request) -> Policy {
    self.resolve(request).1
  }

  /// Policy plus the name of the rule that produced it, for logging.
  pub fn resolve(&self, request: &Request) -> (&str, Policy) {
    if self.is_auth_endpoint(request) {
      return ("auth", Policy::NETWORK_ONLY);
    }
    if request.method != Method::Get {
      return ("non-get", Policy::NETWORK_ONLY);
    }
    if !self.in_scope(request) {
      return ("out-of-scope", Policy::NETWORK_ONLY);
    }
    if request.is_navigation() {
      return ("navigation", self.navigation);
    }

    self
      .routes
      .iter()
      .find(|r| r.matcher.matches(request))
      .map(|r| (r.name.as_str(), r.policy))
      .unwrap_or(("default", self.default))
  }
}
