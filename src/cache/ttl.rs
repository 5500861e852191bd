//! Freshness rule shared by request handling and maintenance sweeps.

use chrono::{DateTime, Duration, Utc};

use super::traits::CacheEntry;

/// An entry is expired once strictly more than `ttl` has passed since it was
/// stored. `None` means the bucket never expires.
pub fn is_expired(entry: &CacheEntry, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
  is_stamp_expired(entry.stored_at, ttl, now)
}

pub(crate) fn is_stamp_expired(
  stored_at: DateTime<Utc>,
  ttl: Option<Duration>,
  now: DateTime<Utc>,
) -> bool {
  match ttl {
    None => false,
    Some(ttl) => now - stored_at > ttl,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::{Bucket, CacheKey};
  use url::Url;

  fn entry_at(stored_at: DateTime<Utc>) -> CacheEntry {
    CacheEntry {
      key: CacheKey::for_url(&Url::parse("https://myth.example/").unwrap()),
      bucket: Bucket::Dynamic,
      status: 200,
      headers: vec![],
      body: vec![],
      stored_at,
    }
  }

  #[test]
  fn test_no_ttl_never_expires() {
    let stored = Utc::now();
    let entry = entry_at(stored);
    assert!(!is_expired(&entry, None, stored + Duration::days(10_000)));
  }

  #[test]
  fn test_expiry_boundary_is_exclusive() {
    let stored = Utc::now();
    let entry = entry_at(stored);
    let ttl = Some(Duration::minutes(5));

    assert!(!is_expired(&entry, ttl, stored));
    assert!(!is_expired(&entry, ttl, stored + Duration::minutes(5)));
    assert!(is_expired(
      &entry,
      ttl,
      stored + Duration::minutes(5) + Duration::microseconds(1)
    ));
  }

  #[test]
  fn test_future_stamp_is_fresh() {
    // Clock skew: entry stamped ahead of now
    let now = Utc::now();
    let entry = entry_at(now + Duration::hours(1));
    assert!(!is_expired(&entry, Some(Duration::seconds(1)), now));
  }
}
