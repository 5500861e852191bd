//! Per-bucket capacity enforcement.

use color_eyre::Result;

use super::traits::{Bucket, CacheStorage};

/// Delete the oldest-stamped entries until `bucket` holds at most
/// `max_entries`. Returns the number of entries evicted.
///
/// Callers must hold the bucket's write lock so no put interleaves with the
/// sweep.
pub(crate) fn enforce(storage: &dyn CacheStorage, bucket: Bucket, max_entries: usize) -> Result<usize> {
  let count = storage.count(bucket)?;
  if count <= max_entries {
    return Ok(0);
  }

  let mut stamps = storage.stamps(bucket)?;
  // Key breaks ties so the order is total
  stamps.sort_by(|a, b| a.stored_at.cmp(&b.stored_at).then_with(|| a.key.cmp(&b.key)));

  let excess = stamps.len().saturating_sub(max_entries);
  let mut evicted = 0;
  for stamp in stamps.into_iter().take(excess) {
    if storage.delete(bucket, &stamp.key)? {
      evicted += 1;
    }
  }

  Ok(evicted)
}
