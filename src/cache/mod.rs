//! Bucketed response cache.
//!
//! This module provides the storage side of the offline engine:
//! - A fixed set of named buckets, each with its own capacity and TTL
//! - Interchangeable storage backends (SQLite for durability, memory for tests
//!   and ephemeral runs)
//! - Capacity enforcement by evicting the oldest-stamped entries after each write
//! - A pure freshness check used by request handling and maintenance sweeps

mod lru;
mod storage;
mod store;
mod traits;
pub mod ttl;

pub use storage::{MemoryStorage, SqliteStorage};
pub use store::{BucketStats, CacheStore, EntryStats};
pub use traits::{Bucket, CacheEntry, CacheKey, CacheStorage, EntryStamp};
