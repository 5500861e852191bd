//! Durable replay of mutating requests that failed while offline.

mod manager;
mod queue;

pub use manager::{BackgroundSyncManager, SyncState, SyncSummary};
pub use queue::{SyncQueue, SyncQueueItem};
