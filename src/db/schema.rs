/// Schema for the cache buckets and the durable sync queue.
pub const SCHEMA: &str = r#"
-- Cached responses, partitioned by cache version and bucket
CREATE TABLE IF NOT EXISTS cache_entries (
    version TEXT NOT NULL,
    bucket TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at INTEGER NOT NULL,  -- microseconds since the Unix epoch
    PRIMARY KEY (version, bucket, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_stored
    ON cache_entries(version, bucket, stored_at);

-- Failed mutating requests awaiting replay, drained in id order
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    enqueued_at INTEGER NOT NULL
);
"#;
