/// Schema for the offline store.
pub const SCHEMA: &str = r#"
-- Durable key-value store (cache entries and the offline queue)
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Edge proxy buckets, one row per named bucket
CREATE TABLE IF NOT EXISTS edge_buckets (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Edge proxy cached responses
CREATE TABLE IF NOT EXISTS edge_entries (
    bucket TEXT NOT NULL,
    url_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, url_hash)
);

CREATE INDEX IF NOT EXISTS idx_edge_entries_bucket ON edge_entries(bucket);
"#;
