/// Tables for the offline action log and the resource cache.
pub const SCHEMA: &str = r#"
-- Durable log of user mutations awaiting replay (seq preserves enqueue order)
CREATE TABLE IF NOT EXISTS offline_actions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    operation TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_offline_actions_synced
    ON offline_actions(synced, seq);

-- Cached resources (seq orders eviction, oldest first)
CREATE TABLE IF NOT EXISTS resource_cache (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    payload BLOB NOT NULL,
    size INTEGER NOT NULL,
    cached_at TEXT NOT NULL
);

-- Single-row aggregate over resource_cache
CREATE TABLE IF NOT EXISTS cache_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    total_size INTEGER NOT NULL,
    last_cleanup TEXT
);

INSERT OR IGNORE INTO cache_meta (id, total_size, last_cleanup) VALUES (1, 0, NULL);
"#;
