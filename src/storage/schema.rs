//! Table definitions for the result table and its auxiliaries
//!
//! The target table name is user-supplied, so most DDL here is generated
//! per-target. Names are validated against `[A-Za-z_][A-Za-z0-9_]*` before
//! they reach this module and are double-quoted on interpolation anyway.

/// Name of the durable queue mirror for a target table
pub fn queue_table_name(target: &str) -> String {
    format!("_crawl_queue_{target}")
}

/// Name of the progress table for a target table
pub fn progress_table_name(target: &str) -> String {
    format!("_crawl_progress_{target}")
}

/// DDL for the result table (spec layout plus the merge tombstone flag)
pub fn target_table_sql(target: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS "{target}" (
    url TEXT PRIMARY KEY,
    surt_key TEXT,
    domain TEXT,
    http_status INTEGER,
    body TEXT,
    content_type TEXT,
    elapsed_ms INTEGER,
    crawled_at TEXT,
    error TEXT,
    error_type TEXT,
    etag TEXT,
    last_modified TEXT,
    content_hash TEXT,
    is_deleted INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS "idx_{target}_surt" ON "{target}"(surt_key);
CREATE INDEX IF NOT EXISTS "idx_{target}_domain_crawled" ON "{target}"(domain, crawled_at);
"#
    )
}

/// DDL for the durable queue mirror; rows live from enqueue to terminal flush
pub fn queue_table_sql(target: &str) -> String {
    let table = queue_table_name(target);
    format!(
        r#"
CREATE TABLE IF NOT EXISTS "{table}" (
    surt_key TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    host TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error_type TEXT
);
"#
    )
}

/// DDL for the per-target progress table, one row per run
pub fn progress_table_sql(target: &str) -> String {
    let table = progress_table_name(target);
    format!(
        r#"
CREATE TABLE IF NOT EXISTS "{table}" (
    run_id INTEGER PRIMARY KEY AUTOINCREMENT,
    target_table TEXT NOT NULL,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    total_discovered INTEGER NOT NULL DEFAULT 0,
    processed INTEGER NOT NULL DEFAULT 0,
    succeeded INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    in_flight INTEGER NOT NULL DEFAULT 0,
    queue_depth INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL
);
"#
    )
}

/// Shared tables used by every crawl regardless of target
pub const SHARED_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS _sitemap_cache (
    sitemap_url TEXT PRIMARY KEY,
    host TEXT NOT NULL,
    discovered_urls TEXT NOT NULL,
    discovered_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sitemap_cache_host ON _sitemap_cache(host);

CREATE TABLE IF NOT EXISTS _discovery_status (
    host TEXT PRIMARY KEY,
    last_discovery_at TEXT NOT NULL,
    urls_discovered INTEGER NOT NULL DEFAULT 0,
    cursor INTEGER NOT NULL DEFAULT 0
);
"#;
