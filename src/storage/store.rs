//! The crawl's handle on the embedded analytic store
//!
//! `CrawlStore` owns the connection behind a mutex; every statement the
//! engine runs goes through here. Batch flushes are transactional: result
//! rows, their durable-queue deletions, and the progress update commit
//! together or not at all.

use crate::state::{ProgressSnapshot, RunStatus};
use crate::storage::schema;
use crate::storage::{
    CachedSitemapUrl, PriorRow, QueueRecord, ResultRow, StorageError, StorageResult,
};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone)]
pub struct CrawlStore {
    conn: Arc<Mutex<Connection>>,
}

impl CrawlStore {
    /// Opens (or creates) a store at the given path
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;
        Self::init(conn)
    }

    /// In-memory store, handy for tests and scratch crawls
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Adopts a connection the host engine already holds
    pub fn from_connection(conn: Connection) -> StorageResult<Self> {
        Self::init(conn)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(schema::SHARED_TABLES_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned connection mutex means a worker panicked mid-statement;
        // the store itself is still consistent (transactions), so continue.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs a closure against the raw connection under the writer lock
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> StorageResult<T> {
        let conn = self.lock();
        Ok(f(&conn)?)
    }

    /// Runs a closure inside a transaction; commit on Ok, rollback on Err
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Creates the target table and its auxiliaries if absent
    pub fn create_crawl_tables(&self, target: &str) -> StorageResult<()> {
        let conn = self.lock();
        conn.execute_batch(&schema::target_table_sql(target))?;
        conn.execute_batch(&schema::queue_table_sql(target))?;
        conn.execute_batch(&schema::progress_table_sql(target))?;
        Ok(())
    }

    /// Executes a user source query and collects its `url` column
    pub fn source_urls(&self, sql: &str) -> StorageResult<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let idx = stmt
            .column_names()
            .iter()
            .position(|name| name.eq_ignore_ascii_case("url"))
            .ok_or_else(|| StorageError::MissingColumn("url".to_string()))?;
        let urls = stmt
            .query_map([], |row| row.get::<_, String>(idx))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(urls)
    }

    /// Executes a sites source query and collects its host column
    ///
    /// Accepts a column named `site`, `host`, or `url`, in that order.
    pub fn source_sites(&self, sql: &str) -> StorageResult<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let idx = ["site", "host", "url"]
            .iter()
            .find_map(|wanted| {
                stmt.column_names()
                    .iter()
                    .position(|name| name.eq_ignore_ascii_case(wanted))
            })
            .ok_or_else(|| StorageError::MissingColumn("site".to_string()))?;
        let sites = stmt
            .query_map([], |row| row.get::<_, String>(idx))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sites)
    }

    // ===== Result rows =====

    /// Fetches the stored row for a URL, for conditional GETs and 304 reuse
    pub fn prior_row(&self, target: &str, url: &str) -> StorageResult<Option<PriorRow>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT etag, last_modified, content_type, body, content_hash, crawled_at \
             FROM \"{target}\" WHERE url = ?1"
        );
        let row = conn
            .query_row(&sql, params![url], |row| {
                Ok(PriorRow {
                    etag: row.get(0)?,
                    last_modified: row.get(1)?,
                    content_type: row.get(2)?,
                    body: row.get(3)?,
                    content_hash: row.get(4)?,
                    crawled_at: row
                        .get::<_, Option<String>>(5)?
                        .and_then(|s| s.parse::<DateTime<Utc>>().ok()),
                })
            })
            .optional()?;
        Ok(row)
    }

    /// Flushes a batch: upsert rows, clear queue mirrors, bump progress
    ///
    /// `queue_keys` are the SURT keys whose durable queue rows this batch
    /// settles. They are listed separately from the rows because a redirect
    /// can give a result row a different key than the entry that produced
    /// it, and a silent policy drop settles a queue row with no result row
    /// at all.
    pub fn flush_batch(
        &self,
        target: &str,
        run_id: i64,
        rows: &[ResultRow],
        queue_keys: &[String],
        snapshot: ProgressSnapshot,
        status: RunStatus,
    ) -> StorageResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let upsert_sql = format!(
                "INSERT INTO \"{target}\" \
                 (url, surt_key, domain, http_status, body, content_type, elapsed_ms, \
                  crawled_at, error, error_type, etag, last_modified, content_hash, is_deleted) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0) \
                 ON CONFLICT(url) DO UPDATE SET \
                   surt_key = excluded.surt_key, domain = excluded.domain, \
                   http_status = excluded.http_status, body = excluded.body, \
                   content_type = excluded.content_type, elapsed_ms = excluded.elapsed_ms, \
                   crawled_at = excluded.crawled_at, error = excluded.error, \
                   error_type = excluded.error_type, etag = excluded.etag, \
                   last_modified = excluded.last_modified, \
                   content_hash = excluded.content_hash, is_deleted = 0"
            );
            let queue_table = schema::queue_table_name(target);
            let delete_sql = format!("DELETE FROM \"{queue_table}\" WHERE surt_key = ?1");

            let mut upsert = tx.prepare(&upsert_sql)?;
            let mut delete = tx.prepare(&delete_sql)?;
            for row in rows {
                upsert.execute(params![
                    row.url,
                    row.surt_key,
                    row.domain,
                    row.http_status,
                    row.body,
                    row.content_type,
                    row.elapsed_ms,
                    row.crawled_at.to_rfc3339(),
                    row.error,
                    row.error_type,
                    row.etag,
                    row.last_modified,
                    row.content_hash,
                ])?;
            }
            for key in queue_keys {
                delete.execute(params![key])?;
            }

            Self::write_progress(&tx, target, run_id, snapshot, status)?;
        }
        tx.commit()?;
        Ok(())
    }

    // ===== Progress =====

    /// Creates the progress row for a new run and returns its id
    pub fn create_progress_row(&self, target: &str) -> StorageResult<i64> {
        let conn = self.lock();
        let table = schema::progress_table_name(target);
        let now = Utc::now().to_rfc3339();
        let sql = format!(
            "INSERT INTO \"{table}\" (target_table, started_at, updated_at, status) \
             VALUES (?1, ?2, ?2, ?3)"
        );
        conn.execute(
            &sql,
            params![target, now, RunStatus::Running.to_db_string()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Updates the progress row outside a batch flush
    pub fn update_progress(
        &self,
        target: &str,
        run_id: i64,
        snapshot: ProgressSnapshot,
        status: RunStatus,
    ) -> StorageResult<()> {
        let conn = self.lock();
        Self::write_progress(&conn, target, run_id, snapshot, status)
    }

    fn write_progress(
        conn: &Connection,
        target: &str,
        run_id: i64,
        snapshot: ProgressSnapshot,
        status: RunStatus,
    ) -> StorageResult<()> {
        let table = schema::progress_table_name(target);
        let sql = format!(
            "UPDATE \"{table}\" SET updated_at = ?1, total_discovered = ?2, processed = ?3, \
             succeeded = ?4, failed = ?5, skipped = ?6, in_flight = ?7, queue_depth = ?8, \
             status = ?9 WHERE run_id = ?10"
        );
        let changed = conn.execute(
            &sql,
            params![
                Utc::now().to_rfc3339(),
                snapshot.total_discovered,
                snapshot.processed,
                snapshot.succeeded,
                snapshot.failed,
                snapshot.skipped,
                snapshot.in_flight,
                snapshot.queue_depth,
                status.to_db_string(),
                run_id,
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    /// Reads a run's status back, mostly for tests and monitoring
    pub fn run_status(&self, target: &str, run_id: i64) -> StorageResult<Option<RunStatus>> {
        let conn = self.lock();
        let table = schema::progress_table_name(target);
        let sql = format!("SELECT status FROM \"{table}\" WHERE run_id = ?1");
        let status = conn
            .query_row(&sql, params![run_id], |row| row.get::<_, String>(0))
            .optional()?;
        Ok(status.and_then(|s| RunStatus::from_db_string(&s)))
    }

    // ===== Durable queue mirror =====

    /// Mirrors queue entries durably; called when entries are enqueued
    pub fn queue_push_all(&self, target: &str, records: &[QueueRecord]) -> StorageResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let table = schema::queue_table_name(target);
            let sql = format!(
                "INSERT INTO \"{table}\" \
                 (surt_key, url, host, enqueued_at, attempt_count, last_error_type) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(surt_key) DO UPDATE SET \
                   attempt_count = excluded.attempt_count, \
                   last_error_type = excluded.last_error_type"
            );
            let mut stmt = tx.prepare(&sql)?;
            for record in records {
                stmt.execute(params![
                    record.surt_key,
                    record.url,
                    record.host,
                    record.enqueued_at.to_rfc3339(),
                    record.attempt_count,
                    record.last_error_type,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Loads surviving queue entries so an interrupted run can resume
    pub fn load_queue(&self, target: &str) -> StorageResult<Vec<QueueRecord>> {
        let conn = self.lock();
        let table = schema::queue_table_name(target);
        let sql = format!(
            "SELECT surt_key, url, host, enqueued_at, attempt_count, last_error_type \
             FROM \"{table}\" ORDER BY enqueued_at"
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map([], |row| {
                Ok(QueueRecord {
                    surt_key: row.get(0)?,
                    url: row.get(1)?,
                    host: row.get(2)?,
                    enqueued_at: row
                        .get::<_, String>(3)?
                        .parse::<DateTime<Utc>>()
                        .unwrap_or_else(|_| Utc::now()),
                    attempt_count: row.get(4)?,
                    last_error_type: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Queue depth of the durable mirror
    pub fn queue_len(&self, target: &str) -> StorageResult<u64> {
        let conn = self.lock();
        let table = schema::queue_table_name(target);
        let sql = format!("SELECT COUNT(*) FROM \"{table}\"");
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ===== Sitemap cache and discovery status =====

    /// Returns cached sitemap contents when newer than `max_age_hours`
    pub fn sitemap_cache_get(
        &self,
        sitemap_url: &str,
        max_age_hours: i64,
    ) -> StorageResult<Option<Vec<CachedSitemapUrl>>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT discovered_urls, discovered_at FROM _sitemap_cache WHERE sitemap_url = ?1",
                params![sitemap_url],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                    ))
                },
            )
            .optional()?;

        let Some((urls_json, discovered_at)) = row else {
            return Ok(None);
        };
        let Ok(discovered_at) = discovered_at.parse::<DateTime<Utc>>() else {
            return Ok(None);
        };
        if Utc::now() - discovered_at > Duration::hours(max_age_hours) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&urls_json)?))
    }

    /// Caches the unfiltered URL list discovered from one sitemap
    pub fn sitemap_cache_put(
        &self,
        host: &str,
        sitemap_url: &str,
        urls: &[CachedSitemapUrl],
    ) -> StorageResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO _sitemap_cache (sitemap_url, host, discovered_urls, discovered_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(sitemap_url) DO UPDATE SET \
               host = excluded.host, discovered_urls = excluded.discovered_urls, \
               discovered_at = excluded.discovered_at",
            params![
                sitemap_url,
                host,
                serde_json::to_string(urls)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Records a completed discovery pass for a host
    pub fn record_discovery(&self, host: &str, urls_discovered: u64) -> StorageResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO _discovery_status (host, last_discovery_at, urls_discovered, cursor) \
             VALUES (?1, ?2, ?3, ?3) \
             ON CONFLICT(host) DO UPDATE SET \
               last_discovery_at = excluded.last_discovery_at, \
               urls_discovered = excluded.urls_discovered, \
               cursor = excluded.cursor",
            params![host, Utc::now().to_rfc3339(), urls_discovered as i64],
        )?;
        Ok(())
    }
}
