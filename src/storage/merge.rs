//! Three-clause merge into a result table
//!
//! The source relation carries the target's column layout and is matched to
//! the target by exact `url`. Clauses, in order:
//!
//! 1. MATCHED and the staleness predicate holds → update the row in place
//! 2. NOT MATCHED → insert the row
//! 3. NOT MATCHED BY SOURCE → tombstone (`is_deleted = 1`)
//!
//! The whole merge runs inside one transaction, so all three clauses observe
//! the target as of merge start and no key can end in two states.

use crate::config::validate_identifier;
use crate::storage::{CrawlStore, ResultRow, StorageResult};
use crate::TrawlError;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Transaction};

/// Controls the MATCHED-clause predicate
#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// A matched row is updated only when its stored `crawled_at` is older
    /// than this. `None` updates every matched row.
    pub update_if_older_than: Option<Duration>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            update_if_older_than: Some(Duration::hours(24)),
        }
    }
}

/// What the merge did, clause by clause
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub updated: u64,
    pub inserted: u64,
    pub tombstoned: u64,
}

/// Merges a source relation into `target`
///
/// Fails at bind time on an invalid target identifier; storage errors roll
/// the whole merge back.
pub fn merge_into(
    store: &CrawlStore,
    target: &str,
    source: &[ResultRow],
    options: &MergeOptions,
) -> Result<MergeReport, TrawlError> {
    validate_identifier(target)?;
    store.create_crawl_tables(target)?;

    let report = store.with_transaction(|tx| run_merge(tx, target, source, options))?;
    Ok(report)
}

fn run_merge(
    tx: &Transaction<'_>,
    target: &str,
    source: &[ResultRow],
    options: &MergeOptions,
) -> StorageResult<MergeReport> {
    let mut report = MergeReport::default();

    // Stage the source key set; the tombstone clause needs it as a relation.
    tx.execute_batch(
        "CREATE TEMP TABLE IF NOT EXISTS _merge_source (url TEXT PRIMARY KEY);
         DELETE FROM _merge_source;",
    )?;

    let select_sql = format!("SELECT crawled_at FROM \"{target}\" WHERE url = ?1");
    let update_sql = format!(
        "UPDATE \"{target}\" SET \
           surt_key = ?2, domain = ?3, http_status = ?4, body = ?5, content_type = ?6, \
           elapsed_ms = ?7, crawled_at = ?8, error = ?9, error_type = ?10, etag = ?11, \
           last_modified = ?12, content_hash = ?13, is_deleted = 0 \
         WHERE url = ?1"
    );
    let insert_sql = format!(
        "INSERT INTO \"{target}\" \
         (url, surt_key, domain, http_status, body, content_type, elapsed_ms, crawled_at, \
          error, error_type, etag, last_modified, content_hash, is_deleted) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0)"
    );

    {
        let mut stage = tx.prepare("INSERT OR IGNORE INTO _merge_source (url) VALUES (?1)")?;
        let mut select = tx.prepare(&select_sql)?;
        let mut update = tx.prepare(&update_sql)?;
        let mut insert = tx.prepare(&insert_sql)?;

        for row in source {
            stage.execute(params![row.url])?;

            let existing: Option<Option<String>> = select
                .query_row(params![row.url], |r| r.get(0))
                .optional()?;

            match existing {
                Some(stored_crawled_at) => {
                    if matched_predicate(stored_crawled_at.as_deref(), options) {
                        update.execute(params![
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
                        report.updated += 1;
                    }
                }
                None => {
                    insert.execute(params![
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
                    report.inserted += 1;
                }
            }
        }
    }

    let tombstone_sql = format!(
        "UPDATE \"{target}\" SET is_deleted = 1 \
         WHERE is_deleted = 0 AND url NOT IN (SELECT url FROM _merge_source)"
    );
    report.tombstoned = tx.execute(&tombstone_sql, [])? as u64;

    tx.execute_batch("DROP TABLE _merge_source;")?;
    Ok(report)
}

/// True when the stored row is stale enough to overwrite
fn matched_predicate(stored_crawled_at: Option<&str>, options: &MergeOptions) -> bool {
    let Some(threshold) = options.update_if_older_than else {
        return true;
    };
    let Some(stored) = stored_crawled_at else {
        // No stored timestamp: treat as infinitely stale
        return true;
    };
    match stored.parse::<DateTime<Utc>>() {
        Ok(at) => Utc::now() - at > threshold,
        Err(_) => true,
    }
}
