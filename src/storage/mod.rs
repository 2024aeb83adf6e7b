//! Persistence into the embedded analytic store
//!
//! The crawler treats the store as a connection that executes parameterized
//! statements and accepts batched writes. All writes (batch flushes, queue
//! mirror maintenance, progress updates, merges) are serialized through one
//! writer handle; the batch grain provides the throughput.

pub mod merge;
pub mod schema;
mod store;

pub use merge::{merge_into, MergeOptions, MergeReport};
pub use store::CrawlStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the storage layer
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("progress row not found for run {0}")]
    RunNotFound(i64),

    #[error("source query has no '{0}' column")]
    MissingColumn(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// One row of the result table
///
/// Every row written has a terminal outcome: a real HTTP response, a policy
/// skip (`http_status = -1` with `error_type` set), or an exhausted retry
/// (`http_status` of the last attempt with `error_type` set).
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub url: String,
    pub surt_key: String,
    pub domain: String,
    pub http_status: i32,
    pub body: Option<String>,
    pub content_type: Option<String>,
    pub elapsed_ms: i64,
    pub crawled_at: DateTime<Utc>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_hash: Option<String>,
}

/// The slice of a stored row needed for conditional re-crawls and 304 reuse
#[derive(Debug, Clone)]
pub struct PriorRow {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
    pub body: Option<String>,
    pub content_hash: Option<String>,
    pub crawled_at: Option<DateTime<Utc>>,
}

/// A durable mirror of one queue entry, for crash recovery
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRecord {
    pub surt_key: String,
    pub url: String,
    pub host: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_error_type: Option<String>,
}

/// One `(loc, lastmod)` pair cached from a sitemap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSitemapUrl {
    pub loc: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lastmod: Option<String>,
}
