//! trawl: a polite, resumable web crawler that fills analytic tables
//!
//! Given explicit URLs or site roots to discover via sitemaps, trawl fetches
//! pages concurrently while honoring per-host rate limits and robots.txt,
//! deduplicates by SURT key, and persists results into a user-named table of
//! an embedded analytic store. Re-runs send conditional GETs and update
//! stale rows; the merge verb tombstones rows that vanished from the source.
//!
//! The public surface mirrors the SQL-level verbs:
//!
//! ```no_run
//! use trawl::{crawl_into, CrawlOptions, CrawlSource, CrawlStore};
//!
//! # async fn example() -> Result<(), trawl::TrawlError> {
//! let store = CrawlStore::open(std::path::Path::new("crawl.db"))?;
//! let options = CrawlOptions::new("ExampleBot/1.0 (+https://example.org/bot)");
//! let report = crawl_into(
//!     &store,
//!     "pages",
//!     CrawlSource::Urls(vec!["https://example.com/".into()]),
//!     options,
//! )
//! .await?;
//! println!("crawled {} URLs", report.succeeded);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crawler;
pub mod fetch;
pub mod robots;
pub mod sitemap;
pub mod state;
pub mod storage;
pub mod url;

use thiserror::Error;

/// Top-level error type for crawl operations
#[derive(Debug, Error)]
pub enum TrawlError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("URL error: {0}")]
    Url(#[from] UrlError),

    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("crawl failed during flush: {0}")]
    Flush(String),
}

/// Bind-time configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Binding(String),

    #[error("validation error: {0}")]
    Validation(String),
}

/// URL-level errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("failed to parse URL: {0}")]
    Parse(String),

    #[error("unsupported URL scheme: {0}")]
    InvalidScheme(String),

    #[error("URL has no host")]
    MissingHost,
}

/// Result type alias for crawl operations
pub type Result<T> = std::result::Result<T, TrawlError>;

// Re-export the verb surface
pub use config::{CrawlOptions, OptionValue};
pub use crawler::{
    crawl_into, crawl_sites_into, install_ctrl_c, CancellationToken, Coordinator, CrawlReport,
    CrawlSource, SiteSource,
};
pub use state::RunStatus;
pub use storage::{merge_into, CrawlStore, MergeOptions, MergeReport, ResultRow};
