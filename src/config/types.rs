use serde::Deserialize;

/// Options recognized by the crawl verbs' WITH clause
///
/// Every field except `user_agent` has a default; `user_agent` is required
/// because crawling without an honest identity is not something this engine
/// will do implicitly.
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlOptions {
    /// Sent as the HTTP User-Agent header and used for robots matching
    pub user_agent: String,

    /// Seed delay in seconds when robots.txt specifies none
    #[serde(default = "default_crawl_delay")]
    pub default_crawl_delay: f64,

    /// Lower clamp on the effective per-host delay, seconds
    #[serde(default)]
    pub min_crawl_delay: f64,

    /// Upper clamp on the effective per-host delay, seconds
    #[serde(default = "default_max_crawl_delay")]
    pub max_crawl_delay: f64,

    /// Per-request timeout, seconds
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// When false, every host gets an allow-all policy
    #[serde(default = "default_true")]
    pub respect_robots_txt: bool,

    /// Emit synthetic rows (`http_status = -1`) for robots/policy skips
    #[serde(default = "default_true")]
    pub log_skipped: bool,

    /// TTL for cached sitemap contents, hours
    #[serde(default = "default_sitemap_cache_hours")]
    pub sitemap_cache_hours: i64,

    /// Re-crawl URLs whose sitemap lastmod is newer than the stored row
    #[serde(default)]
    pub update_stale: bool,

    /// Cap on Fibonacci retry backoff, seconds
    #[serde(default = "default_max_retry_backoff")]
    pub max_retry_backoff_seconds: u64,

    /// Per-host in-flight cap
    #[serde(default = "default_max_parallel_per_domain")]
    pub max_parallel_per_domain: u32,

    /// Global in-flight cap; also the worker-pool size
    #[serde(default = "default_max_total_connections")]
    pub max_total_connections: u32,

    /// Response body size cap, bytes
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,

    /// Send Accept-Encoding: gzip, deflate
    #[serde(default = "default_true")]
    pub compress: bool,

    /// Content-type accept globs; empty means accept everything
    #[serde(default)]
    pub accept_content_types: Vec<String>,

    /// Content-type reject globs, checked after the accept list
    #[serde(default)]
    pub reject_content_types: Vec<String>,
}

impl CrawlOptions {
    /// Options with the documented defaults and the given user agent
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            default_crawl_delay: default_crawl_delay(),
            min_crawl_delay: 0.0,
            max_crawl_delay: default_max_crawl_delay(),
            timeout_seconds: default_timeout_seconds(),
            respect_robots_txt: true,
            log_skipped: true,
            sitemap_cache_hours: default_sitemap_cache_hours(),
            update_stale: false,
            max_retry_backoff_seconds: default_max_retry_backoff(),
            max_parallel_per_domain: default_max_parallel_per_domain(),
            max_total_connections: default_max_total_connections(),
            max_response_bytes: default_max_response_bytes(),
            compress: true,
            accept_content_types: Vec::new(),
            reject_content_types: Vec::new(),
        }
    }
}

fn default_crawl_delay() -> f64 {
    1.0
}

fn default_max_crawl_delay() -> f64 {
    60.0
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_sitemap_cache_hours() -> i64 {
    24
}

fn default_max_retry_backoff() -> u64 {
    600
}

fn default_max_parallel_per_domain() -> u32 {
    8
}

fn default_max_total_connections() -> u32 {
    32
}

fn default_max_response_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_applies_documented_defaults() {
        let options = CrawlOptions::new("Bot/1.0");
        assert_eq!(options.user_agent, "Bot/1.0");
        assert_eq!(options.default_crawl_delay, 1.0);
        assert_eq!(options.min_crawl_delay, 0.0);
        assert_eq!(options.max_crawl_delay, 60.0);
        assert_eq!(options.timeout_seconds, 30);
        assert!(options.respect_robots_txt);
        assert!(options.log_skipped);
        assert_eq!(options.sitemap_cache_hours, 24);
        assert!(!options.update_stale);
        assert_eq!(options.max_retry_backoff_seconds, 600);
        assert_eq!(options.max_parallel_per_domain, 8);
        assert_eq!(options.max_total_connections, 32);
        assert_eq!(options.max_response_bytes, 10 * 1024 * 1024);
        assert!(options.compress);
        assert!(options.accept_content_types.is_empty());
    }

    #[test]
    fn test_deserialize_requires_user_agent() {
        let result: Result<CrawlOptions, _> = serde_json::from_str("{}");
        assert!(result.is_err());

        let options: CrawlOptions =
            serde_json::from_str(r#"{"user_agent": "Bot/1.0", "timeout_seconds": 5}"#).unwrap();
        assert_eq!(options.timeout_seconds, 5);
        assert_eq!(options.max_crawl_delay, 60.0);
    }
}
