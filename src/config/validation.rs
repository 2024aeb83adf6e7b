use crate::config::types::CrawlOptions;
use crate::ConfigError;

/// Validates bound options; every failure here is a bind-time error
pub fn validate(options: &CrawlOptions) -> Result<(), ConfigError> {
    if options.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user_agent must not be empty".to_string(),
        ));
    }

    if options.min_crawl_delay < 0.0 {
        return Err(ConfigError::Validation(format!(
            "min_crawl_delay must be >= 0, got {}",
            options.min_crawl_delay
        )));
    }

    if options.max_crawl_delay < options.min_crawl_delay {
        return Err(ConfigError::Validation(format!(
            "max_crawl_delay ({}) must be >= min_crawl_delay ({})",
            options.max_crawl_delay, options.min_crawl_delay
        )));
    }

    if options.timeout_seconds == 0 {
        return Err(ConfigError::Validation(
            "timeout_seconds must be >= 1".to_string(),
        ));
    }

    if options.max_parallel_per_domain == 0 {
        return Err(ConfigError::Validation(
            "max_parallel_per_domain must be >= 1".to_string(),
        ));
    }

    if options.max_total_connections == 0 {
        return Err(ConfigError::Validation(
            "max_total_connections must be >= 1".to_string(),
        ));
    }

    if options.max_response_bytes == 0 {
        return Err(ConfigError::Validation(
            "max_response_bytes must be >= 1".to_string(),
        ));
    }

    if options.sitemap_cache_hours < 0 {
        return Err(ConfigError::Validation(
            "sitemap_cache_hours must be >= 0".to_string(),
        ));
    }

    Ok(())
}

/// Validates a target-table name before it is interpolated into DDL
///
/// Identifiers must match `[A-Za-z_][A-Za-z0-9_]*`. Everything interpolated
/// into SQL is additionally double-quoted, so this is a belt-and-suspenders
/// gate rather than the only defense.
pub fn validate_identifier(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = name
        .chars()
        .skip(1)
        .all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!(
            "invalid table identifier '{name}'"
        )))
    }
}
