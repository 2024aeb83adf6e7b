//! WITH-clause option binding
//!
//! The host engine hands the crawl verbs a bag of named option values. This
//! module turns that bag into a validated [`CrawlOptions`], rejecting unknown
//! keys and type mismatches at bind time, before any tables are created or
//! workers started.

use crate::config::types::CrawlOptions;
use crate::config::validation::validate;
use crate::ConfigError;

/// A typed option value from the verb's WITH clause
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Text(String),
    Float(f64),
    Int(i64),
    Bool(bool),
}

impl OptionValue {
    fn as_text(&self, key: &str) -> Result<String, ConfigError> {
        match self {
            Self::Text(s) => Ok(s.clone()),
            other => Err(type_mismatch(key, "text", other)),
        }
    }

    fn as_f64(&self, key: &str) -> Result<f64, ConfigError> {
        match self {
            Self::Float(f) => Ok(*f),
            Self::Int(i) => Ok(*i as f64),
            other => Err(type_mismatch(key, "double", other)),
        }
    }

    fn as_u64(&self, key: &str) -> Result<u64, ConfigError> {
        match self {
            Self::Int(i) if *i >= 0 => Ok(*i as u64),
            Self::Int(i) => Err(ConfigError::Binding(format!(
                "option '{key}' must be non-negative, got {i}"
            ))),
            other => Err(type_mismatch(key, "integer", other)),
        }
    }

    fn as_bool(&self, key: &str) -> Result<bool, ConfigError> {
        match self {
            Self::Bool(b) => Ok(*b),
            other => Err(type_mismatch(key, "boolean", other)),
        }
    }
}

fn type_mismatch(key: &str, expected: &str, got: &OptionValue) -> ConfigError {
    let got = match got {
        OptionValue::Text(_) => "text",
        OptionValue::Float(_) => "double",
        OptionValue::Int(_) => "integer",
        OptionValue::Bool(_) => "boolean",
    };
    ConfigError::Binding(format!("option '{key}' expects {expected}, got {got}"))
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl CrawlOptions {
    /// Binds WITH-clause pairs into options, then validates them
    ///
    /// `user_agent` is required; unknown keys and type mismatches are
    /// bind-time errors, mirroring how the host engine treats unknown named
    /// parameters.
    pub fn from_with_pairs<'a, I>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, OptionValue)>,
    {
        let mut user_agent: Option<String> = None;
        let mut options = CrawlOptions::new(String::new());

        for (key, value) in pairs {
            match key {
                "user_agent" => user_agent = Some(value.as_text(key)?),
                "default_crawl_delay" => options.default_crawl_delay = value.as_f64(key)?,
                "min_crawl_delay" => options.min_crawl_delay = value.as_f64(key)?,
                "max_crawl_delay" => options.max_crawl_delay = value.as_f64(key)?,
                "timeout_seconds" => options.timeout_seconds = value.as_u64(key)?,
                "respect_robots_txt" => options.respect_robots_txt = value.as_bool(key)?,
                "log_skipped" => options.log_skipped = value.as_bool(key)?,
                "sitemap_cache_hours" => options.sitemap_cache_hours = value.as_u64(key)? as i64,
                "update_stale" => options.update_stale = value.as_bool(key)?,
                "max_retry_backoff_seconds" => {
                    options.max_retry_backoff_seconds = value.as_u64(key)?
                }
                "max_parallel_per_domain" => {
                    options.max_parallel_per_domain = value.as_u64(key)? as u32
                }
                "max_total_connections" => {
                    options.max_total_connections = value.as_u64(key)? as u32
                }
                "max_response_bytes" => options.max_response_bytes = value.as_u64(key)? as usize,
                "compress" => options.compress = value.as_bool(key)?,
                "accept_content_types" => {
                    options.accept_content_types = split_type_list(&value.as_text(key)?)
                }
                "reject_content_types" => {
                    options.reject_content_types = split_type_list(&value.as_text(key)?)
                }
                other => {
                    return Err(ConfigError::Binding(format!(
                        "unknown option '{other}'"
                    )))
                }
            }
        }

        options.user_agent = user_agent
            .ok_or_else(|| ConfigError::Binding("required option missing: user_agent".into()))?;

        validate(&options)?;
        Ok(options)
    }
}

fn split_type_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
