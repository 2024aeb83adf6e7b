//! Error classification for fetch outcomes
//!
//! Every failed fetch is classified into exactly one [`ErrorType`], and the
//! classification is deterministic given the response (or transport error).
//! The string forms are what land in the result table's `error_type` column.

use std::fmt;

/// Classified failure categories for crawl outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    NetworkTimeout,
    NetworkDnsFailure,
    NetworkConnectionRefused,
    NetworkSslError,
    /// 4xx other than 429
    HttpClientError,
    /// 5xx other than a 503 carrying Retry-After
    HttpServerError,
    /// 429, or 503 with Retry-After
    HttpRateLimited,
    ContentTooLarge,
    ContentTypeRejected,
    RobotsDisallowed,
    RedirectLoop,
    SitemapParseError,
    InvalidUrl,
    Unknown,
}

impl ErrorType {
    /// Column value stored in `error_type`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network_timeout",
            Self::NetworkDnsFailure => "network_dns_failure",
            Self::NetworkConnectionRefused => "network_connection_refused",
            Self::NetworkSslError => "network_ssl_error",
            Self::HttpClientError => "http_client_error",
            Self::HttpServerError => "http_server_error",
            Self::HttpRateLimited => "http_rate_limited",
            Self::ContentTooLarge => "content_too_large",
            Self::ContentTypeRejected => "content_type_rejected",
            Self::RobotsDisallowed => "robots_disallowed",
            Self::RedirectLoop => "redirect_loop",
            Self::SitemapParseError => "sitemap_parse_error",
            Self::InvalidUrl => "invalid_url",
            Self::Unknown => "unknown",
        }
    }

    /// Parses a stored column value back into the enum
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "network_timeout" => Some(Self::NetworkTimeout),
            "network_dns_failure" => Some(Self::NetworkDnsFailure),
            "network_connection_refused" => Some(Self::NetworkConnectionRefused),
            "network_ssl_error" => Some(Self::NetworkSslError),
            "http_client_error" => Some(Self::HttpClientError),
            "http_server_error" => Some(Self::HttpServerError),
            "http_rate_limited" => Some(Self::HttpRateLimited),
            "content_too_large" => Some(Self::ContentTooLarge),
            "content_type_rejected" => Some(Self::ContentTypeRejected),
            "robots_disallowed" => Some(Self::RobotsDisallowed),
            "redirect_loop" => Some(Self::RedirectLoop),
            "sitemap_parse_error" => Some(Self::SitemapParseError),
            "invalid_url" => Some(Self::InvalidUrl),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Whether the worker should re-enqueue the entry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkTimeout
                | Self::NetworkDnsFailure
                | Self::NetworkConnectionRefused
                | Self::NetworkSslError
                | Self::HttpRateLimited
                | Self::HttpServerError
        )
    }

    /// Whether the scheduler should advance the host's backoff tier
    pub fn triggers_backoff(&self) -> bool {
        matches!(
            self,
            Self::NetworkTimeout
                | Self::NetworkDnsFailure
                | Self::NetworkConnectionRefused
                | Self::NetworkSslError
                | Self::HttpRateLimited
                | Self::HttpServerError
        )
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies an HTTP status code, `None` for success and redirects
pub fn classify_status(status: u16, has_retry_after: bool) -> Option<ErrorType> {
    match status {
        429 => Some(ErrorType::HttpRateLimited),
        503 if has_retry_after => Some(ErrorType::HttpRateLimited),
        s if (400..500).contains(&s) => Some(ErrorType::HttpClientError),
        s if (500..600).contains(&s) => Some(ErrorType::HttpServerError),
        _ => None,
    }
}

/// 408 and 425 stay `http_client_error` but are promoted to retryable
pub fn status_promoted_retryable(status: u16) -> bool {
    matches!(status, 408 | 425)
}

/// Classifies a transport-level reqwest error
pub fn classify_transport(err: &reqwest::Error) -> ErrorType {
    if err.is_timeout() {
        return ErrorType::NetworkTimeout;
    }

    // reqwest does not expose DNS/TLS failure kinds directly; inspect the
    // error chain text, which is stable for hyper/rustls sources.
    let chain = error_chain_text(err);
    if chain.contains("dns") || chain.contains("failed to lookup") {
        return ErrorType::NetworkDnsFailure;
    }
    if chain.contains("certificate") || chain.contains("tls") || chain.contains("ssl") {
        return ErrorType::NetworkSslError;
    }
    if err.is_connect() {
        return ErrorType::NetworkConnectionRefused;
    }
    ErrorType::Unknown
}

fn error_chain_text(err: &reqwest::Error) -> String {
    let mut text = err.to_string().to_lowercase();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        text.push(' ');
        text.push_str(&inner.to_string().to_lowercase());
        source = inner.source();
    }
    text
}

/// Matches a `Content-Type` header value against a glob like `text/*`
///
/// Only the media type is compared; parameters (`; charset=...`) are ignored.
/// Comparison is case-insensitive. `*` and `*/*` match everything.
pub fn content_type_matches(pattern: &str, content_type: &str) -> bool {
    let media = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    let pattern = pattern.trim().to_lowercase();

    if pattern == "*" || pattern == "*/*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return media
            .split('/')
            .next()
            .is_some_and(|main| main == prefix);
    }
    media == pattern
}
