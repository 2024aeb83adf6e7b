//! HTTP fetch pipeline
//!
//! One [`FetchClient`] is shared by all workers. Redirects are followed
//! manually so the policy rules (hop cap, loop detection, no https→http
//! downgrade) stay in one place, and so the final URL after redirects is
//! always known. Bodies are streamed into a bounded buffer; a response whose
//! transfer length exceeds the cap is abandoned mid-stream.

use crate::config::CrawlOptions;
use crate::fetch::classify::{
    classify_status, classify_transport, content_type_matches, ErrorType,
};
use chrono::{DateTime, Utc};
use reqwest::header;
use reqwest::redirect::Policy;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use url::Url;

/// Maximum redirect hops before the chain is abandoned
const MAX_REDIRECTS: usize = 10;

/// Conditional-GET headers built from a previously stored row
#[derive(Debug, Clone, Default)]
pub struct Conditional {
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
}

/// Everything a fetch produced, success or not
///
/// A failed fetch is not an `Err`: the outcome carries the classified error
/// so the worker can decide between retry and a terminal row.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// HTTP status, or 0 when no response was received
    pub status: u16,
    /// URL after following redirects; the original URL if none were followed
    pub final_url: Url,
    pub body: Option<String>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Parsed Retry-After, either delta-seconds or HTTP-date form
    pub retry_after: Option<Duration>,
    pub elapsed_ms: i64,
    pub error: Option<String>,
    pub error_type: Option<ErrorType>,
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        self.error_type.is_none() && (200..300).contains(&self.status)
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    fn failure(url: &Url, started: Instant, error_type: ErrorType, error: String) -> Self {
        Self {
            status: 0,
            final_url: url.clone(),
            body: None,
            content_type: None,
            etag: None,
            last_modified: None,
            retry_after: None,
            elapsed_ms: started.elapsed().as_millis() as i64,
            error: Some(error),
            error_type: Some(error_type),
        }
    }
}

/// Shared HTTP client with the crawl's fetch policy baked in
#[derive(Debug, Clone)]
pub struct FetchClient {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: usize,
    accept_types: Vec<String>,
    reject_types: Vec<String>,
}

impl FetchClient {
    /// Builds a client from the crawl options
    pub fn new(options: &CrawlOptions) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .user_agent(options.user_agent.clone())
            .redirect(Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(options.timeout_seconds));

        if !options.compress {
            builder = builder.no_gzip().no_deflate().no_brotli();
        }

        Ok(Self {
            client: builder.build()?,
            timeout: Duration::from_secs(options.timeout_seconds),
            max_bytes: options.max_response_bytes,
            accept_types: options.accept_content_types.clone(),
            reject_types: options.reject_content_types.clone(),
        })
    }

    /// Same client with a different per-request ceiling, for discovery fetches
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut clone = self.clone();
        clone.timeout = timeout;
        clone
    }

    /// Fetches a URL, following redirects, and classifies any failure
    pub async fn fetch(&self, url: &Url, conditional: &Conditional) -> FetchOutcome {
        let started = Instant::now();
        let mut current = url.clone();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(current.to_string());

        for _hop in 0..=MAX_REDIRECTS {
            let mut request = self
                .client
                .get(current.clone())
                .timeout(self.timeout);
            if let Some(etag) = &conditional.if_none_match {
                request = request.header(header::IF_NONE_MATCH, etag);
            }
            if let Some(since) = &conditional.if_modified_since {
                request = request.header(header::IF_MODIFIED_SINCE, since);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let error_type = classify_transport(&e);
                    return FetchOutcome::failure(&current, started, error_type, e.to_string());
                }
            };

            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok());
                let Some(location) = location else {
                    return FetchOutcome::failure(
                        &current,
                        started,
                        ErrorType::RedirectLoop,
                        format!("redirect {} without Location header", status.as_u16()),
                    );
                };
                let next = match current.join(location) {
                    Ok(next) => next,
                    Err(e) => {
                        return FetchOutcome::failure(
                            &current,
                            started,
                            ErrorType::RedirectLoop,
                            format!("unresolvable redirect target {location}: {e}"),
                        );
                    }
                };
                if current.scheme() == "https" && next.scheme() == "http" {
                    return FetchOutcome::failure(
                        &current,
                        started,
                        ErrorType::RedirectLoop,
                        format!("refusing https -> http downgrade to {next}"),
                    );
                }
                if !visited.insert(next.to_string()) {
                    return FetchOutcome::failure(
                        &current,
                        started,
                        ErrorType::RedirectLoop,
                        format!("redirect loop at {next}"),
                    );
                }
                tracing::debug!("following redirect {} -> {}", current, next);
                current = next;
                continue;
            }

            return self.finish_response(current, response, started).await;
        }

        FetchOutcome::failure(
            &current,
            started,
            ErrorType::RedirectLoop,
            format!("more than {MAX_REDIRECTS} redirects"),
        )
    }

    /// Reads headers, gates on type and size, then streams the body
    async fn finish_response(
        &self,
        final_url: Url,
        response: reqwest::Response,
        started: Instant,
    ) -> FetchOutcome {
        let status = response.status().as_u16();
        let headers = response.headers();

        let content_type = header_string(headers, header::CONTENT_TYPE);
        let etag = header_string(headers, header::ETAG);
        let last_modified = header_string(headers, header::LAST_MODIFIED);
        let retry_after = headers
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        let mut outcome = FetchOutcome {
            status,
            final_url,
            body: None,
            content_type: content_type.clone(),
            etag,
            last_modified,
            retry_after,
            elapsed_ms: 0,
            error: None,
            error_type: None,
        };

        if let Some(error_type) = classify_status(status, retry_after.is_some()) {
            outcome.elapsed_ms = started.elapsed().as_millis() as i64;
            outcome.error = Some(format!("HTTP {status}"));
            outcome.error_type = Some(error_type);
            return outcome;
        }

        if status == 304 {
            outcome.elapsed_ms = started.elapsed().as_millis() as i64;
            return outcome;
        }

        // Content-type gate, before any body bytes are read
        if let Some(ctype) = &content_type {
            if !self.accept_types.is_empty()
                && !self
                    .accept_types
                    .iter()
                    .any(|p| content_type_matches(p, ctype))
            {
                outcome.elapsed_ms = started.elapsed().as_millis() as i64;
                outcome.error = Some(format!("content type {ctype} not accepted"));
                outcome.error_type = Some(ErrorType::ContentTypeRejected);
                return outcome;
            }
            if self
                .reject_types
                .iter()
                .any(|p| content_type_matches(p, ctype))
            {
                outcome.elapsed_ms = started.elapsed().as_millis() as i64;
                outcome.error = Some(format!("content type {ctype} rejected"));
                outcome.error_type = Some(ErrorType::ContentTypeRejected);
                return outcome;
            }
        }

        // Declared-length gate; the stream below re-checks the actual length
        if let Some(declared) = response.content_length() {
            if declared > self.max_bytes as u64 {
                outcome.elapsed_ms = started.elapsed().as_millis() as i64;
                outcome.error = Some(format!(
                    "declared length {declared} exceeds cap {}",
                    self.max_bytes
                ));
                outcome.error_type = Some(ErrorType::ContentTooLarge);
                return outcome;
            }
        }

        let mut buffer: Vec<u8> = Vec::new();
        let mut response = response;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if buffer.len() + chunk.len() > self.max_bytes {
                        outcome.elapsed_ms = started.elapsed().as_millis() as i64;
                        outcome.error =
                            Some(format!("body exceeds cap of {} bytes", self.max_bytes));
                        outcome.error_type = Some(ErrorType::ContentTooLarge);
                        return outcome;
                    }
                    buffer.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => {
                    outcome.elapsed_ms = started.elapsed().as_millis() as i64;
                    outcome.error = Some(e.to_string());
                    outcome.error_type = Some(classify_transport(&e));
                    return outcome;
                }
            }
        }

        outcome.body = Some(String::from_utf8_lossy(&buffer).into_owned());
        outcome.elapsed_ms = started.elapsed().as_millis() as i64;
        outcome
    }
}

fn header_string(headers: &header::HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Parses a Retry-After header: delta-seconds or an HTTP-date
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&Utc) - Utc::now();
    let seconds = delta.num_seconds().max(0) as u64;
    Some(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlOptions;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_options() -> CrawlOptions {
        CrawlOptions::new("TrawlTest/1.0")
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(" 10 "), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let future = (Utc::now() + chrono::Duration::seconds(30)).to_rfc2822();
        let parsed = parse_retry_after(&future).unwrap();
        assert!(parsed <= Duration::from_secs(30));
        assert!(parsed >= Duration::from_secs(25));
    }

    #[test]
    fn test_parse_retry_after_past_date_clamps_to_zero() {
        let past = (Utc::now() - chrono::Duration::seconds(30)).to_rfc2822();
        assert_eq!(parse_retry_after(&past), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_garbage() {
        assert_eq!(parse_retry_after("soonish"), None);
    }

    #[tokio::test]
    async fn test_fetch_success_surfaces_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html>hello</html>")
                    .insert_header("content-type", "text/html")
                    .insert_header("etag", "\"abc123\"")
                    .insert_header("last-modified", "Wed, 01 Jan 2025 00:00:00 GMT"),
            )
            .mount(&server)
            .await;

        let client = FetchClient::new(&test_options()).unwrap();
        let url = Url::parse(&format!("{}/page", server.uri())).unwrap();
        let outcome = client.fetch(&url, &Conditional::default()).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.body.as_deref(), Some("<html>hello</html>"));
        assert_eq!(outcome.etag.as_deref(), Some("\"abc123\""));
        assert_eq!(
            outcome.last_modified.as_deref(),
            Some("Wed, 01 Jan 2025 00:00:00 GMT")
        );
    }

    #[tokio::test]
    async fn test_fetch_follows_redirect_to_final_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("location", "/new"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
            .mount(&server)
            .await;

        let client = FetchClient::new(&test_options()).unwrap();
        let url = Url::parse(&format!("{}/old", server.uri())).unwrap();
        let outcome = client.fetch(&url, &Conditional::default()).await;

        assert!(outcome.is_success());
        assert!(outcome.final_url.path().ends_with("/new"));
    }

    #[tokio::test]
    async fn test_fetch_redirect_loop_detected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/b"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/a"))
            .mount(&server)
            .await;

        let client = FetchClient::new(&test_options()).unwrap();
        let url = Url::parse(&format!("{}/a", server.uri())).unwrap();
        let outcome = client.fetch(&url, &Conditional::default()).await;

        assert_eq!(outcome.error_type, Some(ErrorType::RedirectLoop));
    }

    #[tokio::test]
    async fn test_fetch_rate_limited_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;

        let client = FetchClient::new(&test_options()).unwrap();
        let url = Url::parse(&format!("{}/busy", server.uri())).unwrap();
        let outcome = client.fetch(&url, &Conditional::default()).await;

        assert_eq!(outcome.error_type, Some(ErrorType::HttpRateLimited));
        assert_eq!(outcome.retry_after, Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_body_at_cap_succeeds_over_cap_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/exact"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 64]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/over"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 65]))
            .mount(&server)
            .await;

        let mut options = test_options();
        options.max_response_bytes = 64;
        let client = FetchClient::new(&options).unwrap();

        let url = Url::parse(&format!("{}/exact", server.uri())).unwrap();
        let outcome = client.fetch(&url, &Conditional::default()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.body.as_ref().unwrap().len(), 64);

        let url = Url::parse(&format!("{}/over", server.uri())).unwrap();
        let outcome = client.fetch(&url, &Conditional::default()).await;
        assert_eq!(outcome.error_type, Some(ErrorType::ContentTooLarge));
        assert!(outcome.body.is_none());
    }

    #[tokio::test]
    async fn test_content_type_accept_gate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("%PDF")
                    .insert_header("content-type", "application/pdf"),
            )
            .mount(&server)
            .await;

        let mut options = test_options();
        options.accept_content_types = vec!["text/html".to_string(), "text/*".to_string()];
        let client = FetchClient::new(&options).unwrap();

        let url = Url::parse(&format!("{}/pdf", server.uri())).unwrap();
        let outcome = client.fetch(&url, &Conditional::default()).await;
        assert_eq!(outcome.error_type, Some(ErrorType::ContentTypeRejected));
        assert!(outcome.body.is_none());
    }

    #[tokio::test]
    async fn test_conditional_headers_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .and(header("if-none-match", "\"abc\""))
            .and(header("if-modified-since", "Wed, 01 Jan 2025 00:00:00 GMT"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let client = FetchClient::new(&test_options()).unwrap();
        let url = Url::parse(&format!("{}/page", server.uri())).unwrap();
        let conditional = Conditional {
            if_none_match: Some("\"abc\"".to_string()),
            if_modified_since: Some("Wed, 01 Jan 2025 00:00:00 GMT".to_string()),
        };
        let outcome = client.fetch(&url, &conditional).await;

        assert!(outcome.is_not_modified());
        assert!(outcome.error_type.is_none());
    }

    #[tokio::test]
    async fn test_connection_refused_classified() {
        // Port 1 is essentially never listening
        let client = FetchClient::new(&test_options()).unwrap();
        let url = Url::parse("http://127.0.0.1:1/x").unwrap();
        let outcome = client.fetch(&url, &Conditional::default()).await;

        assert!(matches!(
            outcome.error_type,
            Some(ErrorType::NetworkConnectionRefused) | Some(ErrorType::NetworkTimeout)
        ));
        assert_eq!(outcome.status, 0);
    }
}
