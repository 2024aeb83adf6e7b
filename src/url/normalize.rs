use crate::UrlError;
use url::Url;

/// Normalizes a raw URL string into an absolute, crawlable URL
///
/// Normalization steps:
///
/// 1. Parse the string, resolving it against `base` when it is relative
/// 2. Require an `http` or `https` scheme and a host
/// 3. Lowercase the host (the `url` crate does this on parse)
/// 4. Strip the default port (`:80` for http, `:443` for https)
/// 5. Remove the `#fragment`
/// 6. Empty path becomes `/`
///
/// Query parameters are preserved byte-for-byte and in order. The crawler is
/// deliberately neutral about tracking parameters: two URLs that differ only
/// in a `utm_*` value are two different URLs.
///
/// # Errors
///
/// Returns [`UrlError`] when the input cannot be turned into an absolute
/// http(s) URL with a host, even after resolving against `base`.
///
/// # Examples
///
/// ```
/// use trawl::url::normalize_url;
///
/// let url = normalize_url("HTTP://Example.COM:80/a#frag", None).unwrap();
/// assert_eq!(url.as_str(), "http://example.com/a");
/// ```
pub fn normalize_url(raw: &str, base: Option<&Url>) -> Result<Url, UrlError> {
    let mut url = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => match base {
            Some(base) => base
                .join(raw)
                .map_err(|e| UrlError::Parse(e.to_string()))?,
            None => return Err(UrlError::Parse(format!("relative URL without base: {raw}"))),
        },
        Err(e) => return Err(UrlError::Parse(e.to_string())),
    };

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(url.scheme().to_string()));
    }

    if url.host_str().is_none() {
        return Err(UrlError::MissingHost);
    }

    // An explicit default port survives parsing, so strip it here.
    if url.port() == Some(default_port(url.scheme())) {
        url.set_port(None).map_err(|_| UrlError::MissingHost)?;
    }

    url.set_fragment(None);

    if url.path().is_empty() {
        url.set_path("/");
    }

    Ok(url)
}

/// The lowercase host of a URL, without the port
pub fn host_of(url: &Url) -> Result<String, UrlError> {
    url.host_str()
        .map(|h| h.to_lowercase())
        .ok_or(UrlError::MissingHost)
}

/// Path plus query string, the part of the URL robots rules match against
pub fn path_with_query(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "https" => 443,
        _ => 80,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowercase_host() {
        let url = normalize_url("https://EXAMPLE.COM/Page", None).unwrap();
        assert_eq!(url.as_str(), "https://example.com/Page");
    }

    #[test]
    fn test_strip_default_port() {
        let url = normalize_url("http://example.com:80/a", None).unwrap();
        assert_eq!(url.as_str(), "http://example.com/a");

        let url = normalize_url("https://example.com:443/a", None).unwrap();
        assert_eq!(url.as_str(), "https://example.com/a");
    }

    #[test]
    fn test_keep_explicit_port() {
        let url = normalize_url("https://example.com:8443/a", None).unwrap();
        assert_eq!(url.as_str(), "https://example.com:8443/a");
    }

    #[test]
    fn test_remove_fragment() {
        let url = normalize_url("https://example.com/page#section", None).unwrap();
        assert_eq!(url.as_str(), "https://example.com/page");
    }

    #[test]
    fn test_empty_path_becomes_root() {
        let url = normalize_url("https://example.com", None).unwrap();
        assert_eq!(url.as_str(), "https://example.com/");
    }

    #[test]
    fn test_query_order_preserved() {
        let url = normalize_url("https://example.com/p?b=2&a=1", None).unwrap();
        assert_eq!(url.as_str(), "https://example.com/p?b=2&a=1");
    }

    #[test]
    fn test_tracking_params_preserved() {
        let url = normalize_url("https://example.com/p?utm_source=x&id=7", None).unwrap();
        assert_eq!(url.as_str(), "https://example.com/p?utm_source=x&id=7");
    }

    #[test]
    fn test_resolve_against_base() {
        let base = Url::parse("https://example.com/dir/page").unwrap();
        let url = normalize_url("../other", Some(&base)).unwrap();
        assert_eq!(url.as_str(), "https://example.com/other");
    }

    #[test]
    fn test_relative_without_base_fails() {
        let result = normalize_url("/just/a/path", None);
        assert!(matches!(result, Err(UrlError::Parse(_))));
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        let result = normalize_url("ftp://example.com/file", None);
        assert!(matches!(result, Err(UrlError::InvalidScheme(_))));
    }

    #[test]
    fn test_host_of_strips_port() {
        let url = Url::parse("https://Example.com:8443/a").unwrap();
        assert_eq!(host_of(&url).unwrap(), "example.com");
    }

    #[test]
    fn test_path_with_query() {
        let url = Url::parse("https://example.com/a?b=1").unwrap();
        assert_eq!(path_with_query(&url), "/a?b=1");

        let url = Url::parse("https://example.com/a").unwrap();
        assert_eq!(path_with_query(&url), "/a");
    }
}
