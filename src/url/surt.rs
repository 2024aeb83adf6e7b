//! SURT keys: Sort-friendly URL Reordering Transform
//!
//! A SURT key groups URLs by host in reverse-label order, which makes rows
//! for one site (and its subdomains) sort together. The format matches the
//! Common Crawl convention: host labels reversed and comma-joined, an
//! optional `:port` for non-default ports, a `)` separator, then the path
//! and query exactly as they appear in the URL.

use crate::url::{host_of, path_with_query};
use crate::UrlError;
use url::Url;

/// Computes the SURT key for a normalized URL
///
/// ```
/// use trawl::url::surt_key;
/// use url::Url;
///
/// let url = Url::parse("https://www.example.co.uk/a?b=1").unwrap();
/// assert_eq!(surt_key(&url).unwrap(), "uk,co,example,www)/a?b=1");
/// ```
pub fn surt_key(url: &Url) -> Result<String, UrlError> {
    let host = host_of(url)?;

    let mut labels: Vec<&str> = host.split('.').collect();
    labels.reverse();
    let mut key = labels.join(",");

    if let Some(port) = url.port() {
        key.push(':');
        key.push_str(&port.to_string());
    }

    key.push(')');
    key.push_str(&path_with_query(url));
    Ok(key)
}

/// Reconstructs a URL from a SURT key
///
/// The scheme is not part of the key, so `https` is assumed. This exists so
/// keys can be audited and round-tripped; the crawler itself always carries
/// the original URL alongside the key.
pub fn surt_to_url(key: &str) -> Result<Url, UrlError> {
    let sep = key
        .find(')')
        .ok_or_else(|| UrlError::Parse(format!("not a SURT key: {key}")))?;
    let (host_part, path) = key.split_at(sep);
    let path = &path[1..];

    let (host_labels, port) = match host_part.rsplit_once(':') {
        Some((labels, port)) => (labels, Some(port)),
        None => (host_part, None),
    };

    let mut labels: Vec<&str> = host_labels.split(',').collect();
    labels.reverse();
    let host = labels.join(".");

    let raw = match port {
        Some(port) => format!("https://{host}:{port}{path}"),
        None => format!("https://{host}{path}"),
    };
    Url::parse(&raw).map_err(|e| UrlError::Parse(e.to_string()))
}
