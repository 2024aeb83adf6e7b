//! Sitemap discovery for a host
//!
//! Walks the host's sitemap graph (the `Sitemap:` entries from robots.txt
//! plus the conventional `/sitemap.xml`), recursing through sitemap indices
//! to a bounded depth. Discovered lists are cached per sitemap URL so re-runs
//! within the cache TTL skip the network entirely. A failing or malformed
//! child sitemap drops that subtree with a warning; it never fails the crawl.

use crate::config::CrawlOptions;
use crate::fetch::{Conditional, FetchClient};
use crate::robots::RobotsPolicy;
use crate::sitemap::parser::{parse_sitemap, SitemapDocument};
use crate::storage::{CachedSitemapUrl, CrawlStore};
use crate::url::{matches_like, normalize_url};
use crate::UrlError;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

/// Sitemap-index recursion cap
const MAX_SITEMAP_DEPTH: usize = 5;

/// A candidate URL emitted by discovery, after filtering
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredUrl {
    pub url: Url,
    pub lastmod: Option<DateTime<Utc>>,
}

/// Splits a site designator into `(scheme, authority)`
///
/// Accepts a bare host (`shop.example`), a host with port, or a full URL;
/// bare hosts default to https.
pub fn site_root(site: &str) -> Result<(String, String), UrlError> {
    let raw = if site.contains("://") {
        site.to_string()
    } else {
        format!("https://{site}")
    };
    let url = Url::parse(&raw).map_err(|e| UrlError::Parse(e.to_string()))?;
    let host = url.host_str().ok_or(UrlError::MissingHost)?.to_lowercase();
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    };
    Ok((url.scheme().to_string(), authority))
}

/// Discovers candidate URLs for one host
///
/// `url_filter` is the verb's `url LIKE` pattern, applied before URLs are
/// returned (pushdown); the cache always stores the unfiltered list. Sitemaps
/// of this host are fetched strictly in sequence, with the host's crawl
/// delay between fetches.
pub async fn discover_site(
    client: &FetchClient,
    store: &CrawlStore,
    scheme: &str,
    authority: &str,
    robots: &RobotsPolicy,
    options: &CrawlOptions,
    url_filter: Option<&str>,
) -> Vec<DiscoveredUrl> {
    let mut roots: Vec<String> = robots.sitemaps();
    roots.push(format!("{scheme}://{authority}/sitemap.xml"));

    let delay = robots
        .crawl_delay(&options.user_agent)
        .unwrap_or(options.default_crawl_delay)
        .clamp(options.min_crawl_delay, options.max_crawl_delay);

    let mut visited: HashSet<String> = HashSet::new();
    let mut stack: Vec<(String, usize)> = roots.into_iter().rev().map(|u| (u, 0)).collect();
    let mut emitted: Vec<CachedSitemapUrl> = Vec::new();
    let mut fetched_any = false;

    while let Some((sitemap_url, depth)) = stack.pop() {
        if !visited.insert(sitemap_url.clone()) {
            continue;
        }
        if depth > MAX_SITEMAP_DEPTH {
            tracing::warn!(
                "sitemap recursion deeper than {} at {}, skipping subtree",
                MAX_SITEMAP_DEPTH,
                sitemap_url
            );
            continue;
        }

        match store.sitemap_cache_get(&sitemap_url, options.sitemap_cache_hours) {
            Ok(Some(cached)) => {
                tracing::debug!("sitemap cache hit for {}", sitemap_url);
                emitted.extend(cached);
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("sitemap cache lookup failed for {}: {}", sitemap_url, e);
            }
        }

        let Ok(target) = Url::parse(&sitemap_url) else {
            tracing::warn!("unparseable sitemap URL {}", sitemap_url);
            continue;
        };

        // Serialize this host's sitemap fetches at its crawl delay
        if fetched_any && delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
        let outcome = client.fetch(&target, &Conditional::default()).await;
        fetched_any = true;

        if !outcome.is_success() {
            tracing::warn!(
                "sitemap fetch failed for {} (status {}): {}",
                sitemap_url,
                outcome.status,
                outcome.error.as_deref().unwrap_or("no body")
            );
            continue;
        }
        let Some(body) = outcome.body else {
            continue;
        };

        match parse_sitemap(&body) {
            Ok(SitemapDocument::Index(children)) => {
                tracing::debug!("{} is an index of {} sitemaps", sitemap_url, children.len());
                for child in children.into_iter().rev() {
                    stack.push((child, depth + 1));
                }
            }
            Ok(SitemapDocument::UrlSet(urls)) => {
                tracing::debug!("{} lists {} URLs", sitemap_url, urls.len());
                let entries: Vec<CachedSitemapUrl> = urls
                    .into_iter()
                    .map(|u| CachedSitemapUrl {
                        loc: u.loc,
                        lastmod: u.lastmod,
                    })
                    .collect();
                if let Err(e) = store.sitemap_cache_put(authority, &sitemap_url, &entries) {
                    tracing::warn!("failed to cache sitemap {}: {}", sitemap_url, e);
                }
                emitted.extend(entries);
            }
            Err(e) => {
                // sitemap_parse_error: drop this subtree, keep discovering
                tracing::warn!("{} for {}", e, sitemap_url);
            }
        }
    }

    if let Err(e) = store.record_discovery(authority, emitted.len() as u64) {
        tracing::warn!("failed to record discovery status for {}: {}", authority, e);
    }

    emitted
        .into_iter()
        .filter_map(|entry| {
            let url = match normalize_url(&entry.loc, None) {
                Ok(url) => url,
                Err(e) => {
                    tracing::debug!("dropping sitemap entry {}: {}", entry.loc, e);
                    return None;
                }
            };
            if let Some(pattern) = url_filter {
                if !matches_like(pattern, url.as_str()) {
                    return None;
                }
            }
            Some(DiscoveredUrl {
                url,
                lastmod: entry.lastmod.as_deref().and_then(parse_lastmod),
            })
        })
        .collect()
}

/// Parses a sitemap `<lastmod>` value: W3C datetime or bare date
pub fn parse_lastmod(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Some(at.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    Some(DateTime::from_naive_utc_and_offset(
        date.and_hms_opt(0, 0, 0)?,
        Utc,
    ))
}
