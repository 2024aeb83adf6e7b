//! Sitemap XML parsing
//!
//! Recognizes the two sitemap.org document shapes: a `<urlset>` of
//! `<url><loc/><lastmod/></url>` entries, and a `<sitemapindex>` whose
//! `<sitemap><loc/></sitemap>` entries point at further sitemaps.

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

/// One `<url>` entry from a urlset
#[derive(Debug, Clone, PartialEq)]
pub struct SitemapUrl {
    pub loc: String,
    pub lastmod: Option<String>,
}

/// A parsed sitemap document
#[derive(Debug, Clone, PartialEq)]
pub enum SitemapDocument {
    /// `<sitemapindex>`: locations of child sitemaps
    Index(Vec<String>),
    /// `<urlset>`: content URLs with optional lastmod
    UrlSet(Vec<SitemapUrl>),
}

#[derive(Debug, Error)]
#[error("sitemap parse error: {0}")]
pub struct SitemapParseError(pub String);

/// Parses a sitemap body into either an index or a urlset
pub fn parse_sitemap(content: &str) -> Result<SitemapDocument, SitemapParseError> {
    let mut reader = Reader::from_str(content);

    let mut is_index: Option<bool> = None;
    let mut in_entry = false;
    let mut in_loc = false;
    let mut in_lastmod = false;

    let mut index_entries: Vec<String> = Vec::new();
    let mut url_entries: Vec<SitemapUrl> = Vec::new();
    let mut pending_loc: Option<String> = None;
    let mut pending_lastmod: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"sitemapindex" => is_index = is_index.or(Some(true)),
                b"urlset" => is_index = is_index.or(Some(false)),
                b"sitemap" | b"url" => {
                    in_entry = true;
                    pending_loc = None;
                    pending_lastmod = None;
                }
                b"loc" => in_loc = true,
                b"lastmod" => in_lastmod = true,
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"sitemap" => {
                    in_entry = false;
                    if let Some(loc) = pending_loc.take() {
                        index_entries.push(loc);
                    }
                }
                b"url" => {
                    in_entry = false;
                    if let Some(loc) = pending_loc.take() {
                        url_entries.push(SitemapUrl {
                            loc,
                            lastmod: pending_lastmod.take(),
                        });
                    }
                }
                b"loc" => in_loc = false,
                b"lastmod" => in_lastmod = false,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if !in_entry {
                    continue;
                }
                let text = match e.unescape() {
                    Ok(text) => text.trim().to_string(),
                    Err(_) => continue,
                };
                if text.is_empty() {
                    continue;
                }
                if in_loc {
                    pending_loc = Some(text);
                } else if in_lastmod {
                    pending_lastmod = Some(text);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SitemapParseError(e.to_string())),
            _ => {}
        }
    }

    match is_index {
        Some(true) => Ok(SitemapDocument::Index(index_entries)),
        Some(false) => Ok(SitemapDocument::UrlSet(url_entries)),
        None => Err(SitemapParseError(
            "document is neither a urlset nor a sitemap index".to_string(),
        )),
    }
}
