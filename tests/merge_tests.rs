//! Merge-verb tests: crawl a table, then merge a changed source into it

use chrono::{Duration, Utc};
use trawl::storage::ResultRow;
use trawl::{
    crawl_into, merge_into, Coordinator, CrawlOptions, CrawlSource, CrawlStore, MergeOptions,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_options() -> CrawlOptions {
    let mut options = CrawlOptions::new("TrawlTest/1.0 (+https://example.org/bot)");
    options.default_crawl_delay = 0.0;
    options.min_crawl_delay = 0.0;
    options.max_total_connections = 4;
    options
}

fn source_row(url: &str) -> ResultRow {
    ResultRow {
        url: url.to_string(),
        surt_key: String::new(),
        domain: "example.com".to_string(),
        http_status: 200,
        body: Some("<html>from source</html>".to_string()),
        content_type: Some("text/html".to_string()),
        elapsed_ms: 1,
        crawled_at: Utc::now(),
        error: None,
        error_type: None,
        etag: None,
        last_modified: None,
        content_hash: Some("sourcehash".to_string()),
    }
}

#[tokio::test]
async fn test_merge_after_crawl_tombstones_vanished_rows() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    for p in ["/u1", "/u2", "/u3"] {
        Mock::given(method("GET"))
            .and(path(p))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!("<html>{p}</html>"))
                    .insert_header("content-type", "text/html"),
            )
            .mount(&server)
            .await;
    }

    let store = CrawlStore::open_in_memory().unwrap();
    let urls: Vec<String> = ["/u1", "/u2", "/u3"]
        .iter()
        .map(|p| format!("{}{p}", server.uri()))
        .collect();
    let report = crawl_into(&store, "pages", CrawlSource::Urls(urls.clone()), fast_options())
        .await
        .unwrap();
    assert_eq!(report.succeeded, 3);

    // Source now has a changed u1 and a brand-new u4; u2 and u3 vanished
    let source = vec![source_row(&urls[0]), source_row("https://example.com/u4")];
    let merge_report = merge_into(
        &store,
        "pages",
        &source,
        &MergeOptions {
            update_if_older_than: None,
        },
    )
    .unwrap();

    assert_eq!(merge_report.updated, 1);
    assert_eq!(merge_report.inserted, 1);
    assert_eq!(merge_report.tombstoned, 2);

    let rows: Vec<(String, i64)> = store
        .with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT url, is_deleted FROM pages ORDER BY url")?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .unwrap();
    assert_eq!(rows.len(), 4);
    let tombstoned: Vec<&str> = rows
        .iter()
        .filter(|(_, deleted)| *deleted == 1)
        .map(|(url, _)| url.as_str())
        .collect();
    assert_eq!(tombstoned.len(), 2);
    assert!(tombstoned.iter().all(|u| u.ends_with("/u2") || u.ends_with("/u3")));

    // The updated row carries the source body
    let body: String = store
        .with_connection(|conn| {
            conn.query_row(
                "SELECT body FROM pages WHERE url = ?1",
                [&urls[0]],
                |r| r.get(0),
            )
        })
        .unwrap();
    assert_eq!(body, "<html>from source</html>");
}

#[tokio::test]
async fn test_fresh_rows_survive_merge_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<html>crawled</html>")
                .insert_header("content-type", "text/html"),
        )
        .mount(&server)
        .await;

    let store = CrawlStore::open_in_memory().unwrap();
    let url = format!("{}/page", server.uri());
    crawl_into(
        &store,
        "pages",
        CrawlSource::Urls(vec![url.clone()]),
        fast_options(),
    )
    .await
    .unwrap();

    // Default predicate: only rows older than 24h update; this one is fresh
    let report = merge_into(&store, "pages", &[source_row(&url)], &MergeOptions::default())
        .unwrap();
    assert_eq!(report.updated, 0);
    assert_eq!(report.tombstoned, 0);

    let body: String = store
        .with_connection(|conn| {
            conn.query_row("SELECT body FROM pages WHERE url = ?1", [&url], |r| r.get(0))
        })
        .unwrap();
    assert_eq!(body, "<html>crawled</html>");
}

#[test]
fn test_stale_predicate_controls_update() {
    let store = CrawlStore::open_in_memory().unwrap();
    store.create_crawl_tables("pages").unwrap();

    let mut old_row = source_row("https://example.com/old");
    old_row.crawled_at = Utc::now() - Duration::hours(48);
    old_row.body = Some("<html>old</html>".to_string());
    merge_into(
        &store,
        "pages",
        &[old_row],
        &MergeOptions {
            update_if_older_than: None,
        },
    )
    .unwrap();

    let mut update = source_row("https://example.com/old");
    update.body = Some("<html>new</html>".to_string());
    let report = merge_into(&store, "pages", &[update], &MergeOptions::default()).unwrap();
    assert_eq!(report.updated, 1);

    let body: String = store
        .with_connection(|conn| {
            conn.query_row(
                "SELECT body FROM pages WHERE url = 'https://example.com/old'",
                [],
                |r| r.get(0),
            )
        })
        .unwrap();
    assert_eq!(body, "<html>new</html>");
}

#[test]
fn test_bind_time_identifier_rejection() {
    let store = CrawlStore::open_in_memory().unwrap();

    // Coordinator bind phase
    let result = Coordinator::new(store.clone(), "pages; DROP TABLE x", fast_options());
    assert!(result.is_err());

    // Merge bind phase
    let result = merge_into(&store, "2bad", &[], &MergeOptions::default());
    assert!(result.is_err());

    // Nothing was created
    let tables: i64 = store
        .with_connection(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' \
                 AND name NOT LIKE '\\_%' ESCAPE '\\' AND name NOT LIKE 'sqlite%'",
                [],
                |r| r.get(0),
            )
        })
        .unwrap();
    assert_eq!(tables, 0);
}

#[test]
fn test_missing_user_agent_is_bind_error() {
    let result = CrawlOptions::from_with_pairs([(
        "timeout_seconds",
        trawl::OptionValue::from(5i64),
    )]);
    assert!(result.is_err());
}
