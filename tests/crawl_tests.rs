//! End-to-end crawl tests against wiremock servers
//!
//! These drive the full engine (queue, scheduler, robots gate, fetch
//! pipeline, batching, persistence) and assert on what lands in the store.

use chrono::{DateTime, Utc};
use std::time::Duration;
use trawl::{
    crawl_into, crawl_sites_into, Coordinator, CrawlOptions, CrawlSource, CrawlStore, RunStatus,
    SiteSource,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_options() -> CrawlOptions {
    let mut options = CrawlOptions::new("TrawlTest/1.0 (+https://example.org/bot)");
    options.default_crawl_delay = 0.0;
    options.min_crawl_delay = 0.0;
    options.max_total_connections = 4;
    options
}

async fn mount_robots(server: &MockServer, template: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(template)
        .mount(server)
        .await;
}

async fn mount_page(server: &MockServer, at: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body.to_string())
                .insert_header("content-type", "text/html"),
        )
        .mount(server)
        .await;
}

fn fetch_rows(store: &CrawlStore, target: &str) -> Vec<(String, i32, Option<String>)> {
    store
        .with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT url, http_status, content_hash FROM \"{target}\" ORDER BY url"
            ))?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .unwrap()
}

#[tokio::test]
async fn test_allow_all_two_url_crawl_is_paced() {
    let server = MockServer::start().await;
    mount_robots(&server, ResponseTemplate::new(404)).await;
    mount_page(&server, "/a", "<html>a</html>").await;
    mount_page(&server, "/b", "<html>b</html>").await;

    let store = CrawlStore::open_in_memory().unwrap();
    let mut options = fast_options();
    options.default_crawl_delay = 0.2;

    let report = crawl_into(
        &store,
        "pages",
        CrawlSource::Urls(vec![
            format!("{}/a", server.uri()),
            format!("{}/b", server.uri()),
        ]),
        options,
    )
    .await
    .unwrap();

    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(report.status, RunStatus::Done);

    let rows = fetch_rows(&store, "pages");
    assert_eq!(rows.len(), 2);
    for (_, status, hash) in &rows {
        assert_eq!(*status, 200);
        assert!(hash.is_some(), "content_hash should be set");
    }

    // Per-host pacing: the second fetch completed at least ~the crawl delay
    // after the first.
    let stamps: Vec<DateTime<Utc>> = store
        .with_connection(|conn| {
            let mut stmt =
                conn.prepare("SELECT crawled_at FROM pages ORDER BY crawled_at")?;
            let rows = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .unwrap()
        .into_iter()
        .map(|s| s.parse().unwrap())
        .collect();
    let gap = stamps[1] - stamps[0];
    assert!(
        gap >= chrono::Duration::milliseconds(150),
        "expected >= 150ms between fetches, got {gap}"
    );
}

#[tokio::test]
async fn test_robots_disallow_writes_synthetic_row() {
    let server = MockServer::start().await;
    mount_robots(
        &server,
        ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private/"),
    )
    .await;
    // The disallowed page must never be fetched
    Mock::given(method("GET"))
        .and(path("/private/secret"))
        .respond_with(ResponseTemplate::new(200).set_body_string("secret"))
        .expect(0)
        .mount(&server)
        .await;

    let store = CrawlStore::open_in_memory().unwrap();
    let report = crawl_into(
        &store,
        "pages",
        CrawlSource::Urls(vec![format!("{}/private/secret", server.uri())]),
        fast_options(),
    )
    .await
    .unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(report.succeeded, 0);

    let (status, error_type, body): (i32, String, Option<String>) = store
        .with_connection(|conn| {
            conn.query_row(
                "SELECT http_status, error_type, body FROM pages",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
        })
        .unwrap();
    assert_eq!(status, -1);
    assert_eq!(error_type, "robots_disallowed");
    assert_eq!(body, None);
}

#[tokio::test]
async fn test_rate_limited_retry_honors_retry_after() {
    let server = MockServer::start().await;
    mount_robots(&server, ResponseTemplate::new(404)).await;

    // First attempt is rate limited, then the page succeeds
    Mock::given(method("GET"))
        .and(path("/busy"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_page(&server, "/busy", "<html>finally</html>").await;

    let store = CrawlStore::open_in_memory().unwrap();
    let started = std::time::Instant::now();
    let report = crawl_into(
        &store,
        "pages",
        CrawlSource::Urls(vec![format!("{}/busy", server.uri())]),
        fast_options(),
    )
    .await
    .unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);
    assert!(
        started.elapsed() >= Duration::from_millis(900),
        "retry should have waited for Retry-After"
    );

    let rows = fetch_rows(&store, "pages");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1, 200);
}

#[tokio::test]
async fn test_exhausted_retries_write_terminal_error_row() {
    let server = MockServer::start().await;
    mount_robots(&server, ResponseTemplate::new(404)).await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let store = CrawlStore::open_in_memory().unwrap();
    let mut options = fast_options();
    options.max_retry_backoff_seconds = 0;

    let report = crawl_into(
        &store,
        "pages",
        CrawlSource::Urls(vec![format!("{}/broken", server.uri())]),
        options,
    )
    .await
    .unwrap();

    assert_eq!(report.failed, 1);
    let (status, error_type): (i32, String) = store
        .with_connection(|conn| {
            conn.query_row("SELECT http_status, error_type FROM pages", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
        })
        .unwrap();
    assert_eq!(status, 500);
    assert_eq!(error_type, "http_server_error");
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    mount_robots(&server, ResponseTemplate::new(404)).await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let store = CrawlStore::open_in_memory().unwrap();
    let report = crawl_into(
        &store,
        "pages",
        CrawlSource::Urls(vec![format!("{}/gone", server.uri())]),
        fast_options(),
    )
    .await
    .unwrap();

    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn test_sitemap_discovery_with_like_pushdown() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_robots(&server, ResponseTemplate::new(404)).await;

    Mock::given(method("GET"))
        .and(path("/sitemap.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(format!(
                    "<urlset>\
                     <url><loc>{base}/product/42</loc></url>\
                     <url><loc>{base}/about</loc></url>\
                     <url><loc>{base}/contact</loc></url>\
                     </urlset>"
                ))
                .insert_header("content-type", "application/xml"),
        )
        .mount(&server)
        .await;
    mount_page(&server, "/product/42", "<html>product</html>").await;

    let store = CrawlStore::open_in_memory().unwrap();
    let coordinator = Coordinator::new(store.clone(), "shop_pages", fast_options())
        .unwrap()
        .with_url_filter("%/product/%");
    let report = coordinator
        .crawl_sites(SiteSource::Sites(vec![base.clone()]))
        .await
        .unwrap();

    // Only the filtered URL was crawled
    assert_eq!(report.total_discovered, 1);
    assert_eq!(report.succeeded, 1);
    let rows = fetch_rows(&store, "shop_pages");
    assert_eq!(rows.len(), 1);
    assert!(rows[0].0.ends_with("/product/42"));

    // The cache holds all three locs regardless of the filter
    let cached = store
        .sitemap_cache_get(&format!("{base}/sitemap.xml"), 24)
        .unwrap()
        .expect("sitemap should be cached");
    assert_eq!(cached.len(), 3);
}

#[tokio::test]
async fn test_sites_query_source() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_robots(&server, ResponseTemplate::new(404)).await;
    Mock::given(method("GET"))
        .and(path("/sitemap.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(format!("<urlset><url><loc>{base}/p</loc></url></urlset>")),
        )
        .mount(&server)
        .await;
    mount_page(&server, "/p", "<html>p</html>").await;

    let store = CrawlStore::open_in_memory().unwrap();
    store
        .with_connection(|conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE my_sites (site TEXT);
                 INSERT INTO my_sites VALUES ('{base}');"
            ))
        })
        .unwrap();

    let report = crawl_sites_into(
        &store,
        "pages",
        SiteSource::Query("SELECT site FROM my_sites".to_string()),
        fast_options(),
    )
    .await
    .unwrap();

    assert_eq!(report.succeeded, 1);
}

#[tokio::test]
async fn test_update_stale_skips_fresh_rows() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_robots(&server, ResponseTemplate::new(404)).await;
    // lastmod far in the past: anything already stored is fresher
    Mock::given(method("GET"))
        .and(path("/sitemap.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "<urlset><url><loc>{base}/page</loc><lastmod>2001-01-01</lastmod></url></urlset>"
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<html>page</html>")
                .insert_header("content-type", "text/html"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut options = fast_options();
    options.update_stale = true;
    options.sitemap_cache_hours = 0; // force a fresh sitemap walk per run

    let store = CrawlStore::open_in_memory().unwrap();
    let report = crawl_sites_into(
        &store,
        "pages",
        SiteSource::Sites(vec![base.clone()]),
        options.clone(),
    )
    .await
    .unwrap();
    assert_eq!(report.succeeded, 1);

    // Second run: the stored row postdates the lastmod, so nothing to do
    let report = crawl_sites_into(&store, "pages", SiteSource::Sites(vec![base]), options)
        .await
        .unwrap();
    assert_eq!(report.total_discovered, 0);
    assert_eq!(report.processed, 0);
}

#[tokio::test]
async fn test_conditional_recrawl_304_keeps_hash() {
    let server = MockServer::start().await;
    mount_robots(&server, ResponseTemplate::new(404)).await;

    // Conditional requests get a 304; mounted first so it matches before
    // the unconditional 200.
    Mock::given(method("GET"))
        .and(path("/page"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<html>stable</html>")
                .insert_header("etag", "\"v1\"")
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

    let first: (i32, Option<String>, String) = store
        .with_connection(|conn| {
            conn.query_row(
                "SELECT http_status, content_hash, crawled_at FROM pages",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
        })
        .unwrap();
    assert_eq!(first.0, 200);
    let first_hash = first.1.clone().expect("hash after 200");

    crawl_into(
        &store,
        "pages",
        CrawlSource::Urls(vec![url]),
        fast_options(),
    )
    .await
    .unwrap();

    let second: (i32, Option<String>, String, Option<String>) = store
        .with_connection(|conn| {
            conn.query_row(
                "SELECT http_status, content_hash, crawled_at, body FROM pages",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
        })
        .unwrap();
    // 304: hash and body unchanged, timestamp fresh
    assert_eq!(second.0, 304);
    assert_eq!(second.1.as_deref(), Some(first_hash.as_str()));
    assert_eq!(second.3.as_deref(), Some("<html>stable</html>"));
    assert!(second.2 > first.2, "crawled_at should advance");
}

#[tokio::test]
async fn test_drain_persists_queue_and_resume_finishes() {
    let server = MockServer::start().await;
    mount_robots(&server, ResponseTemplate::new(404)).await;
    for i in 0..6 {
        Mock::given(method("GET"))
            .and(path(format!("/slow/{i}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!("<html>{i}</html>"))
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&server)
            .await;
    }
    let urls: Vec<String> = (0..6).map(|i| format!("{}/slow/{i}", server.uri())).collect();

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("crawl.db");
    let store = CrawlStore::open(&db_path).unwrap();

    let mut options = fast_options();
    options.max_total_connections = 1;
    options.max_parallel_per_domain = 1;
    let coordinator = Coordinator::new(store.clone(), "pages", options).unwrap();
    let token = coordinator.cancellation_token();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        token.cancel();
    });
    let report = coordinator
        .crawl(CrawlSource::Urls(urls.clone()))
        .await
        .unwrap();
    canceller.await.unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    let terminal = fetch_rows(&store, "pages").len() as u64;
    let queued = store.queue_len("pages").unwrap();
    assert!(terminal < 6, "the drain should have stopped the crawl early");
    // Every URL is either terminal in the target or durable in the queue
    assert_eq!(terminal + queued, 6);
    assert!(queued > 0, "remaining entries should survive durably");

    // A fresh run resumes exactly the remaining entries
    let coordinator = Coordinator::new(store.clone(), "pages", fast_options()).unwrap();
    let report = coordinator.crawl(CrawlSource::Urls(vec![])).await.unwrap();
    assert_eq!(report.status, RunStatus::Done);
    assert_eq!(fetch_rows(&store, "pages").len(), 6);
    assert_eq!(store.queue_len("pages").unwrap(), 0);
}

#[tokio::test]
async fn test_invalid_url_writes_skip_row() {
    let store = CrawlStore::open_in_memory().unwrap();
    let report = crawl_into(
        &store,
        "pages",
        CrawlSource::Urls(vec!["not a url".to_string()]),
        fast_options(),
    )
    .await
    .unwrap();

    assert_eq!(report.skipped, 1);
    let error_type: String = store
        .with_connection(|conn| {
            conn.query_row("SELECT error_type FROM pages", [], |r| r.get(0))
        })
        .unwrap();
    assert_eq!(error_type, "invalid_url");
}

#[tokio::test]
async fn test_source_query_drains_url_column() {
    let server = MockServer::start().await;
    mount_robots(&server, ResponseTemplate::new(404)).await;
    mount_page(&server, "/x", "<html>x</html>").await;

    let store = CrawlStore::open_in_memory().unwrap();
    store
        .with_connection(|conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE seeds (url TEXT);
                 INSERT INTO seeds VALUES ('{}/x');",
                server.uri()
            ))
        })
        .unwrap();

    let report = crawl_into(
        &store,
        "pages",
        CrawlSource::Query("SELECT url FROM seeds".to_string()),
        fast_options(),
    )
    .await
    .unwrap();

    assert_eq!(report.succeeded, 1);
}

#[tokio::test]
async fn test_duplicate_source_urls_crawled_once() {
    let server = MockServer::start().await;
    mount_robots(&server, ResponseTemplate::new(404)).await;
    Mock::given(method("GET"))
        .and(path("/once"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<html>once</html>")
                .insert_header("content-type", "text/html"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let store = CrawlStore::open_in_memory().unwrap();
    let url = format!("{}/once", server.uri());
    let report = crawl_into(
        &store,
        "pages",
        CrawlSource::Urls(vec![url.clone(), url.clone(), format!("{url}#frag")]),
        fast_options(),
    )
    .await
    .unwrap();

    // SURT dedup collapses the three spellings into one fetch
    assert_eq!(report.total_discovered, 1);
    assert_eq!(report.succeeded, 1);
}

#[tokio::test]
async fn test_progress_row_reflects_outcome() {
    let server = MockServer::start().await;
    mount_robots(&server, ResponseTemplate::new(404)).await;
    mount_page(&server, "/a", "<html>a</html>").await;

    let store = CrawlStore::open_in_memory().unwrap();
    let report = crawl_into(
        &store,
        "pages",
        CrawlSource::Urls(vec![format!("{}/a", server.uri())]),
        fast_options(),
    )
    .await
    .unwrap();

    assert_eq!(
        store.run_status("pages", report.run_id).unwrap(),
        Some(RunStatus::Done)
    );
    let (processed, succeeded): (i64, i64) = store
        .with_connection(|conn| {
            conn.query_row(
                "SELECT processed, succeeded FROM _crawl_progress_pages WHERE run_id = ?1",
                [report.run_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
        })
        .unwrap();
    assert_eq!(processed, 1);
    assert_eq!(succeeded, 1);
}
