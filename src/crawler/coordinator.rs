//! Crawl orchestration: the verb entry points
//!
//! A [`Coordinator`] runs one crawl against one target table. Bind phase
//! (identifier and option validation, table creation) happens in `new`;
//! execution drains the source into the queue, runs the worker pool, and
//! finalizes the progress row. Producers and workers run concurrently so a
//! large discovery cannot deadlock against the queue's watermark.

use crate::config::{validate, validate_identifier, CrawlOptions};
use crate::crawler::queue::{QueueEntry, WorkQueue};
use crate::crawler::scheduler::HostScheduler;
use crate::crawler::shutdown::CancellationToken;
use crate::crawler::worker::{run_worker, BatchWriter, WorkerContext};
use crate::fetch::{ErrorType, FetchClient};
use crate::robots::{self, RobotsPolicy};
use crate::sitemap::{discover_site, site_root, DiscoveredUrl};
use crate::state::{ProgressCounters, RunStatus};
use crate::storage::{CrawlStore, QueueRecord, ResultRow};
use crate::url::{host_of, matches_like, normalize_url, surt_key};
use crate::{TrawlError, UrlError};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use url::Url;

/// Queue watermarks: producers block above high until below low
const QUEUE_HIGH_WATERMARK: usize = 8192;
const QUEUE_LOW_WATERMARK: usize = 4096;

/// Ceiling for robots.txt and sitemap fetches
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Where the URLs to crawl come from
#[derive(Debug, Clone)]
pub enum CrawlSource {
    /// Explicit list of URLs
    Urls(Vec<String>),
    /// A query against the store yielding a `url` column
    Query(String),
}

/// Where the sites to discover come from
#[derive(Debug, Clone)]
pub enum SiteSource {
    /// Explicit list of hosts (bare host, host:port, or full URL)
    Sites(Vec<String>),
    /// A query against the store yielding a `site`/`host`/`url` column
    Query(String),
}

/// Summary of a finished (or cancelled) crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlReport {
    pub run_id: i64,
    pub total_discovered: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub status: RunStatus,
}

/// Orchestrates one crawl into one target table
pub struct Coordinator {
    store: CrawlStore,
    target: String,
    options: Arc<CrawlOptions>,
    url_filter: Option<String>,
    token: CancellationToken,
}

impl Coordinator {
    /// Bind phase: validates the target identifier and options, creates the
    /// target and auxiliary tables
    ///
    /// Fails without side effects: nothing is created when validation fails.
    pub fn new(
        store: CrawlStore,
        target: &str,
        options: CrawlOptions,
    ) -> Result<Self, TrawlError> {
        validate_identifier(target)?;
        validate(&options)?;
        store.create_crawl_tables(target)?;
        Ok(Self {
            store,
            target: target.to_string(),
            options: Arc::new(options),
            url_filter: None,
            token: CancellationToken::new(),
        })
    }

    /// Applies a `url LIKE` pattern as a pushdown filter
    pub fn with_url_filter(mut self, pattern: impl Into<String>) -> Self {
        self.url_filter = Some(pattern.into());
        self
    }

    /// The token that interrupts this crawl; clone it freely
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Runs the URL-source variant: drain the source, crawl, finalize
    pub async fn crawl(&self, source: CrawlSource) -> Result<CrawlReport, TrawlError> {
        let run = self.start_run()?;

        let urls = match source {
            CrawlSource::Urls(urls) => urls,
            CrawlSource::Query(sql) => self.store.source_urls(&sql)?,
        };

        let feed = async {
            for raw in urls {
                if self.token.is_cancelled() {
                    break;
                }
                self.enqueue_raw(&run, &raw).await;
            }
        };
        self.execute(&run, feed).await
    }

    /// Runs the sites variant: discovery per host, then the same crawl loop
    pub async fn crawl_sites(&self, source: SiteSource) -> Result<CrawlReport, TrawlError> {
        let run = self.start_run()?;

        let sites = match source {
            SiteSource::Sites(sites) => sites,
            SiteSource::Query(sql) => self.store.source_sites(&sql)?,
        };

        let feed = async {
            let mut tasks: JoinSet<Vec<DiscoveredUrl>> = JoinSet::new();
            for site in sites {
                let Ok((scheme, authority)) = site_root(&site) else {
                    tracing::warn!("skipping undiscoverable site {site:?}");
                    continue;
                };
                let host = authority
                    .split(':')
                    .next()
                    .unwrap_or(authority.as_str())
                    .to_string();

                let options = self.options.clone();
                let store = self.store.clone();
                let scheduler = run.scheduler.clone();
                let robots_client = run.robots_client.clone();
                let filter = self.url_filter.clone();
                tasks.spawn(async move {
                    let policy = if options.respect_robots_txt {
                        robots::fetch_robots(&robots_client, &scheme, &authority).await
                    } else {
                        RobotsPolicy::allow_all()
                    };
                    scheduler.install_robots(&host, policy.clone());
                    discover_site(
                        &robots_client,
                        &store,
                        &scheme,
                        &authority,
                        &policy,
                        &options,
                        filter.as_deref(),
                    )
                    .await
                });
            }

            while let Some(joined) = tasks.join_next().await {
                if self.token.is_cancelled() {
                    tasks.abort_all();
                    break;
                }
                match joined {
                    Ok(discovered) => {
                        for d in discovered {
                            self.enqueue_discovered(&run, d).await;
                        }
                    }
                    Err(e) => tracing::warn!("discovery task failed: {e}"),
                }
            }
        };
        self.execute(&run, feed).await
    }

    // ===== internals =====

    fn start_run(&self) -> Result<RunState, TrawlError> {
        let run_id = self.store.create_progress_row(&self.target)?;
        let queue = Arc::new(WorkQueue::new(QUEUE_HIGH_WATERMARK, QUEUE_LOW_WATERMARK));
        let scheduler = Arc::new(HostScheduler::new(self.options.clone()));
        let counters = Arc::new(ProgressCounters::default());
        let client = FetchClient::new(&self.options)?;
        let robots_client = client.with_timeout(DISCOVERY_TIMEOUT);
        let batch = Arc::new(BatchWriter::new(
            self.store.clone(),
            self.target.clone(),
            run_id,
            counters.clone(),
            queue.clone(),
            scheduler.clone(),
            self.token.clone(),
        ));

        let run = RunState {
            run_id,
            queue,
            scheduler,
            counters,
            pending: Arc::new(AtomicU64::new(0)),
            producing: Arc::new(AtomicBool::new(true)),
            batch,
            client,
            robots_client,
            seen: Mutex::new(HashSet::new()),
        };
        self.resume_queue(&run)?;
        Ok(run)
    }

    /// Loads surviving durable-queue rows from an interrupted run
    fn resume_queue(&self, run: &RunState) -> Result<(), TrawlError> {
        let records = self.store.load_queue(&self.target)?;
        if records.is_empty() {
            return Ok(());
        }
        tracing::info!(
            "resuming {} queued entries for {}",
            records.len(),
            self.target
        );
        let mut seen = run.seen.lock().unwrap_or_else(|e| e.into_inner());
        for record in records {
            let Ok(url) = Url::parse(&record.url) else {
                tracing::warn!("dropping unparseable resumed entry {}", record.url);
                continue;
            };
            if !seen.insert(record.surt_key.clone()) {
                continue;
            }
            run.queue.requeue(QueueEntry {
                url,
                surt_key: record.surt_key,
                host: record.host,
                enqueued_at: record.enqueued_at,
                earliest_due_at: Instant::now(),
                attempt_count: record.attempt_count,
                last_error_type: record
                    .last_error_type
                    .as_deref()
                    .and_then(ErrorType::from_str),
            });
            run.pending.fetch_add(1, Ordering::SeqCst);
            run.counters.add_discovered(1);
        }
        Ok(())
    }

    /// Normalizes, filters, dedups, and enqueues one raw source URL
    async fn enqueue_raw(&self, run: &RunState, raw: &str) {
        match normalize_url(raw, None) {
            Ok(url) => {
                self.enqueue_discovered(run, DiscoveredUrl { url, lastmod: None })
                    .await
            }
            Err(e) => {
                tracing::debug!("invalid source URL {raw:?}: {e}");
                run.counters.record_skip();
                if self.options.log_skipped {
                    run.batch.append(
                        Some(invalid_url_row(raw, &e)),
                        // No queue mirror row exists for a URL that never
                        // got enqueued; this key deletes nothing.
                        raw.to_string(),
                    );
                }
            }
        }
    }

    /// Enqueues a normalized candidate, honoring filter/dedup/update_stale
    async fn enqueue_discovered(&self, run: &RunState, candidate: DiscoveredUrl) {
        let url = candidate.url;
        if let Some(pattern) = &self.url_filter {
            if !matches_like(pattern, url.as_str()) {
                return;
            }
        }

        let Ok(key) = surt_key(&url) else {
            return;
        };
        {
            let mut seen = run.seen.lock().unwrap_or_else(|e| e.into_inner());
            if !seen.insert(key.clone()) {
                return;
            }
        }

        // update_stale: skip URLs whose stored row is at least as fresh as
        // the sitemap lastmod; a newer lastmod re-crawls even error rows
        if self.options.update_stale {
            if let Some(lastmod) = candidate.lastmod {
                let prior = self
                    .store
                    .prior_row(&self.target, url.as_str())
                    .unwrap_or(None);
                if let Some(prior) = prior {
                    if prior.crawled_at.is_some_and(|at| at >= lastmod) {
                        return;
                    }
                }
            }
        }

        let Ok(host) = host_of(&url) else {
            return;
        };
        let record = QueueRecord {
            surt_key: key.clone(),
            url: url.to_string(),
            host: host.clone(),
            enqueued_at: Utc::now(),
            attempt_count: 0,
            last_error_type: None,
        };
        if let Err(e) = self.store.queue_push_all(&self.target, &[record]) {
            tracing::warn!("failed to mirror queue entry {}: {}", url, e);
        }

        run.pending.fetch_add(1, Ordering::SeqCst);
        run.counters.add_discovered(1);
        run.queue
            .push(QueueEntry {
                url,
                surt_key: key,
                host,
                enqueued_at: Utc::now(),
                earliest_due_at: Instant::now(),
                attempt_count: 0,
                last_error_type: None,
            })
            .await;
    }

    /// Spawns the pool, runs the feed to completion, waits, finalizes
    async fn execute(
        &self,
        run: &RunState,
        feed: impl std::future::Future<Output = ()>,
    ) -> Result<CrawlReport, TrawlError> {
        let ctx = Arc::new(WorkerContext {
            queue: run.queue.clone(),
            scheduler: run.scheduler.clone(),
            client: run.client.clone(),
            robots_client: run.robots_client.clone(),
            store: self.store.clone(),
            target: self.target.clone(),
            options: self.options.clone(),
            counters: run.counters.clone(),
            token: self.token.clone(),
            batch: run.batch.clone(),
            pending: run.pending.clone(),
            producing: run.producing.clone(),
        });

        let worker_count = self.options.max_total_connections as usize;
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            workers.push(tokio::spawn(run_worker(ctx.clone())));
        }

        tokio::select! {
            _ = feed => {}
            _ = self.token.cancelled() => {}
        }
        run.producing.store(false, Ordering::SeqCst);

        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!("worker task panicked: {e}");
            }
        }

        let failure = run.batch.take_failure();
        let status = if failure.is_some() {
            RunStatus::Errored
        } else if self.token.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Done
        };

        if self.token.is_aborted() {
            // Hard abort: skip the final flush; flushed batches and durable
            // queue rows already persist.
            let snapshot = run
                .counters
                .snapshot(run.scheduler.global_in_flight(), run.queue.size() as u64);
            if let Err(e) =
                self.store
                    .update_progress(&self.target, run.run_id, snapshot, RunStatus::Cancelled)
            {
                tracing::warn!("failed to finalize progress after abort: {e}");
            }
        } else {
            run.batch.final_flush(status);
        }

        if let Some(failure) = failure {
            return Err(TrawlError::Flush(failure));
        }

        let snapshot = run
            .counters
            .snapshot(run.scheduler.global_in_flight(), run.queue.size() as u64);
        tracing::info!(
            "crawl into {} finished: {} processed ({} ok, {} failed, {} skipped), status {}",
            self.target,
            snapshot.processed,
            snapshot.succeeded,
            snapshot.failed,
            snapshot.skipped,
            status.to_db_string()
        );
        Ok(CrawlReport {
            run_id: run.run_id,
            total_discovered: snapshot.total_discovered,
            processed: snapshot.processed,
            succeeded: snapshot.succeeded,
            failed: snapshot.failed,
            skipped: snapshot.skipped,
            status,
        })
    }
}

/// Run-scoped shared machinery
struct RunState {
    run_id: i64,
    queue: Arc<WorkQueue>,
    scheduler: Arc<HostScheduler>,
    counters: Arc<ProgressCounters>,
    pending: Arc<AtomicU64>,
    producing: Arc<AtomicBool>,
    batch: Arc<BatchWriter>,
    client: FetchClient,
    robots_client: FetchClient,
    seen: Mutex<HashSet<String>>,
}

fn invalid_url_row(raw: &str, error: &UrlError) -> ResultRow {
    ResultRow {
        url: raw.to_string(),
        surt_key: String::new(),
        domain: String::new(),
        http_status: -1,
        body: None,
        content_type: None,
        elapsed_ms: 0,
        crawled_at: Utc::now(),
        error: Some(error.to_string()),
        error_type: Some(ErrorType::InvalidUrl.as_str().to_string()),
        etag: None,
        last_modified: None,
        content_hash: None,
    }
}

/// Crawls a set of URLs into `target`; this is the `crawl-into` verb
pub async fn crawl_into(
    store: &CrawlStore,
    target: &str,
    source: CrawlSource,
    options: CrawlOptions,
) -> Result<CrawlReport, TrawlError> {
    Coordinator::new(store.clone(), target, options)?
        .crawl(source)
        .await
}

/// Discovers and crawls whole sites into `target`; the `crawl-sites-into` verb
pub async fn crawl_sites_into(
    store: &CrawlStore,
    target: &str,
    source: SiteSource,
    options: CrawlOptions,
) -> Result<CrawlReport, TrawlError> {
    Coordinator::new(store.clone(), target, options)?
        .crawl_sites(source)
        .await
}
