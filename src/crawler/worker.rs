//! The worker pool
//!
//! Each worker loops: pop a due entry, pass the robots gate, take a host
//! slot under the global connection cap, fetch with conditional headers from
//! the prior stored row, then either append a terminal row to the shared
//! batch or re-enqueue with backoff. Rows flush in batches; the durable
//! queue mirror rows are deleted in the same transaction as the flush, so a
//! crash can only re-fetch, never lose work.

use crate::config::CrawlOptions;
use crate::crawler::queue::{Popped, QueueEntry, WorkQueue};
use crate::crawler::scheduler::{HostScheduler, RobotsCheck, SlotDecision};
use crate::crawler::shutdown::CancellationToken;
use crate::fetch::{status_promoted_retryable, Conditional, ErrorType, FetchClient, FetchOutcome};
use crate::robots;
use crate::state::{ProgressCounters, RunStatus};
use crate::storage::{CrawlStore, PriorRow, QueueRecord, ResultRow};
use crate::url::{host_of, path_with_query, surt_key};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use url::Url;

/// Attempts beyond the first fetch before a retryable error turns terminal
pub const MAX_RETRIES: u32 = 3;

/// Rows held in memory before a flush is forced
const BATCH_MAX_ROWS: usize = 20;

/// A non-empty batch older than this flushes even if small
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Re-queue nudge when a host slot is unavailable
const SLOT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Idle poll interval when the queue has nothing due
const IDLE_POLL: Duration = Duration::from_millis(50);

struct BatchState {
    rows: Vec<ResultRow>,
    queue_keys: Vec<String>,
    last_flush: Instant,
}

/// Accumulates terminal rows and flushes them transactionally
///
/// `queue_keys` travel with the rows so the durable queue mirror entries are
/// deleted in the same transaction that persists their outcomes.
pub(crate) struct BatchWriter {
    store: CrawlStore,
    target: String,
    run_id: i64,
    counters: Arc<ProgressCounters>,
    queue: Arc<WorkQueue>,
    scheduler: Arc<HostScheduler>,
    token: CancellationToken,
    state: Mutex<BatchState>,
    failure: Mutex<Option<String>>,
}

impl BatchWriter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: CrawlStore,
        target: String,
        run_id: i64,
        counters: Arc<ProgressCounters>,
        queue: Arc<WorkQueue>,
        scheduler: Arc<HostScheduler>,
        token: CancellationToken,
    ) -> Self {
        Self {
            store,
            target,
            run_id,
            counters,
            queue,
            scheduler,
            token,
            state: Mutex::new(BatchState {
                rows: Vec::new(),
                queue_keys: Vec::new(),
                last_flush: Instant::now(),
            }),
            failure: Mutex::new(None),
        }
    }

    /// Appends a terminal outcome; `row` is None for silent policy drops
    pub(crate) fn append(&self, row: Option<ResultRow>, queue_key: String) {
        let mut state = self.lock_state();
        if let Some(row) = row {
            state.rows.push(row);
        }
        state.queue_keys.push(queue_key);
        if state.rows.len() + state.queue_keys.len() >= BATCH_MAX_ROWS {
            self.flush_locked(&mut state);
        }
    }

    /// Flushes when the batch has been sitting longer than the interval
    pub(crate) fn flush_if_stale(&self) {
        let mut state = self.lock_state();
        let idle = state.last_flush.elapsed() >= FLUSH_INTERVAL;
        if idle && (!state.rows.is_empty() || !state.queue_keys.is_empty()) {
            self.flush_locked(&mut state);
        }
    }

    /// Final flush at end of run, with the run's closing status
    pub(crate) fn final_flush(&self, status: RunStatus) {
        let mut state = self.lock_state();
        self.flush_with_status(&mut state, status);
    }

    /// First storage error that poisoned the run, if any
    pub(crate) fn take_failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn flush_locked(&self, state: &mut BatchState) {
        let status = if self.token.is_cancelled() {
            RunStatus::Draining
        } else {
            RunStatus::Running
        };
        self.flush_with_status(state, status);
    }

    // Runs even with an empty batch: the progress row and status still update
    fn flush_with_status(&self, state: &mut BatchState, status: RunStatus) {
        let rows = std::mem::take(&mut state.rows);
        let queue_keys = std::mem::take(&mut state.queue_keys);
        let snapshot = self.counters.snapshot(
            self.scheduler.global_in_flight(),
            self.queue.size() as u64,
        );

        tracing::debug!(
            "flushing {} rows ({} queue deletions) to {}",
            rows.len(),
            queue_keys.len(),
            self.target
        );
        if let Err(e) =
            self.store
                .flush_batch(&self.target, self.run_id, &rows, &queue_keys, snapshot, status)
        {
            tracing::error!("batch flush failed for {}: {}", self.target, e);
            let mut failure = self.failure.lock().unwrap_or_else(|p| p.into_inner());
            failure.get_or_insert(e.to_string());
            self.token.cancel();
        }
        state.last_flush = Instant::now();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Everything a worker task needs, shared across the pool
pub(crate) struct WorkerContext {
    pub queue: Arc<WorkQueue>,
    pub scheduler: Arc<HostScheduler>,
    pub client: FetchClient,
    pub robots_client: FetchClient,
    pub store: CrawlStore,
    pub target: String,
    pub options: Arc<CrawlOptions>,
    pub counters: Arc<ProgressCounters>,
    pub token: CancellationToken,
    pub batch: Arc<BatchWriter>,
    /// Entries enqueued but without a terminal outcome yet
    pub pending: Arc<AtomicU64>,
    /// True while the source drain / discovery is still producing entries
    pub producing: Arc<AtomicBool>,
}

/// One worker's main loop; the pool is N of these on the runtime
pub(crate) async fn run_worker(ctx: Arc<WorkerContext>) {
    loop {
        if ctx.token.is_cancelled() {
            break;
        }
        if ctx.pending.load(Ordering::SeqCst) == 0 && !ctx.producing.load(Ordering::SeqCst) {
            break;
        }
        ctx.batch.flush_if_stale();

        match ctx.queue.pop_due(Instant::now()) {
            Popped::Entry(entry) => process_entry(&ctx, entry).await,
            Popped::NotDue(due) => {
                let wait = due
                    .saturating_duration_since(Instant::now())
                    .min(IDLE_POLL)
                    .max(Duration::from_millis(1));
                ctx.token.sleep(wait).await;
            }
            Popped::Empty => {
                // Entries may still be in flight on other workers
                ctx.token.sleep(IDLE_POLL).await;
            }
        }
    }
}

async fn process_entry(ctx: &WorkerContext, mut entry: QueueEntry) {
    let host = entry.host.clone();
    let path = path_with_query(&entry.url);

    match ctx.scheduler.robots_check(&host, &path) {
        RobotsCheck::NeedsFetch => {
            let policy =
                robots::fetch_robots(&ctx.robots_client, entry.url.scheme(), &authority(&entry.url))
                    .await;
            ctx.scheduler.install_robots(&host, policy);
            ctx.queue.requeue(entry);
            return;
        }
        RobotsCheck::Pending => {
            entry.earliest_due_at = Instant::now() + SLOT_RETRY_DELAY;
            ctx.queue.requeue(entry);
            return;
        }
        RobotsCheck::Disallowed => {
            skip_entry(
                ctx,
                &entry,
                ErrorType::RobotsDisallowed,
                "disallowed by robots.txt".to_string(),
            );
            return;
        }
        RobotsCheck::Allowed => {}
    }

    let permit = tokio::select! {
        permit = ctx.scheduler.acquire_global() => permit,
        _ = ctx.token.cancelled() => None,
    };
    // On shutdown the entry is simply dropped here; its durable mirror row
    // keeps it for the next run.
    let Some(_permit) = permit else {
        return;
    };

    match ctx.scheduler.try_start(&host, Instant::now()) {
        SlotDecision::Ready => {}
        SlotDecision::Busy => {
            entry.earliest_due_at = Instant::now() + SLOT_RETRY_DELAY;
            ctx.queue.requeue(entry);
            return;
        }
        SlotDecision::NotDue(due) => {
            entry.earliest_due_at = due;
            ctx.queue.requeue(entry);
            return;
        }
    }

    let prior = match ctx.store.prior_row(&ctx.target, entry.url.as_str()) {
        Ok(prior) => prior,
        Err(e) => {
            tracing::warn!("prior-row lookup failed for {}: {}", entry.url, e);
            None
        }
    };
    let conditional = prior
        .as_ref()
        .map(|p| Conditional {
            if_none_match: p.etag.clone(),
            if_modified_since: p.last_modified.clone(),
        })
        .unwrap_or_default();

    let outcome = ctx.client.fetch(&entry.url, &conditional).await;
    ctx.scheduler.finish(&host);

    handle_outcome(ctx, entry, prior, outcome);
}

fn handle_outcome(
    ctx: &WorkerContext,
    mut entry: QueueEntry,
    prior: Option<PriorRow>,
    outcome: FetchOutcome,
) {
    if ctx.token.is_aborted() {
        return;
    }
    let host = entry.host.clone();

    if outcome.is_not_modified() {
        ctx.scheduler.record_success(&host, outcome.elapsed_ms as f64);
        ctx.counters.record_success();
        let prior = prior.unwrap_or_else(|| {
            // A 304 without a stored row means the server misbehaved; store
            // the response as-is with nothing to reuse.
            tracing::warn!("304 for {} with no prior row", entry.url);
            PriorRow {
                etag: None,
                last_modified: None,
                content_type: None,
                body: None,
                content_hash: None,
                crawled_at: None,
            }
        });
        let row = ResultRow {
            url: entry.url.to_string(),
            surt_key: entry.surt_key.clone(),
            domain: host,
            http_status: 304,
            body: prior.body,
            content_type: outcome.content_type.or(prior.content_type),
            elapsed_ms: outcome.elapsed_ms,
            crawled_at: Utc::now(),
            error: None,
            error_type: None,
            etag: outcome.etag.or(prior.etag),
            last_modified: outcome.last_modified.or(prior.last_modified),
            // A 304 never changes the stored hash
            content_hash: prior.content_hash,
        };
        finish_entry(ctx, &entry, Some(row));
        return;
    }

    if outcome.is_success() {
        ctx.scheduler.record_success(&host, outcome.elapsed_ms as f64);
        ctx.counters.record_success();

        let final_url = outcome.final_url.clone();
        let row = ResultRow {
            url: final_url.to_string(),
            surt_key: surt_key(&final_url).unwrap_or_else(|_| entry.surt_key.clone()),
            domain: host_of(&final_url).unwrap_or_else(|_| entry.host.clone()),
            http_status: outcome.status as i32,
            content_hash: outcome.body.as_deref().map(sha256_hex),
            body: outcome.body,
            content_type: outcome.content_type,
            elapsed_ms: outcome.elapsed_ms,
            crawled_at: Utc::now(),
            error: None,
            error_type: None,
            etag: outcome.etag,
            last_modified: outcome.last_modified,
        };
        finish_entry(ctx, &entry, Some(row));
        return;
    }

    let error_type = outcome.error_type.unwrap_or(ErrorType::Unknown);
    let backoff = ctx
        .scheduler
        .record_failure(&host, error_type, outcome.retry_after);

    match error_type {
        ErrorType::ContentTooLarge | ErrorType::ContentTypeRejected => {
            skip_entry(
                ctx,
                &entry,
                error_type,
                outcome.error.unwrap_or_else(|| error_type.to_string()),
            );
            return;
        }
        _ => {}
    }

    let retryable = error_type.is_retryable() || status_promoted_retryable(outcome.status);
    if retryable && entry.attempt_count < MAX_RETRIES {
        entry.attempt_count += 1;
        entry.last_error_type = Some(error_type);
        entry.earliest_due_at = Instant::now() + backoff;
        tracing::debug!(
            "retry {}/{} for {} after {:?} ({})",
            entry.attempt_count,
            MAX_RETRIES,
            entry.url,
            backoff,
            error_type
        );
        // Keep the durable mirror's attempt count current for resume
        let record = QueueRecord {
            surt_key: entry.surt_key.clone(),
            url: entry.url.to_string(),
            host: entry.host.clone(),
            enqueued_at: entry.enqueued_at,
            attempt_count: entry.attempt_count,
            last_error_type: Some(error_type.as_str().to_string()),
        };
        if let Err(e) = ctx.store.queue_push_all(&ctx.target, &[record]) {
            tracing::warn!("failed to update queue mirror for {}: {}", entry.url, e);
        }
        ctx.queue.requeue(entry);
        return;
    }

    ctx.counters.record_failure();
    let row = ResultRow {
        url: entry.url.to_string(),
        surt_key: entry.surt_key.clone(),
        domain: entry.host.clone(),
        http_status: outcome.status as i32,
        body: None,
        content_type: outcome.content_type,
        elapsed_ms: outcome.elapsed_ms,
        crawled_at: Utc::now(),
        error: outcome.error,
        error_type: Some(error_type.as_str().to_string()),
        etag: None,
        last_modified: None,
        content_hash: None,
    };
    finish_entry(ctx, &entry, Some(row));
}

/// Terminal policy skip: synthetic row when `log_skipped`, silent otherwise
fn skip_entry(ctx: &WorkerContext, entry: &QueueEntry, error_type: ErrorType, error: String) {
    ctx.counters.record_skip();
    ctx.scheduler.record_skip(&entry.host);

    let row = ctx.options.log_skipped.then(|| ResultRow {
        url: entry.url.to_string(),
        surt_key: entry.surt_key.clone(),
        domain: entry.host.clone(),
        http_status: -1,
        body: None,
        content_type: None,
        elapsed_ms: 0,
        crawled_at: Utc::now(),
        error: Some(error),
        error_type: Some(error_type.as_str().to_string()),
        etag: None,
        last_modified: None,
        content_hash: None,
    });
    finish_entry(ctx, entry, row);
}

fn finish_entry(ctx: &WorkerContext, entry: &QueueEntry, row: Option<ResultRow>) {
    ctx.batch.append(row, entry.surt_key.clone());
    ctx.pending.fetch_sub(1, Ordering::SeqCst);
}

/// `host[:port]` for building this host's robots.txt URL
fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Hex SHA-256 of a response body
pub fn sha256_hex(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}
