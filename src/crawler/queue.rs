//! The work queue: a due-time priority queue with SURT deduplication
//!
//! Entries are ordered by `earliest_due_at`, ties broken by insertion order.
//! Pushing an entry whose SURT key is already queued keeps the earlier due
//! time. The queue is bounded by a high/low watermark pair: producers
//! (discovery, source draining) block above the high mark until consumers
//! pull it back under the low mark. Consumers never block here.
//!
//! Every entry is mirrored durably in `_crawl_queue_{target}` by the caller;
//! this structure is only the in-memory ordering.

use crate::fetch::ErrorType;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::Notify;
use url::Url;

/// One queued fetch
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub url: Url,
    pub surt_key: String,
    pub host: String,
    pub enqueued_at: DateTime<Utc>,
    pub earliest_due_at: Instant,
    pub attempt_count: u32,
    pub last_error_type: Option<ErrorType>,
}

/// Result of a non-blocking pop
#[derive(Debug)]
pub enum Popped {
    /// An entry whose due time has passed
    Entry(QueueEntry),
    /// Nothing due yet; the earliest due instant is returned
    NotDue(Instant),
    Empty,
}

#[derive(Debug, Eq, PartialEq)]
struct HeapItem {
    due: Instant,
    seq: u64,
    surt_key: String,
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest due pops first
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    heap: BinaryHeap<HeapItem>,
    entries: HashMap<String, QueueEntry>,
}

/// Thread-safe bounded work queue
pub struct WorkQueue {
    inner: Mutex<QueueInner>,
    seq: AtomicU64,
    high_watermark: usize,
    low_watermark: usize,
    space: Notify,
}

impl WorkQueue {
    pub fn new(high_watermark: usize, low_watermark: usize) -> Self {
        assert!(low_watermark <= high_watermark);
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                entries: HashMap::new(),
            }),
            seq: AtomicU64::new(0),
            high_watermark,
            low_watermark,
            space: Notify::new(),
        }
    }

    /// Queue depth (distinct SURT keys)
    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Inserts an entry, blocking while the queue is above the high watermark
    ///
    /// Deduplicates by SURT key: a key already queued keeps whichever due
    /// time is earlier.
    pub async fn push(&self, entry: QueueEntry) {
        let mut pending = Some(entry);
        loop {
            // Register for the space notification before checking fullness,
            // so a pop between the check and the await is not missed
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                let key_queued = pending
                    .as_ref()
                    .is_some_and(|e| inner.entries.contains_key(&e.surt_key));
                if inner.entries.len() < self.high_watermark || key_queued {
                    if let Some(entry) = pending.take() {
                        Self::insert(&mut inner, &self.seq, entry);
                    }
                    return;
                }
            }
            notified.await;
        }
    }

    /// Re-inserts an entry without watermark blocking
    ///
    /// Used by workers for retries and busy-host re-queues; a worker must
    /// never block on its own queue.
    pub fn requeue(&self, entry: QueueEntry) {
        let mut inner = self.lock();
        Self::insert(&mut inner, &self.seq, entry);
    }

    /// Pops the most overdue entry, if any is due at `now`
    pub fn pop_due(&self, now: Instant) -> Popped {
        let mut inner = self.lock();
        loop {
            // Lazy deletion: heap items whose entry was superseded or
            // already popped are skipped here.
            let (due, live) = match inner.heap.peek() {
                None => return Popped::Empty,
                Some(top) => {
                    let live = inner
                        .entries
                        .get(&top.surt_key)
                        .is_some_and(|e| e.earliest_due_at == top.due);
                    (top.due, live)
                }
            };
            if !live {
                inner.heap.pop();
                continue;
            }
            if due > now {
                return Popped::NotDue(due);
            }

            let Some(item) = inner.heap.pop() else {
                return Popped::Empty;
            };
            let Some(entry) = inner.entries.remove(&item.surt_key) else {
                continue;
            };
            if inner.entries.len() <= self.low_watermark {
                self.space.notify_waiters();
            }
            return Popped::Entry(entry);
        }
    }

    /// Removes and returns everything, due or not
    pub fn drain(&self) -> Vec<QueueEntry> {
        let mut inner = self.lock();
        inner.heap.clear();
        let entries = inner.entries.drain().map(|(_, e)| e).collect();
        self.space.notify_waiters();
        entries
    }

    fn insert(inner: &mut QueueInner, seq: &AtomicU64, entry: QueueEntry) {
        match inner.entries.get_mut(&entry.surt_key) {
            Some(existing) => {
                // Keep the earlier due time
                if entry.earliest_due_at < existing.earliest_due_at {
                    existing.earliest_due_at = entry.earliest_due_at;
                    inner.heap.push(HeapItem {
                        due: entry.earliest_due_at,
                        seq: seq.fetch_add(1, AtomicOrdering::Relaxed),
                        surt_key: entry.surt_key,
                    });
                }
            }
            None => {
                inner.heap.push(HeapItem {
                    due: entry.earliest_due_at,
                    seq: seq.fetch_add(1, AtomicOrdering::Relaxed),
                    surt_key: entry.surt_key.clone(),
                });
                inner.entries.insert(entry.surt_key.clone(), entry);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
