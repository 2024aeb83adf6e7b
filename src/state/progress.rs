use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle status of one crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    /// Shutdown requested; in-flight fetches finishing, no new work popped
    Draining,
    Done,
    Cancelled,
    Errored,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Errored => "errored",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "draining" => Some(Self::Draining),
            "done" => Some(Self::Done),
            "cancelled" => Some(Self::Cancelled),
            "errored" => Some(Self::Errored),
            _ => None,
        }
    }
}

/// Shared outcome counters for a run, updated by workers, read by flushes
///
/// Counters only ever go up; the progress table therefore reflects at least
/// every row already flushed, never more.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    pub total_discovered: AtomicU64,
    pub processed: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub skipped: AtomicU64,
}

/// Point-in-time copy of the counters plus live queue/in-flight gauges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total_discovered: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub in_flight: u64,
    pub queue_depth: u64,
}

impl ProgressCounters {
    pub fn add_discovered(&self, n: u64) {
        self.total_discovered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, in_flight: u64, queue_depth: u64) -> ProgressSnapshot {
        ProgressSnapshot {
            total_discovered: self.total_discovered.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            in_flight,
            queue_depth,
        }
    }
}
