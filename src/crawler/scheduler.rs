//! Per-host scheduling: pacing, robots gating, and concurrency caps
//!
//! Host state lives in a sharded map so workers contending on different
//! hosts rarely share a lock. The global in-flight cap is a semaphore whose
//! permits are acquired before a host slot is attempted.
//!
//! Lock order across the engine is Queue → HostShard → Writer; no code path
//! takes them in reverse.

use crate::config::CrawlOptions;
use crate::fetch::ErrorType;
use crate::robots::RobotsPolicy;
use crate::state::{HostState, RobotsState};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const SHARD_COUNT: usize = 16;

/// Outcome of a robots gate check for one URL
#[derive(Debug, PartialEq, Eq)]
pub enum RobotsCheck {
    Allowed,
    Disallowed,
    /// Caller won the race to fetch robots.txt for this host
    NeedsFetch,
    /// Another worker is fetching robots.txt; come back shortly
    Pending,
}

/// Outcome of trying to start a fetch against a host
#[derive(Debug, PartialEq, Eq)]
pub enum SlotDecision {
    /// In-flight count was incremented; caller must call `finish`
    Ready,
    /// Host is not due yet
    NotDue(Instant),
    /// Per-host parallelism cap reached
    Busy,
}

/// Sharded host map plus the global connection cap
pub struct HostScheduler {
    shards: Vec<Mutex<HashMap<String, HostState>>>,
    global: Arc<Semaphore>,
    in_flight: AtomicU64,
    options: Arc<CrawlOptions>,
}

impl HostScheduler {
    pub fn new(options: Arc<CrawlOptions>) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            global: Arc::new(Semaphore::new(options.max_total_connections as usize)),
            in_flight: AtomicU64::new(0),
            options,
        }
    }

    /// Runs a closure against the host's state, creating it on first contact
    pub fn with_host<T>(&self, host: &str, f: impl FnOnce(&mut HostState) -> T) -> T {
        let mut shard = self.shard(host);
        let state = shard.entry(host.to_string()).or_insert_with(|| {
            let mut state = HostState::new(&self.options);
            if !self.options.respect_robots_txt {
                state.set_robots(RobotsPolicy::allow_all(), &self.options);
            }
            state
        });
        f(state)
    }

    /// Robots gate for one URL path; may claim the robots fetch for the caller
    pub fn robots_check(&self, host: &str, path_with_query: &str) -> RobotsCheck {
        let agent = self.options.user_agent.clone();
        self.with_host(host, |state| {
            match &state.robots {
                RobotsState::Fetching => return RobotsCheck::Pending,
                RobotsState::Ready(policy) => {
                    return if policy.is_allowed(path_with_query, &agent) {
                        RobotsCheck::Allowed
                    } else {
                        RobotsCheck::Disallowed
                    };
                }
                RobotsState::NotFetched => {}
            }
            state.robots = RobotsState::Fetching;
            RobotsCheck::NeedsFetch
        })
    }

    /// Installs a fetched robots policy for a host
    pub fn install_robots(&self, host: &str, policy: RobotsPolicy) {
        let options = self.options.clone();
        self.with_host(host, |state| state.set_robots(policy, &options));
    }

    /// Acquires a global connection permit; `None` only if the pool closed
    pub async fn acquire_global(&self) -> Option<OwnedSemaphorePermit> {
        self.global.clone().acquire_owned().await.ok()
    }

    /// Attempts to start a fetch now: checks the per-host slot, then pacing
    pub fn try_start(&self, host: &str, now: Instant) -> SlotDecision {
        let options = self.options.clone();
        let decision = self.with_host(host, |state| {
            if !state.has_slot(&options) {
                return SlotDecision::Busy;
            }
            // A paced host (nonzero delay) serializes: the next request's
            // due time is measured from the in-flight request's completion,
            // which is unknown until it lands.
            if state.in_flight > 0 && !state.effective_delay().is_zero() {
                return SlotDecision::Busy;
            }
            if let Some(due) = state.next_due() {
                if due > now {
                    return SlotDecision::NotDue(due);
                }
            }
            state.in_flight += 1;
            SlotDecision::Ready
        });
        if decision == SlotDecision::Ready {
            self.in_flight.fetch_add(1, Ordering::Relaxed);
        }
        decision
    }

    /// Releases the per-host slot taken by a `Ready` decision
    pub fn finish(&self, host: &str) {
        self.with_host(host, |state| {
            state.in_flight = state.in_flight.saturating_sub(1);
        });
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Records a successful fetch and its latency against the host
    pub fn record_success(&self, host: &str, latency_ms: f64) {
        let options = self.options.clone();
        self.with_host(host, |state| state.record_success(latency_ms, &options));
    }

    /// Records a failed fetch; returns the backoff before the next attempt
    pub fn record_failure(
        &self,
        host: &str,
        error_type: ErrorType,
        retry_after: Option<Duration>,
    ) -> Duration {
        let options = self.options.clone();
        self.with_host(host, |state| {
            state.record_failure(error_type, retry_after, &options)
        })
    }

    /// Counts a robots/policy skip against the host
    pub fn record_skip(&self, host: &str) {
        self.with_host(host, |state| state.skipped += 1);
    }

    /// Fetches currently in flight across all hosts
    pub fn global_in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    fn shard(&self, host: &str) -> MutexGuard<'_, HashMap<String, HostState>> {
        let mut hasher = DefaultHasher::new();
        host.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % SHARD_COUNT;
        self.shards[idx].lock().unwrap_or_else(|e| e.into_inner())
    }
}
