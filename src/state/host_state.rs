use crate::config::CrawlOptions;
use crate::fetch::ErrorType;
use crate::robots::RobotsPolicy;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// EMA smoothing factor for response latency
const EMA_ALPHA: f64 = 0.2;

/// Above this smoothed latency the host is considered struggling
const SLOW_LATENCY_MS: f64 = 2000.0;

/// Below this smoothed latency the delay may decay back toward its seed
const FAST_LATENCY_MS: f64 = 500.0;

/// How many recent outcomes the decay rule looks at
const OUTCOME_WINDOW: usize = 10;

/// Robots lifecycle for a host
///
/// Exactly one worker transitions NotFetched → Fetching and performs the
/// fetch; everyone else re-queues until the policy is Ready. This is what
/// guarantees a disallowed URL is never fetched, even with several workers
/// holding entries for the same fresh host.
#[derive(Debug, Clone)]
pub enum RobotsState {
    NotFetched,
    Fetching,
    Ready(RobotsPolicy),
}

/// Per-host pacing and policy state, created on first contact with the host
///
/// Lives for the duration of one crawl run; it is not persisted. The fields
/// feed three separate mechanisms: politeness pacing (`last_fetch` +
/// effective delay), adaptive throughput (latency EMA), and failure backoff
/// (Fibonacci tier).
#[derive(Debug)]
pub struct HostState {
    effective_delay: f64,
    seed_delay: f64,
    /// Completion time of the most recent request to this host
    pub last_fetch: Option<Instant>,
    ema_latency_ms: Option<f64>,
    recent_outcomes: VecDeque<bool>,
    backoff_tier: u32,
    pub robots: RobotsState,
    pub sitemaps: Vec<String>,
    pub in_flight: u32,
    pub crawled: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl HostState {
    /// New host seeded from the configured default delay
    pub fn new(options: &CrawlOptions) -> Self {
        let seed = options
            .default_crawl_delay
            .clamp(options.min_crawl_delay, options.max_crawl_delay);
        Self {
            effective_delay: seed,
            seed_delay: seed,
            last_fetch: None,
            ema_latency_ms: None,
            recent_outcomes: VecDeque::with_capacity(OUTCOME_WINDOW),
            backoff_tier: 0,
            robots: RobotsState::NotFetched,
            sitemaps: Vec::new(),
            in_flight: 0,
            crawled: 0,
            failed: 0,
            skipped: 0,
        }
    }

    /// Installs the fetched robots policy and reseeds the delay from it
    pub fn set_robots(&mut self, policy: RobotsPolicy, options: &CrawlOptions) {
        let seed = policy
            .crawl_delay(&options.user_agent)
            .unwrap_or(options.default_crawl_delay)
            .clamp(options.min_crawl_delay, options.max_crawl_delay);
        self.seed_delay = seed;
        self.effective_delay = seed;
        self.sitemaps = policy.sitemaps();
        self.robots = RobotsState::Ready(policy);
    }

    /// Current minimum wait between successive requests to this host
    pub fn effective_delay(&self) -> Duration {
        Duration::from_secs_f64(self.effective_delay)
    }

    /// Earliest instant the next request may start, `None` if immediately
    pub fn next_due(&self) -> Option<Instant> {
        self.last_fetch.map(|t| t + self.effective_delay())
    }

    /// Whether another request may start now given the per-host cap
    pub fn has_slot(&self, options: &CrawlOptions) -> bool {
        self.in_flight < options.max_parallel_per_domain
    }

    /// Records a completed successful request and adapts the delay
    pub fn record_success(&mut self, latency_ms: f64, options: &CrawlOptions) {
        self.last_fetch = Some(Instant::now());
        self.backoff_tier = 0;
        self.crawled += 1;
        self.push_outcome(true);

        let ema = match self.ema_latency_ms {
            Some(prev) => EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * prev,
            None => latency_ms,
        };
        self.ema_latency_ms = Some(ema);

        if ema > SLOW_LATENCY_MS {
            self.effective_delay = (self.effective_delay * 2.0).min(options.max_crawl_delay);
        } else if ema < FAST_LATENCY_MS && self.window_clean() {
            // Decay toward the seed, never past it
            self.effective_delay = (self.effective_delay * 0.9).max(self.seed_delay);
        }
    }

    /// Records a failed request and returns how long to back off
    ///
    /// The Fibonacci tier advances only for failure classes that indicate
    /// host distress; a Retry-After from the server is honored when it asks
    /// for more than the tier would. Both are capped by
    /// `max_retry_backoff_seconds`.
    pub fn record_failure(
        &mut self,
        error_type: ErrorType,
        retry_after: Option<Duration>,
        options: &CrawlOptions,
    ) -> Duration {
        self.last_fetch = Some(Instant::now());
        self.failed += 1;
        self.push_outcome(false);

        if !error_type.triggers_backoff() {
            return self.effective_delay();
        }

        self.backoff_tier = self.backoff_tier.saturating_add(1);
        let mut backoff = Duration::from_secs(fibonacci(self.backoff_tier));
        if let Some(retry_after) = retry_after {
            backoff = backoff.max(retry_after);
        }
        backoff.min(Duration::from_secs(options.max_retry_backoff_seconds))
    }

    pub fn backoff_tier(&self) -> u32 {
        self.backoff_tier
    }

    pub fn ema_latency_ms(&self) -> Option<f64> {
        self.ema_latency_ms
    }

    fn push_outcome(&mut self, success: bool) {
        if self.recent_outcomes.len() == OUTCOME_WINDOW {
            self.recent_outcomes.pop_front();
        }
        self.recent_outcomes.push_back(success);
    }

    fn window_clean(&self) -> bool {
        self.recent_outcomes.iter().all(|&ok| ok)
    }
}

/// Fibonacci backoff series in seconds: 1, 1, 2, 3, 5, 8, ...
///
/// `tier` is 1-based; tier 0 maps to 1 second as well. Saturates instead of
/// overflowing for absurd tiers.
pub fn fibonacci(tier: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..tier {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    if tier == 0 {
        1
    } else {
        a
    }
}
