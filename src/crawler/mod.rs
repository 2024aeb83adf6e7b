//! The crawl engine: queue, scheduler, worker pool, and orchestration
//!
//! # Ordering guarantees
//!
//! - Requests to one host are paced by that host's effective delay no matter
//!   how many workers run
//! - In-flight fetches never exceed `max_parallel_per_domain` per host or
//!   `max_total_connections` globally
//! - Rows may flush in any order across URLs; within one batch they appear
//!   in the order appended
//!
//! # Lock discipline
//!
//! Locks are acquired in the order Queue → HostShard → Writer, never in
//! reverse. Workers hold no lock across an await point.

mod coordinator;
mod queue;
mod scheduler;
mod shutdown;
mod worker;

pub use coordinator::{
    crawl_into, crawl_sites_into, Coordinator, CrawlReport, CrawlSource, SiteSource,
};
pub use queue::{Popped, QueueEntry, WorkQueue};
pub use scheduler::{HostScheduler, RobotsCheck, SlotDecision};
pub use shutdown::{install_ctrl_c, CancellationToken, InterruptOutcome};
pub use worker::MAX_RETRIES;
