//! Run-scoped mutable state
//!
//! # Components
//!
//! - `HostState`: per-host pacing, adaptive delay, backoff tier, robots
//!   lifecycle, and in-flight accounting
//! - `ProgressCounters` / `RunStatus`: monotonic run counters mirrored into
//!   the progress table at each flush

mod host_state;
mod progress;

pub use host_state::{fibonacci, HostState, RobotsState};
pub use progress::{ProgressCounters, ProgressSnapshot, RunStatus};
