//! Cooperative shutdown
//!
//! The token is owned by the coordinator and passed by reference into
//! workers; there are no process-wide singletons, so tests can drive
//! shutdown deterministically. The interrupt protocol matches the verbs'
//! interactive behavior: one interrupt drains (workers finish in-flight
//! fetches, a final flush runs), a second within the window aborts hard.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Window in which a second interrupt escalates to a hard abort
const ABORT_WINDOW: Duration = Duration::from_secs(3);

/// Sleeps are sliced so a cancellation is observed promptly
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    aborted: AtomicBool,
    last_interrupt: Mutex<Option<Instant>>,
    notify: Notify,
}

/// Shared cancellation flag with drain/abort phases
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

/// What an interrupt escalated to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    Draining,
    Aborted,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a graceful drain
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Requests an immediate abort (implies cancelled)
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.cancel();
    }

    /// Records an interrupt; the second within the window aborts
    pub fn interrupt(&self) -> InterruptOutcome {
        let now = Instant::now();
        let mut last = self
            .inner
            .last_interrupt
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let escalate = matches!(*last, Some(prev) if now.duration_since(prev) < ABORT_WINDOW);
        *last = Some(now);
        drop(last);

        if escalate {
            self.abort();
            InterruptOutcome::Aborted
        } else {
            self.cancel();
            InterruptOutcome::Draining
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Resolves when the token is cancelled
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            // Register before re-checking the flag, otherwise a cancel
            // landing between the check and the await is never observed
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleeps up to `duration`, waking early on cancellation
    pub async fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.is_cancelled() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            tokio::time::sleep(remaining.min(SLEEP_SLICE)).await;
        }
    }
}

/// Wires Ctrl-C to the token: first interrupt drains, second aborts
///
/// Returns the handle of the listening task; dropping it does not detach the
/// handler, aborting it does.
pub fn install_ctrl_c(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            match token.interrupt() {
                InterruptOutcome::Draining => {
                    tracing::info!("interrupt received, draining; interrupt again to abort");
                }
                InterruptOutcome::Aborted => {
                    tracing::warn!("second interrupt, aborting");
                    return;
                }
            }
        }
    })
}
