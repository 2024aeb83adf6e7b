//! HTTP fetching: conditional GETs, redirect policy, size and type gates,
//! and deterministic error classification.

mod classify;
mod client;

pub use classify::{
    classify_status, classify_transport, content_type_matches, status_promoted_retryable,
    ErrorType,
};
pub use client::{parse_retry_after, Conditional, FetchClient, FetchOutcome};
