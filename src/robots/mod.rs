//! Robots.txt fetching and policy
//!
//! Robots fetches deliberately bypass the per-host scheduler: robots.txt is
//! itself the source of that host's pacing policy, so it is fetched before
//! any pacing state exists. A missing or unreachable robots.txt degrades to
//! an allow-all policy with the configured default delay.

mod parser;

pub use parser::RobotsPolicy;

use crate::fetch::{Conditional, FetchClient};
use url::Url;

/// Fetches and parses robots.txt for a host
///
/// Any non-200 response or transport failure yields [`RobotsPolicy::allow_all`];
/// a crawl never fails because a host has no robots.txt.
pub async fn fetch_robots(client: &FetchClient, scheme: &str, host: &str) -> RobotsPolicy {
    let raw = format!("{scheme}://{host}/robots.txt");
    let robots_url = match Url::parse(&raw) {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!("unparseable robots.txt URL {}: {}", raw, e);
            return RobotsPolicy::allow_all();
        }
    };

    tracing::debug!("fetching robots.txt from {}", robots_url);
    let outcome = client.fetch(&robots_url, &Conditional::default()).await;

    if outcome.status == 200 {
        match outcome.body {
            Some(body) => RobotsPolicy::from_content(&body),
            None => RobotsPolicy::allow_all(),
        }
    } else {
        tracing::debug!(
            "robots.txt for {} unavailable (status {}), allowing all",
            host,
            outcome.status
        );
        RobotsPolicy::allow_all()
    }
}
