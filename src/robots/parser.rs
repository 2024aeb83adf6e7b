//! Robots.txt parsing
//!
//! Allow/disallow matching is delegated to the `robotstxt` crate, which
//! implements Google's longest-match semantics including `*` wildcards and
//! `$` end anchors. The directives that crate does not surface, namely
//! `Crawl-delay`, `Request-rate` and `Sitemap:`, are parsed here by hand.

use robotstxt::DefaultMatcher;

/// Parsed robots.txt policy for one host
///
/// Holds the raw body and answers per-path and per-agent questions on demand.
/// An empty body and the [`RobotsPolicy::allow_all`] sentinel both permit
/// everything.
#[derive(Debug, Clone)]
pub struct RobotsPolicy {
    content: String,
    allow_all: bool,
}

impl RobotsPolicy {
    /// Wraps a fetched robots.txt body
    pub fn from_content(content: &str) -> Self {
        Self {
            content: content.to_string(),
            allow_all: false,
        }
    }

    /// Permissive policy, used when robots.txt is missing or unreachable
    pub fn allow_all() -> Self {
        Self {
            content: String::new(),
            allow_all: true,
        }
    }

    /// Checks whether `path_with_query` may be fetched by `user_agent`
    ///
    /// Rule groups are selected by the longest case-insensitive `User-agent`
    /// token matching the configured agent, falling back to `*`; within the
    /// selected group the longest matching `Allow`/`Disallow` prefix wins.
    pub fn is_allowed(&self, path_with_query: &str, user_agent: &str) -> bool {
        if self.allow_all || self.content.is_empty() {
            return true;
        }

        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(&self.content, user_agent, path_with_query)
    }

    /// The crawl delay in seconds for `user_agent`, if any
    ///
    /// Honors both `Crawl-delay: <seconds>` (fractional accepted) and
    /// `Request-rate: n/m` (converted to m/n seconds); when a group carries
    /// both, the larger wins. Negative and non-numeric values are ignored.
    /// A group naming the agent specifically beats the `*` group.
    pub fn crawl_delay(&self, user_agent: &str) -> Option<f64> {
        if self.allow_all || self.content.is_empty() {
            return None;
        }

        let agent = user_agent.to_lowercase();

        // (specificity, delay): specificity is the matched token length,
        // 0 for the wildcard group.
        let mut best: Option<(usize, f64)> = None;
        let mut group_agents: Vec<String> = Vec::new();
        let mut last_was_agent = false;

        for line in self.content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    if !last_was_agent {
                        group_agents.clear();
                    }
                    group_agents.push(value.to_lowercase());
                    last_was_agent = true;
                }
                "crawl-delay" | "request-rate" => {
                    last_was_agent = false;
                    let Some(delay) = parse_delay_value(&key, value) else {
                        continue;
                    };
                    for token in &group_agents {
                        let specificity = if token == "*" {
                            Some(0)
                        } else if agent.contains(token.as_str()) {
                            Some(token.len())
                        } else {
                            None
                        };
                        if let Some(spec) = specificity {
                            let better = match best {
                                Some((s, d)) => spec > s || (spec == s && delay > d),
                                None => true,
                            };
                            if better {
                                best = Some((spec, delay));
                            }
                        }
                    }
                }
                _ => {
                    last_was_agent = false;
                }
            }
        }

        best.map(|(_, d)| d)
    }

    /// All `Sitemap:` URLs, wherever they appear in the file
    pub fn sitemaps(&self) -> Vec<String> {
        self.content
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                let (key, value) = line.split_once(':')?;
                if key.trim().eq_ignore_ascii_case("sitemap") {
                    let value = value.trim();
                    (!value.is_empty()).then(|| value.to_string())
                } else {
                    None
                }
            })
            .collect()
    }
}

fn parse_delay_value(key: &str, value: &str) -> Option<f64> {
    let delay = match key {
        "crawl-delay" => value.parse::<f64>().ok()?,
        "request-rate" => {
            // n/m requests per second-span, e.g. "1/5" = one request per 5s
            let (n, m) = value.split_once('/')?;
            let n = n.trim().parse::<f64>().ok()?;
            let m = m.trim().trim_end_matches(['s', 'S']).parse::<f64>().ok()?;
            if n <= 0.0 {
                return None;
            }
            m / n
        }
        _ => return None,
    };
    (delay.is_finite() && delay >= 0.0).then_some(delay)
}
