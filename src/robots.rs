/// file: src/robots.rs
/// description: Per-origin robots.txt discipline — cached fetch, allow/deny
/// matching, crawl-delay and sitemap directives.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use robotstxt::DefaultMatcher;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

// ---------------------------------------------------------------------------
// RobotsGate
// ---------------------------------------------------------------------------

/// Outcome of fetching one origin's robots.txt. `Empty` (network error,
/// non-2xx, or unreadable body) is interpreted as allow-all.
enum RobotsRecord {
    Empty,
    Parsed(String),
}

/// Memoized robots.txt authority for a run. One fetch per origin; answers
/// are derived from the cached body on every query.
pub struct RobotsGate {
    enabled: bool,
    user_agent: String,
    client: reqwest::Client,
    cache: Mutex<HashMap<String, Arc<RobotsRecord>>>,
}

impl RobotsGate {
    pub fn new(enabled: bool, user_agent: String, client: reqwest::Client) -> Self {
        Self {
            enabled,
            user_agent,
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// A gate that admits everything without fetching.
    pub fn disabled() -> Self {
        Self::new(false, String::new(), reqwest::Client::new())
    }

    async fn record_for(&self, url: &Url) -> Arc<RobotsRecord> {
        let origin = url.origin().ascii_serialization();

        {
            let cache = self.cache.lock().await;
            if let Some(record) = cache.get(&origin) {
                return Arc::clone(record);
            }
        }

        // The lock is not held across the fetch; a concurrent duplicate
        // fetch for the same origin is tolerated and resolved by last
        // insert.
        let robots_url = format!("{origin}/robots.txt");
        let record = match self
            .client
            .get(&robots_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => RobotsRecord::Parsed(body),
                Err(e) => {
                    debug!(origin, error = %e, "robots.txt body unreadable; allowing all");
                    RobotsRecord::Empty
                }
            },
            Ok(resp) => {
                debug!(origin, status = %resp.status(), "robots.txt not available; allowing all");
                RobotsRecord::Empty
            }
            Err(e) => {
                debug!(origin, error = %e, "robots.txt fetch failed; allowing all");
                RobotsRecord::Empty
            }
        };

        let record = Arc::new(record);
        let mut cache = self.cache.lock().await;
        // Bounded memory on very wide crawls.
        if cache.len() >= 1_000
            && let Some(key) = cache.keys().next().cloned()
        {
            cache.remove(&key);
        }
        cache.insert(origin, Arc::clone(&record));
        record
    }

    /// Whether `url` may be fetched for the configured user agent.
    pub async fn is_allowed(&self, url: &Url) -> bool {
        if !self.enabled {
            return true;
        }
        match &*self.record_for(url).await {
            RobotsRecord::Empty => true,
            RobotsRecord::Parsed(body) => {
                let mut matcher = DefaultMatcher::default();
                matcher.one_agent_allowed_by_robots(body, &self.user_agent, url.as_str())
            }
        }
    }

    /// Crawl delay in seconds for `url`'s origin, or 0.
    pub async fn crawl_delay(&self, url: &Url) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        match &*self.record_for(url).await {
            RobotsRecord::Empty => 0.0,
            RobotsRecord::Parsed(body) => {
                parse_crawl_delay(body, &self.user_agent).unwrap_or(0.0)
            }
        }
    }

    /// Sitemap URLs declared by `url`'s origin.
    pub async fn sitemaps(&self, url: &Url) -> Vec<String> {
        if !self.enabled {
            return Vec::new();
        }
        match &*self.record_for(url).await {
            RobotsRecord::Empty => Vec::new(),
            RobotsRecord::Parsed(body) => parse_sitemaps(body),
        }
    }
}

// ---------------------------------------------------------------------------
// Directive scanning
// ---------------------------------------------------------------------------

/// Scan for a `Crawl-delay` directive. A group naming the configured agent
/// wins over the `*` group.
fn parse_crawl_delay(body: &str, user_agent: &str) -> Option<f64> {
    let ua = user_agent.to_ascii_lowercase();
    let mut group_agents: Vec<String> = Vec::new();
    let mut in_agent_run = false;
    let mut wildcard_delay: Option<f64> = None;
    let mut agent_delay: Option<f64> = None;

    for line in body.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        match key.as_str() {
            "user-agent" => {
                // Consecutive user-agent lines accumulate into one group.
                if !in_agent_run {
                    group_agents.clear();
                }
                group_agents.push(value.to_ascii_lowercase());
                in_agent_run = true;
            }
            "crawl-delay" => {
                in_agent_run = false;
                let Ok(delay) = value.parse::<f64>() else {
                    continue;
                };
                if group_agents.iter().any(|a| a == "*") {
                    wildcard_delay.get_or_insert(delay);
                }
                if group_agents
                    .iter()
                    .any(|a| a != "*" && !a.is_empty() && ua.contains(a.as_str()))
                {
                    agent_delay.get_or_insert(delay);
                }
            }
            _ => {
                in_agent_run = false;
            }
        }
    }

    agent_delay.or(wildcard_delay).filter(|d| *d > 0.0)
}

/// Collect `Sitemap:` directives; they are global, not group-scoped.
fn parse_sitemaps(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| {
            let line = line.split('#').next().unwrap_or_default().trim();
            let (key, value) = line.split_once(':')?;
            if !key.trim().eq_ignore_ascii_case("sitemap") {
                return None;
            }
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        })
        .collect()
}
