/// file: src/crawler.rs
/// description: Crawl orchestrator — bounded worker pool over a shared
/// FIFO queue with an at-most-once visited set, scope/filter/robots gates,
/// stop conditions, and incremental manifest persistence.
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chromiumoxide::browser::Browser;
use chrono::Utc;
use sitemap::reader::{SiteMapEntity, SiteMapReader};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::capture::{BrowserHandle, PageCapturer};
use crate::config::{CaptureJob, RunMode};
use crate::filter::Filter;
use crate::manifest::{
    AssetRecord, CacheFile, HarEntryMeta, Manifest, PageRecord, RunLog, RunStats, SMIPPO_DIR,
};
use crate::models::{CrawlObserver, EngineError, NullObserver, QueueItem};
use crate::robots::RobotsGate;
use crate::rewrite::{rewrite_css, rewrite_html};
use crate::saver::{self, ResourceSaver};
use crate::urlpath::normalize;

const DEFAULT_USER_AGENT: &str = concat!("smippo/", env!("CARGO_PKG_VERSION"));
const SITEMAP_SEED_LIMIT: usize = 500;

// ---------------------------------------------------------------------------
// Stop handle
// ---------------------------------------------------------------------------

/// Cloneable handle for cooperative drain: queued items are discarded,
/// in-flight captures finish, the manifest is flushed. The CLI wires
/// SIGINT to this.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn request_drain(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Shared crawl state
// ---------------------------------------------------------------------------

/// Everything workers mutate, behind one coarse lock. Critical sections
/// are hash lookups and vec pushes; no I/O happens while it is held.
struct CrawlState {
    queue: VecDeque<QueueItem>,
    visited: HashSet<String>,
    saver: ResourceSaver,
    manifest: Manifest,
    cache: CacheFile,
    har: Vec<HarEntryMeta>,
    prior_assets: HashMap<String, AssetRecord>,
    in_flight: usize,
    stopped: bool,
}

enum Claim {
    Claimed,
    AlreadyVisited,
    LimitReached,
}

impl CrawlState {
    /// Check-and-insert under the lock: the claim is what makes capture
    /// at-most-once per normalized URL.
    fn claim(&mut self, url: &str, max_pages: Option<usize>, over_time: bool) -> Claim {
        if self.visited.contains(url) {
            return Claim::AlreadyVisited;
        }
        let page_limit = max_pages.map(|max| self.visited.len() >= max).unwrap_or(false);
        if page_limit || over_time {
            self.stopped = true;
            return Claim::LimitReached;
        }
        self.visited.insert(url.to_string());
        Claim::Claimed
    }
}

// ---------------------------------------------------------------------------
// Crawler
// ---------------------------------------------------------------------------

pub struct Crawler {
    inner: Arc<Inner>,
}

struct Inner {
    job: CaptureJob,
    root: Url,
    filter: Arc<Filter>,
    robots: RobotsGate,
    capturer: PageCapturer,
    observer: Arc<dyn CrawlObserver>,
    state: Mutex<CrawlState>,
    log: RunLog,
    stop: Arc<AtomicBool>,
    http: reqwest::Client,
    started: Instant,
}

impl Crawler {
    pub fn new(job: CaptureJob) -> Result<Self, EngineError> {
        Self::with_observer(job, Arc::new(NullObserver))
    }

    pub fn with_observer(
        job: CaptureJob,
        observer: Arc<dyn CrawlObserver>,
    ) -> Result<Self, EngineError> {
        let root = job.validate()?;
        std::fs::create_dir_all(job.output.join(SMIPPO_DIR))
            .map_err(|e| EngineError::Config(format!("output dir not writable: {e}")))?;

        let user_agent = job
            .browser
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        let mut builder = reqwest::Client::builder()
            .user_agent(user_agent.clone())
            .timeout(Duration::from_secs(30));
        if let Some(proxy) = &job.browser.proxy {
            builder = builder
                .proxy(reqwest::Proxy::all(proxy).map_err(|e| {
                    EngineError::Config(format!("invalid proxy `{proxy}`: {e}"))
                })?);
        }
        let http = builder.build()?;

        let filter = Arc::new(Filter::new(root.clone(), &job.scope, &job.filters)?);
        let robots = RobotsGate::new(!job.ignore_robots, user_agent, http.clone());
        let capturer = PageCapturer::new(job.clone(), Arc::clone(&filter));
        let log = RunLog::open(&job.output)?;
        let saver = ResourceSaver::new(job.output.clone(), job.layout);

        let state = CrawlState {
            queue: VecDeque::new(),
            visited: HashSet::new(),
            saver,
            manifest: Manifest::new(&job),
            cache: CacheFile::default(),
            har: Vec::new(),
            prior_assets: HashMap::new(),
            in_flight: 0,
            stopped: false,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                job,
                root,
                filter,
                robots,
                capturer,
                observer,
                state: Mutex::new(state),
                log,
                stop: Arc::new(AtomicBool::new(false)),
                http,
                started: Instant::now(),
            }),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: Arc::clone(&self.inner.stop),
        }
    }

    /// Run the crawl to drain and return the final stats.
    pub async fn run(self) -> Result<RunStats, EngineError> {
        let inner = self.inner;

        inner.load_prior_run().await?;

        let browser = BrowserHandle::launch(&inner.job).await?;
        inner.seed_queue().await;

        info!(
            root = %inner.root,
            depth = inner.job.depth,
            concurrency = inner.job.limits.concurrency,
            "crawl started"
        );

        let mut workers: JoinSet<()> = JoinSet::new();
        for id in 0..inner.job.limits.concurrency {
            let inner = Arc::clone(&inner);
            let browser = browser.browser();
            workers.spawn(async move { worker_loop(id, inner, browser).await });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "worker task panicked");
            }
        }

        let stats = inner.finish().await?;
        browser.close().await;

        info!(
            pages = stats.pages_capt,
            assets = stats.assets_capt,
            errors = stats.errors,
            duration_ms = stats.duration,
            "crawl complete"
        );
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

async fn worker_loop(id: usize, inner: Arc<Inner>, browser: Arc<Browser>) {
    debug!(worker_id = id, "worker started");
    loop {
        let item = {
            let mut st = inner.state.lock().await;
            if st.stopped || inner.stop.load(Ordering::SeqCst) {
                // Cooperative drain: discard the queue without capture.
                st.queue.clear();
            }
            match st.queue.pop_front() {
                Some(item) => {
                    st.in_flight += 1;
                    Some(item)
                }
                None if st.in_flight == 0 => break,
                None => None,
            }
        };

        match item {
            Some(item) => {
                inner.process_item(&browser, item).await;
                let mut st = inner.state.lock().await;
                st.in_flight -= 1;
            }
            None => tokio::time::sleep(Duration::from_millis(200)).await,
        }
    }
    debug!(worker_id = id, "worker drained");
}

// ---------------------------------------------------------------------------
// Per-item processing
// ---------------------------------------------------------------------------

impl Inner {
    /// Restore resumable state from a prior manifest and cache.
    async fn load_prior_run(&self) -> Result<(), EngineError> {
        let prior = Manifest::load(&self.job.output).await?;
        let cache = CacheFile::load(&self.job.output).await?;

        let mut st = self.state.lock().await;
        st.cache = cache;

        let Some(prior) = prior else { return Ok(()) };

        match self.job.mode {
            RunMode::Mirror => {
                // Resume: captured pages are not re-captured; their saved
                // artifacts stay addressable for the rewriter.
                for page in &prior.pages {
                    st.visited.insert(normalize(&page.url));
                    st.saver.restore(&page.url, &page.local_path);
                }
                for asset in &prior.assets {
                    st.saver.restore(&asset.url, &asset.local_path);
                }
                info!(
                    pages = prior.pages.len(),
                    assets = prior.assets.len(),
                    "resuming from existing manifest"
                );
                st.manifest = prior;
            }
            RunMode::Update => {
                // Re-capture everything; prior assets are revalidation
                // candidates.
                for asset in &prior.assets {
                    st.prior_assets
                        .insert(normalize(&asset.url), asset.clone());
                }
                info!(
                    candidates = st.prior_assets.len(),
                    "update run; prior assets eligible for 304 reuse"
                );
            }
        }
        Ok(())
    }

    /// Enqueue the root and, opportunistically, sitemap URLs from the root
    /// origin's robots.txt.
    async fn seed_queue(&self) {
        let root_url = normalize(self.root.as_str());
        {
            let mut st = self.state.lock().await;
            st.queue.push_back(QueueItem {
                url: root_url,
                remaining_depth: self.job.depth,
            });
        }

        if self.job.ignore_robots || self.job.depth == 0 {
            return;
        }
        let sitemaps = self.robots.sitemaps(&self.root).await;
        if sitemaps.is_empty() {
            return;
        }

        let limit = self
            .job
            .limits
            .max_pages
            .unwrap_or(SITEMAP_SEED_LIMIT)
            .min(SITEMAP_SEED_LIMIT);
        let mut collected = Vec::new();
        let mut seen = HashSet::new();
        for sitemap_url in sitemaps {
            if collected.len() >= limit {
                break;
            }
            collect_sitemap_urls(&self.http, &sitemap_url, limit, &mut collected, &mut seen)
                .await;
        }

        let mut st = self.state.lock().await;
        let mut seeded = 0usize;
        for url in collected {
            let url = normalize(&url);
            if !self.filter.should_follow(&url) || st.visited.contains(&url) {
                continue;
            }
            if st.queue.iter().any(|q| q.url == url) {
                continue;
            }
            st.queue.push_back(QueueItem {
                url,
                remaining_depth: self.job.depth.saturating_sub(1),
            });
            seeded += 1;
        }
        if seeded > 0 {
            info!(seeded, "sitemap URLs enqueued");
        }
    }

    fn over_time(&self) -> bool {
        self.job
            .limits
            .max_time_ms
            .map(|max| self.started.elapsed() >= Duration::from_millis(max))
            .unwrap_or(false)
    }

    /// One queue item, end to end. Never propagates an error: everything
    /// is contained, counted, and logged.
    async fn process_item(&self, browser: &Browser, item: QueueItem) {
        let url_string = normalize(&item.url);
        let Ok(url) = Url::parse(&url_string) else {
            debug!(url = %item.url, "unparseable after canonicalization; skipped");
            return;
        };

        // Gate 1: at-most-once + global stop conditions, under the lock.
        {
            let mut st = self.state.lock().await;
            match st.claim(&url_string, self.job.limits.max_pages, self.over_time()) {
                Claim::Claimed => {}
                Claim::AlreadyVisited => return,
                Claim::LimitReached => {
                    debug!(url = %url_string, "stop condition tripped; draining");
                    return;
                }
            }
        }

        // Gate 2: filter.
        if !self.filter.should_follow(&url_string) {
            debug!(url = %url_string, "skipped by filter");
            self.log.line("skip", &format!("{url_string} (filter)"));
            return;
        }

        // Gate 3: robots.
        if !self.robots.is_allowed(&url).await {
            debug!(url = %url_string, "skipped by robots.txt");
            self.log.line("skip", &format!("{url_string} (robots)"));
            return;
        }

        // Politeness: fixed rate limit plus the origin's crawl delay.
        if self.job.limits.rate_limit_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.job.limits.rate_limit_ms)).await;
        }
        let delay = self.robots.crawl_delay(&url).await;
        if delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }

        self.observer.on_page_start(&url_string);

        // Worker-level backstop over the capture's own navigation timeout.
        let backstop = Duration::from_millis(self.job.wait.timeout_ms * 2 + 30_000);
        let result = match tokio::time::timeout(
            backstop,
            self.capturer.capture(browser, &url_string),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                self.record_error(&url_string, &e).await;
                return;
            }
            Err(_) => {
                self.record_error(&url_string, &EngineError::Timeout).await;
                return;
            }
        };

        let mut css_saved: Vec<(Url, String)> = Vec::new();
        for (resource_url, resource) in &result.resources {
            if !self
                .filter
                .should_save(resource_url, &resource.mime, resource.size)
            {
                continue;
            }
            if let Some(saved) = self.save_resource(resource_url, resource).await {
                if resource.mime == "text/css" || saved.ends_with(".css") {
                    if let Ok(parsed) = Url::parse(resource_url) {
                        css_saved.push((parsed, saved));
                    }
                }
            }
        }

        // CSS rewrite happens after this page's resources are saved and
        // before its HTML is written, so the map is a superset of what the
        // page references.
        let map_snapshot = {
            let st = self.state.lock().await;
            st.saver.url_map().clone()
        };
        for (css_url, css_path) in &css_saved {
            match saver::read_file(&self.job.output, css_path).await {
                Ok(body) => {
                    let (rewritten, changed) =
                        rewrite_css(&body, css_url, css_path, &map_snapshot);
                    if changed
                        && let Err(e) =
                            saver::write_file(&self.job.output, css_path, rewritten.as_bytes())
                                .await
                    {
                        debug!(path = css_path, error = %e, "css rewrite-back failed");
                    }
                }
                Err(e) => debug!(path = css_path, error = %e, "saved css unreadable"),
            }
        }

        self.save_page(&url_string, &item, result, map_snapshot).await;
    }

    /// Save one sniffed resource; returns its relative path when written
    /// (or reused via revalidation).
    async fn save_resource(&self, resource_url: &str, resource: &crate::models::Resource) -> Option<String> {
        let parsed = Url::parse(resource_url).ok()?;
        let canonical = normalize(resource_url);

        // Snapshot decision state under the lock, without I/O.
        let (already, prior, etag, last_modified) = {
            let st = self.state.lock().await;
            let already = st.saver.saved_path(resource_url);
            let prior = st.prior_assets.get(&canonical).cloned();
            let (etag, lm) = st.cache.validators(&canonical);
            (
                already,
                prior,
                etag.map(str::to_string),
                lm.map(str::to_string),
            )
        };
        if let Some(path) = already {
            return Some(path);
        }

        // Update mode: a prior artifact plus validators is a revalidation
        // candidate; HTTP 304 reuses the file already on disk.
        if self.job.mode == RunMode::Update
            && let Some(prior_record) = &prior
            && (etag.is_some() || last_modified.is_some())
            && self
                .revalidate(resource_url, etag.as_deref(), last_modified.as_deref())
                .await
        {
            let mut st = self.state.lock().await;
            st.saver.restore(resource_url, &prior_record.local_path);
            st.manifest.record_asset(prior_record.clone());
            debug!(url = resource_url, "not modified; prior artifact reused");
            return Some(prior_record.local_path.clone());
        }

        let relative = {
            let mut st = self.state.lock().await;
            let relative = st.saver.reserve_asset(&parsed, &resource.mime);
            if self.job.use_cache || self.job.mode == RunMode::Update {
                st.cache.record(
                    &canonical,
                    resource.headers.get("etag").map(String::as_str),
                    resource.headers.get("last-modified").map(String::as_str),
                    resource.headers.get("content-type").map(String::as_str),
                );
            }
            relative
        };

        match saver::write_file(&self.job.output, &relative, &resource.bytes).await {
            Ok(()) => {
                let mut st = self.state.lock().await;
                st.manifest.record_asset(AssetRecord {
                    url: resource_url.to_string(),
                    local_path: relative.clone(),
                    mime_type: resource.mime.clone(),
                    size: resource.size,
                });
                st.har.push(HarEntryMeta {
                    url: resource_url.to_string(),
                    status: resource.status,
                    mime: resource.mime.clone(),
                    size: resource.size,
                    started: Utc::now().to_rfc3339(),
                });
                drop(st);
                self.observer.on_asset_save(resource_url, resource.size);
                self.log
                    .line("asset", &format!("{resource_url} -> {relative}"));
                Some(relative)
            }
            Err(e) => {
                // One failed asset never fails the page.
                debug!(url = resource_url, error = %e, "asset write failed");
                let mut st = self.state.lock().await;
                st.saver.forget(resource_url);
                st.manifest.record_error();
                None
            }
        }
    }

    async fn save_page(
        &self,
        url_string: &str,
        item: &QueueItem,
        result: crate::models::PageCaptureResult,
        mut map_snapshot: crate::saver::UrlMap,
    ) {
        let final_canonical = normalize(&result.final_url);
        let Ok(final_url) = Url::parse(&final_canonical) else {
            self.record_error(
                url_string,
                &EngineError::Navigation {
                    url: url_string.to_string(),
                    reason: format!("final URL unparseable: {}", result.final_url),
                },
            )
            .await;
            return;
        };

        let page_path = {
            let mut st = self.state.lock().await;
            // A redirect target must not be captured twice through another
            // link.
            st.visited.insert(final_canonical.clone());
            let page_path = st.saver.reserve_page(&final_url);
            if final_canonical != *url_string {
                st.saver.restore(url_string, &page_path);
            }
            page_path
        };
        // The page's own entry participates in rewriting (self-links).
        map_snapshot.insert(url_string, page_path.clone());
        map_snapshot.insert(&final_canonical, page_path.clone());

        let html = match rewrite_html(
            &result.html,
            &final_url,
            &page_path,
            &map_snapshot,
            self.job.artifacts.strip_scripts,
        ) {
            Ok(html) => html,
            Err(e) => {
                warn!(url = url_string, error = %e, "rewrite failed; saving unrewritten HTML");
                self.log
                    .line("error", &format!("{url_string}: rewrite failed: {e}"));
                result.html.clone()
            }
        };

        if let Err(e) = saver::write_file(&self.job.output, &page_path, html.as_bytes()).await {
            self.record_error(url_string, &e.into()).await;
            return;
        }

        if let Some(bytes) = &result.screenshot {
            let path = ResourceSaver::sibling_path(&page_path, "png");
            if let Err(e) = saver::write_file(&self.job.output, &path, bytes).await {
                debug!(url = url_string, error = %e, "screenshot write failed");
            }
        }
        if let Some(bytes) = &result.pdf {
            let path = ResourceSaver::sibling_path(&page_path, "pdf");
            if let Err(e) = saver::write_file(&self.job.output, &path, bytes).await {
                debug!(url = url_string, error = %e, "pdf write failed");
            }
        }

        let status = result.status.unwrap_or(200);
        let size = html.len() as u64;
        let links_found = result.links.all.len();

        let manifest_snapshot = {
            let mut st = self.state.lock().await;
            st.manifest.record_page(PageRecord {
                url: url_string.to_string(),
                local_path: page_path.clone(),
                status,
                captured: Utc::now().to_rfc3339(),
                size,
                title: result.title.clone(),
            });
            st.har.push(HarEntryMeta {
                url: url_string.to_string(),
                status,
                mime: "text/html".to_string(),
                size,
                started: Utc::now().to_rfc3339(),
            });

            // Enqueue discovered pages one level down; workers re-check
            // visited on claim, so a duplicate enqueue is harmless.
            if item.remaining_depth > 0 && !st.stopped {
                for link in &result.links.pages {
                    let link = normalize(link);
                    if !self.filter.should_follow(&link) || st.visited.contains(&link) {
                        continue;
                    }
                    st.queue.push_back(QueueItem {
                        url: link,
                        remaining_depth: item.remaining_depth - 1,
                    });
                }
            }

            st.manifest.updated = Utc::now().to_rfc3339();
            st.manifest.clone()
        };

        // Incremental persistence: flushed after every page so interrupts
        // stay resumable. Serialization happens outside the lock.
        if let Err(e) = persist_manifest(&manifest_snapshot, &self.job).await {
            warn!(error = %e, "manifest flush failed");
        }

        self.observer.on_page_complete(url_string, size, links_found);
        self.log
            .line("page", &format!("{url_string} -> {page_path}"));
    }

    async fn record_error(&self, url: &str, error: &EngineError) {
        {
            let mut st = self.state.lock().await;
            st.manifest.record_error();
        }
        self.observer.on_error(url, error);
        self.log.line("error", &format!("{url}: {error}"));
        debug!(url, error = %error, "page capture failed");
    }

    /// Conditional GET; true means HTTP 304 and the prior artifact stands.
    async fn revalidate(&self, url: &str, etag: Option<&str>, last_modified: Option<&str>) -> bool {
        let mut request = self.http.get(url);
        if let Some(etag) = etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        if let Some(lm) = last_modified {
            request = request.header(reqwest::header::IF_MODIFIED_SINCE, lm);
        }
        match request.send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::NOT_MODIFIED,
            Err(e) => {
                debug!(url, error = %e, "revalidation request failed");
                false
            }
        }
    }

    /// Final flush: duration stamp, manifest, cache, optional HAR.
    async fn finish(&self) -> Result<RunStats, EngineError> {
        let (manifest_snapshot, cache_snapshot, har_entries) = {
            let mut st = self.state.lock().await;
            st.manifest.stats.duration = self.started.elapsed().as_millis() as u64;
            st.manifest.updated = Utc::now().to_rfc3339();
            (
                st.manifest.clone(),
                st.cache.clone(),
                std::mem::take(&mut st.har),
            )
        };

        persist_manifest(&manifest_snapshot, &self.job).await?;
        cache_snapshot.persist(&self.job.output).await?;
        if self.job.artifacts.har {
            crate::manifest::persist_har(&self.job.output, &har_entries).await?;
        }
        Ok(manifest_snapshot.stats)
    }
}

async fn persist_manifest(manifest: &Manifest, job: &CaptureJob) -> Result<(), EngineError> {
    manifest.write_to(&job.output).await
}

// ---------------------------------------------------------------------------
// Sitemap traversal
// ---------------------------------------------------------------------------

/// Depth-first sitemap walk with an index-recursion guard and a hard
/// limit on collected URLs.
async fn collect_sitemap_urls(
    client: &reqwest::Client,
    url: &str,
    limit: usize,
    collected: &mut Vec<String>,
    visited: &mut HashSet<String>,
) {
    if collected.len() >= limit || !visited.insert(url.to_string()) {
        return;
    }
    let body = match client.get(url).send().await {
        Ok(resp) if resp.status().is_success() => resp.text().await.unwrap_or_default(),
        _ => return,
    };

    let mut child_sitemaps = Vec::new();
    for entity in SiteMapReader::new(Cursor::new(body.into_bytes())) {
        if collected.len() >= limit {
            break;
        }
        match entity {
            SiteMapEntity::Url(entry) => {
                if let Some(loc) = entry.loc.get_url() {
                    collected.push(loc.to_string());
                }
            }
            SiteMapEntity::SiteMap(child) => {
                if let Some(loc) = child.loc.get_url() {
                    child_sitemaps.push(loc.to_string());
                }
            }
            SiteMapEntity::Err(_) => {}
        }
    }
    for child in child_sitemaps {
        if collected.len() >= limit {
            break;
        }
        Box::pin(collect_sitemap_urls(client, &child, limit, collected, visited)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Layout;

    fn empty_state() -> CrawlState {
        CrawlState {
            queue: VecDeque::new(),
            visited: HashSet::new(),
            saver: ResourceSaver::new("/tmp/ignored".into(), Layout::Original),
            manifest: Manifest::new(&CaptureJob::new("https://example.com/", "/tmp/ignored")),
            cache: CacheFile::default(),
            har: Vec::new(),
            prior_assets: HashMap::new(),
            in_flight: 0,
            stopped: false,
        }
    }

    #[test]
    fn claim_is_at_most_once() {
        let mut st = empty_state();
        assert!(matches!(
            st.claim("https://example.com/a", None, false),
            Claim::Claimed
        ));
        assert!(matches!(
            st.claim("https://example.com/a", None, false),
            Claim::AlreadyVisited
        ));
    }

    #[test]
    fn claim_enforces_max_pages_exactly() {
        let mut st = empty_state();
        for i in 0..5 {
            assert!(matches!(
                st.claim(&format!("https://example.com/{i}"), Some(5), false),
                Claim::Claimed
            ));
        }
        assert!(matches!(
            st.claim("https://example.com/overflow", Some(5), false),
            Claim::LimitReached
        ));
        assert!(st.stopped);
        assert_eq!(st.visited.len(), 5);
    }

    #[test]
    fn claim_trips_on_elapsed_time() {
        let mut st = empty_state();
        assert!(matches!(
            st.claim("https://example.com/a", None, true),
            Claim::LimitReached
        ));
        assert!(st.stopped);
    }

    #[test]
    fn stop_handle_requests_drain() {
        let dir = tempfile::tempdir().unwrap();
        let crawler = Crawler::new(CaptureJob::new("https://example.com/", dir.path())).unwrap();
        let handle = crawler.stop_handle();
        assert!(!handle.is_draining());
        handle.request_drain();
        assert!(handle.is_draining());
    }

    #[tokio::test]
    async fn sitemap_walk_follows_index_files_with_limit() {
        let mut server = mockito::Server::new_async().await;
        let index = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>{0}/child.xml</loc></sitemap>
</sitemapindex>"#,
            server.url()
        );
        let child = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>{0}/a</loc></url>
  <url><loc>{0}/b</loc></url>
  <url><loc>{0}/c</loc></url>
</urlset>"#,
            server.url()
        );
        server
            .mock("GET", "/sitemap.xml")
            .with_status(200)
            .with_body(index)
            .create_async()
            .await;
        server
            .mock("GET", "/child.xml")
            .with_status(200)
            .with_body(child)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let mut collected = Vec::new();
        let mut seen = HashSet::new();
        collect_sitemap_urls(
            &client,
            &format!("{}/sitemap.xml", server.url()),
            2,
            &mut collected,
            &mut seen,
        )
        .await;
        assert_eq!(collected.len(), 2);
        assert!(collected[0].ends_with("/a"));
    }
}
