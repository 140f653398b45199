/// file: src/capture.rs
/// description: Browser lifecycle and single-page capture — navigation,
/// settle, animation/lazy-load reveal, human-like scroll, and the passive
/// response sniffer that collects every non-HTML response as a candidate
/// asset.
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    MediaFeature, SetDeviceMetricsOverrideParams, SetEmulatedMediaParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, EnableParams, EventResponseReceived, GetResponseBodyParams, Headers,
    SetExtraHttpHeadersParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::PrintToPdfParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::ScreenshotParams;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::config::{CaptureJob, Viewport, WaitStrategy};
use crate::extract::extract_links;
use crate::filter::{Filter, builtin_exclude_reason, mime_primary};
use crate::models::{EngineError, PageCaptureResult, Resource};

// ---------------------------------------------------------------------------
// Browser lifecycle
// ---------------------------------------------------------------------------

/// Owns the launched browser and its CDP event pump for the run. The
/// browser is shared with worker tasks; `close` requires every clone to
/// be dropped first.
pub struct BrowserHandle {
    browser: Arc<Browser>,
    handler_task: JoinHandle<()>,
}

impl BrowserHandle {
    pub async fn launch(job: &CaptureJob) -> Result<Self, EngineError> {
        let (viewport, user_agent, _) = job.effective_emulation();

        let mut builder = BrowserConfig::builder()
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .window_size(viewport.width, viewport.height);

        if let Some(ua) = &user_agent {
            builder = builder.arg(format!("--user-agent={ua}"));
        }
        if let Some(proxy) = &job.browser.proxy {
            builder = builder.arg(format!("--proxy-server={proxy}"));
        }

        let config = builder
            .build()
            .map_err(|e| EngineError::Browser(format!("browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| EngineError::Browser(format!("browser launch failed: {e}")))?;

        let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });

        Ok(Self {
            browser: Arc::new(browser),
            handler_task,
        })
    }

    pub fn browser(&self) -> Arc<Browser> {
        Arc::clone(&self.browser)
    }

    pub async fn close(self) {
        match Arc::try_unwrap(self.browser) {
            Ok(mut browser) => {
                if let Err(e) = browser.close().await {
                    warn!(error = %e, "browser close error");
                }
            }
            Err(_) => warn!("browser still shared at shutdown; leaving process to exit"),
        }
        self.handler_task.abort();
    }
}

// ---------------------------------------------------------------------------
// Response sniffer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SnifferState {
    resources: HashMap<String, Resource>,
    main_status: Option<u16>,
    last_activity: Option<Instant>,
}

fn headers_to_map(headers: &Headers) -> HashMap<String, String> {
    let Ok(value) = serde_json::to_value(headers) else {
        return HashMap::new();
    };
    match value.as_object() {
        Some(obj) => obj
            .iter()
            .map(|(k, v)| {
                let v = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                (k.to_ascii_lowercase(), v)
            })
            .collect(),
        None => HashMap::new(),
    }
}

// ---------------------------------------------------------------------------
// PageCapturer
// ---------------------------------------------------------------------------

/// Captures one URL per call on a fresh tab of a shared browser.
pub struct PageCapturer {
    job: CaptureJob,
    filter: Arc<Filter>,
    viewport: Viewport,
    user_agent: Option<String>,
    mobile: bool,
}

impl PageCapturer {
    pub fn new(job: CaptureJob, filter: Arc<Filter>) -> Self {
        let (viewport, user_agent, mobile) = job.effective_emulation();
        Self {
            job,
            filter,
            viewport,
            user_agent,
            mobile,
        }
    }

    /// Drive one full capture. The tab is always closed before returning.
    pub async fn capture(
        &self,
        browser: &Browser,
        url: &str,
    ) -> Result<PageCaptureResult, EngineError> {
        let started = Instant::now();
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| EngineError::Browser(format!("failed to open tab: {e}")))?;

        let state = Arc::new(StdMutex::new(SnifferState::default()));
        let sniffer = self.attach_sniffer(&page, Arc::clone(&state)).await;

        let outcome = self.drive(&page, url, &state, started).await;

        if let Some(task) = sniffer {
            task.abort();
        }
        if let Err(e) = page.close().await {
            debug!(url, error = %e, "tab close error");
        }

        outcome
    }

    /// Subscribe to every response the tab produces. Filtering happens
    /// inline so rejected bodies are never buffered.
    async fn attach_sniffer(
        &self,
        page: &Page,
        state: Arc<StdMutex<SnifferState>>,
    ) -> Option<JoinHandle<()>> {
        if let Err(e) = page.execute(EnableParams::default()).await {
            warn!(error = %e, "network domain enable failed; capturing without sniffer");
            return None;
        }
        let mut events = match page.event_listener::<EventResponseReceived>().await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "response listener unavailable; capturing without sniffer");
                return None;
            }
        };

        let page = page.clone();
        let filter = Arc::clone(&self.filter);

        Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let response = &event.response;
                let url = response.url.clone();
                let status = response.status as u16;
                let mime = mime_primary(&response.mime_type);
                let is_html = mime.contains("text/html");

                {
                    let Ok(mut s) = state.lock() else { continue };
                    s.last_activity = Some(Instant::now());
                    // First HTML response is the navigation document, even
                    // through redirects.
                    if is_html && s.main_status.is_none() && !url.starts_with("data:") {
                        s.main_status = Some(status);
                    }
                }

                if !(200..400).contains(&status) || is_html || url.starts_with("data:") {
                    continue;
                }
                if let Some(reason) = builtin_exclude_reason(&url) {
                    debug!(url, reason, "resource omitted by exclude table");
                    continue;
                }

                let body = match page
                    .execute(GetResponseBodyParams::new(event.request_id.clone()))
                    .await
                {
                    Ok(resp) => {
                        if resp.result.base64_encoded {
                            BASE64.decode(resp.result.body.as_bytes()).ok()
                        } else {
                            Some(resp.result.body.clone().into_bytes())
                        }
                    }
                    Err(e) => {
                        debug!(url, error = %e, "response body unreadable; dropped");
                        None
                    }
                };
                let Some(bytes) = body else { continue };

                let size = bytes.len() as u64;
                if !filter.should_save(&url, &mime, size) {
                    debug!(url, mime, size, "resource rejected by filter");
                    continue;
                }

                let headers = headers_to_map(&response.headers);
                let Ok(mut s) = state.lock() else { continue };
                s.resources.insert(
                    url.clone(),
                    Resource {
                        url,
                        status,
                        mime,
                        size,
                        bytes,
                        headers,
                    },
                );
            }
        }))
    }

    async fn drive(
        &self,
        page: &Page,
        url: &str,
        state: &Arc<StdMutex<SnifferState>>,
        started: Instant,
    ) -> Result<PageCaptureResult, EngineError> {
        let wait = &self.job.wait;
        let nav_timeout = Duration::from_millis(wait.timeout_ms);

        self.prepare_tab(page).await;

        // Navigate. A failed navigation is tolerated when the tab still
        // landed on an HTTP URL (partial capture).
        let nav_error = match tokio::time::timeout(nav_timeout, page.goto(url)).await {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("navigation timed out after {}ms", wait.timeout_ms)),
        };
        if let Some(reason) = nav_error {
            let current = current_url(page).await.unwrap_or_default();
            if current.starts_with("http://") || current.starts_with("https://") {
                warn!(url, reason, "navigation error tolerated; capturing partial page");
            } else {
                return Err(EngineError::Navigation {
                    url: url.to_string(),
                    reason,
                });
            }
        }

        match wait.strategy {
            WaitStrategy::DomContentLoaded => {}
            WaitStrategy::Load | WaitStrategy::NetworkIdle => {
                let _ =
                    tokio::time::timeout(Duration::from_secs(10), page.wait_for_navigation()).await;
            }
        }
        if wait.strategy == WaitStrategy::NetworkIdle {
            wait_network_idle(state, Duration::from_secs(5)).await;
        }

        // Post-load settle.
        tokio::time::sleep(Duration::from_millis(wait.wait_time_ms)).await;

        // Reveal, scroll for lazy loads, reveal what the scroll surfaced.
        eval(page, REVEAL_SCRIPT).await;
        eval(page, &scroll_script(wait.scroll_step)).await;
        eval(page, REVEAL_SCRIPT).await;

        // Let stragglers land, then force the last holdouts visible.
        wait_network_idle(state, Duration::from_secs(5)).await;
        eval(page, FINAL_REVEAL_SCRIPT).await;

        let html = tokio::time::timeout(nav_timeout, page.content())
            .await
            .map_err(|_| EngineError::Timeout)?
            .map_err(|e| EngineError::Browser(format!("failed to read content: {e}")))?;
        let title = page.get_title().await.ok().flatten();
        let final_url = current_url(page).await.unwrap_or_else(|| url.to_string());

        let base = Url::parse(&final_url).or_else(|_| Url::parse(url))?;
        let links = extract_links(&html, &base);

        let screenshot = if self.job.artifacts.screenshot {
            match page
                .screenshot(ScreenshotParams::builder().full_page(true).build())
                .await
            {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(url, error = %e, "screenshot failed");
                    None
                }
            }
        } else {
            None
        };

        let pdf = if self.job.artifacts.pdf {
            match page.pdf(PrintToPdfParams::default()).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(url, error = %e, "pdf render failed");
                    None
                }
            }
        } else {
            None
        };

        let (resources, status) = {
            let Ok(mut s) = state.lock() else {
                return Err(EngineError::Browser("sniffer state poisoned".into()));
            };
            (std::mem::take(&mut s.resources), s.main_status)
        };

        Ok(PageCaptureResult {
            requested_url: url.to_string(),
            final_url,
            html,
            title,
            status,
            links,
            resources,
            screenshot,
            pdf,
            duration: started.elapsed(),
        })
    }

    /// Emulation and request plumbing applied before navigation; every
    /// step is best-effort.
    async fn prepare_tab(&self, page: &Page) {
        if let Some(ua) = &self.user_agent
            && let Err(e) = page
                .execute(SetUserAgentOverrideParams::new(ua.clone()))
                .await
        {
            debug!(error = %e, "user-agent override failed");
        }

        match SetDeviceMetricsOverrideParams::builder()
            .width(i64::from(self.viewport.width))
            .height(i64::from(self.viewport.height))
            .device_scale_factor(1.0)
            .mobile(self.mobile)
            .build()
        {
            Ok(params) => {
                if let Err(e) = page.execute(params).await {
                    debug!(error = %e, "device metrics override failed");
                }
            }
            Err(e) => debug!(error = %e, "device metrics params invalid"),
        }

        // Collapse CSS animations to their end states before any paint.
        let reduced_motion = SetEmulatedMediaParams::builder()
            .features(vec![MediaFeature {
                name: "prefers-reduced-motion".to_string(),
                value: "reduce".to_string(),
            }])
            .build();
        if let Err(e) = page.execute(reduced_motion).await {
            debug!(error = %e, "reduced-motion emulation failed");
        }

        if !self.job.browser.headers.is_empty() {
            let headers = Headers::new(serde_json::json!(self.job.browser.headers));
            if let Err(e) = page.execute(SetExtraHttpHeadersParams::new(headers)).await {
                debug!(error = %e, "extra headers failed");
            }
        }

        if let Some(path) = &self.job.browser.cookies_file {
            if let Err(e) = install_cookies(page, path).await {
                warn!(path = %path.display(), error = %e, "cookie file not applied");
            }
        }
    }
}

async fn current_url(page: &Page) -> Option<String> {
    page.url().await.ok().flatten().map(|u| u.to_string())
}

/// Run an in-page script, awaiting its promise; failures are logged and
/// swallowed (a page that rejects a reveal script is still capturable).
async fn eval(page: &Page, script: &str) {
    let params = EvaluateParams::builder()
        .expression(script)
        .await_promise(true)
        .return_by_value(true)
        .build();
    match params {
        Ok(params) => {
            if let Err(e) = page.evaluate(params).await {
                debug!(error = %e, "in-page script failed");
            }
        }
        Err(e) => debug!(error = %e, "in-page script params invalid"),
    }
}

/// Idle means no sniffed response for 500 ms; bounded by `max`.
async fn wait_network_idle(state: &Arc<StdMutex<SnifferState>>, max: Duration) {
    let quiet = Duration::from_millis(500);
    let deadline = Instant::now() + max;
    loop {
        let last = state.lock().ok().and_then(|s| s.last_activity);
        let idle = last.map(|t| t.elapsed() >= quiet).unwrap_or(true);
        if idle || Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ---------------------------------------------------------------------------
// Cookies
// ---------------------------------------------------------------------------

/// Load a JSON cookie file (array of objects with name/value/domain, the
/// format browser exporters produce) into the tab.
async fn install_cookies(page: &Page, path: &Path) -> Result<(), EngineError> {
    let body = tokio::fs::read_to_string(path).await?;
    let entries: Vec<serde_json::Value> = serde_json::from_str(&body)?;

    for params in parse_cookie_entries(&entries) {
        if let Err(e) = page.set_cookie(params).await {
            warn!(error = %e, "cookie rejected by browser");
        }
    }
    Ok(())
}

fn parse_cookie_entries(entries: &[serde_json::Value]) -> Vec<CookieParam> {
    entries
        .iter()
        .filter_map(|cookie| {
            let name = cookie
                .get("name")
                .or_else(|| cookie.get("key"))
                .and_then(|v| v.as_str())?;
            let value = cookie.get("value").and_then(|v| v.as_str())?;
            let domain = cookie.get("domain").and_then(|v| v.as_str())?;
            if name.is_empty() || domain.is_empty() {
                return None;
            }
            let mut builder = CookieParam::builder()
                .name(name)
                .value(value)
                .domain(domain);
            if let Some(path) = cookie.get("path").and_then(|v| v.as_str()) {
                builder = builder.path(path);
            }
            builder.build().ok()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// In-page scripts
// ---------------------------------------------------------------------------

/// Force animated and lazy-loaded content to its final visible state.
/// Runs inside the browser; every framework probe is fenced so one broken
/// page script cannot abort the pass.
const REVEAL_SCRIPT: &str = r#"
(() => {
  const reveal = (el) => {
    el.style.setProperty('opacity', '1', 'important');
    el.style.setProperty('visibility', 'visible', 'important');
  };

  // Timeline libraries: jump to 100%.
  try { if (window.gsap && gsap.globalTimeline) gsap.globalTimeline.progress(1); } catch (e) {}
  try {
    if (window.ScrollTrigger) {
      ScrollTrigger.getAll().forEach(t => {
        try { if (t.animation) t.animation.progress(1); } catch (e) {}
      });
    }
  } catch (e) {}
  try {
    if (window.anime && anime.running) {
      anime.running.forEach(a => { try { a.seek(a.duration); } catch (e) {} });
    }
  } catch (e) {}

  // Web Animations API.
  try {
    document.getAnimations().forEach(a => { try { a.finish(); } catch (e) {} });
  } catch (e) {}

  // Scroll-reveal framework markers.
  document.querySelectorAll('[data-aos]').forEach(el => el.classList.add('aos-animate'));
  document.querySelectorAll('.wow').forEach(el => { el.classList.add('animated'); reveal(el); });
  document.querySelectorAll('[data-sr-id]').forEach(reveal);

  // Elements that look like animation start states.
  document.querySelectorAll('[class*="animate"], [class*="fade"], [class*="slide"], [class*="reveal"]').forEach(el => {
    const cs = getComputedStyle(el);
    if (parseFloat(cs.opacity) === 0 || cs.visibility === 'hidden') reveal(el);
  });

  // Materialize lazy images, iframes, and backgrounds.
  document.querySelectorAll('img[data-src]').forEach(img => {
    if (!img.src || img.src.startsWith('data:')) img.src = img.getAttribute('data-src');
  });
  document.querySelectorAll('img[data-srcset]').forEach(img => {
    if (!img.srcset) img.srcset = img.getAttribute('data-srcset');
  });
  document.querySelectorAll('iframe[data-src]').forEach(f => {
    if (!f.src) f.src = f.getAttribute('data-src');
  });
  document.querySelectorAll('[data-bg], [data-background]').forEach(el => {
    const bg = el.getAttribute('data-bg') || el.getAttribute('data-background');
    if (bg && !el.style.backgroundImage) el.style.backgroundImage = 'url("' + bg + '")';
  });

  // Lottie: last frame.
  document.querySelectorAll('lottie-player').forEach(p => {
    try { if (p.seek) p.seek('100%'); if (p.pause) p.pause(); } catch (e) {}
  });
  try {
    if (window.lottie && lottie.getRegisteredAnimations) {
      lottie.getRegisteredAnimations().forEach(a => {
        try { a.goToAndStop(a.totalFrames - 1, true); } catch (e) {}
      });
    }
  } catch (e) {}

  return true;
})()
"#;

/// Scroll to the bottom in eased steps with pauses at viewport
/// boundaries, wait for lazy additions, re-check the height, then return
/// to the top. The `__SCROLL_STEP__` token is substituted at call time.
const SCROLL_SCRIPT_TEMPLATE: &str = r#"
(async () => {
  const step = __SCROLL_STEP__;
  const pause = (ms) => new Promise(r => setTimeout(r, ms));
  const fullHeight = () => Math.max(
    document.body ? document.body.scrollHeight : 0,
    document.documentElement ? document.documentElement.scrollHeight : 0
  );
  const viewport = window.innerHeight || 800;

  let position = 0;
  let passes = 0;
  while (passes < 500) {
    const height = fullHeight();
    if (position >= height) break;
    position = Math.min(position + step, height);
    window.scrollTo({ top: position, behavior: 'auto' });
    // Ease: rest longer when a viewport boundary is crossed so lazy
    // observers have a frame to fire.
    await pause(position % viewport < step ? 180 : 60);
    passes += 1;
  }

  await pause(400);
  const grown = fullHeight();
  if (grown > position) {
    window.scrollTo(0, grown);
    await pause(400);
  }
  window.scrollTo(0, 0);
  await pause(150);
  return true;
})()
"#;

fn scroll_script(step: u32) -> String {
    SCROLL_SCRIPT_TEMPLATE.replace("__SCROLL_STEP__", &step.max(1).to_string())
}

/// Last-resort pass: clear leftover hidden states on elements whose class
/// smells like an animation hook, and kill all remaining CSS animations.
const FINAL_REVEAL_SCRIPT: &str = r#"
(() => {
  const pattern = /anim|fade|slide|reveal|show/i;
  document.querySelectorAll('*').forEach(el => {
    const cls = typeof el.className === 'string'
      ? el.className
      : (el.className && el.className.baseVal) || '';
    if (!pattern.test(cls)) return;
    const cs = getComputedStyle(el);
    if (parseFloat(cs.opacity) === 0) el.style.setProperty('opacity', '1', 'important');
    if (cs.visibility === 'hidden') el.style.setProperty('visibility', 'visible', 'important');
    if (cs.transform && cs.transform !== 'none') el.style.setProperty('transform', 'none', 'important');
  });

  const style = document.createElement('style');
  style.textContent = '*, *::before, *::after { animation: none !important; transition: none !important; }';
  if (document.head) document.head.appendChild(style);
  return true;
})()
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scroll_script_substitutes_the_step() {
        let script = scroll_script(300);
        assert!(script.contains("const step = 300;"));
        assert!(!script.contains("__SCROLL_STEP__"));
        // A zero step would loop forever; it is clamped.
        assert!(scroll_script(0).contains("const step = 1;"));
    }

    #[test]
    fn cookie_entries_require_name_value_domain() {
        let entries = vec![
            serde_json::json!({"name": "sid", "value": "abc", "domain": ".example.com", "path": "/"}),
            serde_json::json!({"key": "alt", "value": "x", "domain": "example.com"}),
            serde_json::json!({"name": "", "value": "x", "domain": "example.com"}),
            serde_json::json!({"name": "orphan", "value": "x"}),
        ];
        let cookies = parse_cookie_entries(&entries);
        assert_eq!(cookies.len(), 2);
    }

    #[test]
    fn reveal_scripts_are_self_contained_expressions() {
        for script in [REVEAL_SCRIPT, FINAL_REVEAL_SCRIPT] {
            let trimmed = script.trim();
            assert!(trimmed.starts_with("(() => {"));
            assert!(trimmed.ends_with("})()"));
        }
        assert!(scroll_script(300).trim().starts_with("(async () => {"));
    }
}
