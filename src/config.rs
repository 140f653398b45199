/// file: src/config.rs
/// description: Typed capture configuration with strict fail-fast validation.
/// Every option the engine accepts is enumerated here; the record is
/// immutable for the lifetime of a run and passed by value into every
/// component.
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::models::EngineError;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Which URLs may be crawled for pages, relative to the root URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Equal origin (scheme + host + port).
    Subdomain,
    /// Equal registrable domain.
    Domain,
    /// Equal last host label.
    Tld,
    /// No host restriction.
    All,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Subdomain => write!(f, "subdomain"),
            Scope::Domain => write!(f, "domain"),
            Scope::Tld => write!(f, "tld"),
            Scope::All => write!(f, "all"),
        }
    }
}

/// Navigation settle strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStrategy {
    NetworkIdle,
    Load,
    DomContentLoaded,
}

/// Output tree layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// `host_without_leading_www/` + path-derived filename.
    Original,
    /// `host/` + path-derived filename.
    Domain,
    /// Single directory of dash-joined names.
    Flat,
}

/// Run mode. `Mirror` resumes from an existing manifest by skipping pages
/// already captured; `Update` re-captures and revalidates assets with
/// conditional requests from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Mirror,
    Update,
}

// ---------------------------------------------------------------------------
// Option groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    pub scope: Scope,
    pub stay_in_dir: bool,
    /// Assets outside scope are still downloaded, never followed.
    pub external_assets: bool,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            scope: Scope::Subdomain,
            stay_in_dir: false,
            external_assets: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// HTTrack-style URL patterns; a pattern without `*` is a prefix match.
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// MIME patterns: `image/*` prefix or exact `application/json`.
    pub mime_include: Vec<String>,
    pub mime_exclude: Vec<String>,
    /// Inclusive byte bounds on saved resources.
    pub max_size: Option<u64>,
    pub min_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitConfig {
    pub strategy: WaitStrategy,
    /// Post-load settle in milliseconds.
    pub wait_time_ms: u64,
    /// Per-navigation timeout in milliseconds.
    pub timeout_ms: u64,
    /// Scroll increment for the lazy-load pass, in pixels.
    pub scroll_step: u32,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            strategy: WaitStrategy::NetworkIdle,
            wait_time_ms: 500,
            timeout_ms: 30_000,
            scroll_step: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1366,
            height: 900,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowserOptions {
    pub user_agent: Option<String>,
    pub viewport: Option<Viewport>,
    /// Named device preset; explicit `viewport`/`user_agent` win over it.
    pub device: Option<String>,
    /// Forwarded to the browser and to the robots/sitemap HTTP client.
    pub proxy: Option<String>,
    /// JSON cookie file installed before navigation.
    pub cookies_file: Option<PathBuf>,
    /// Extra HTTP headers sent with every browser request.
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactFlags {
    pub har: bool,
    pub screenshot: bool,
    pub pdf: bool,
    pub strip_scripts: bool,
    /// Accepted and snapshotted; inlining is not performed in this version.
    pub inline_css: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    pub concurrency: usize,
    pub max_pages: Option<usize>,
    pub max_time_ms: Option<u64>,
    /// Fixed delay before each capture, in milliseconds.
    pub rate_limit_ms: u64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_pages: None,
            max_time_ms: None,
            rate_limit_ms: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// CaptureJob
// ---------------------------------------------------------------------------

/// The complete, immutable description of one mirror run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureJob {
    pub url: String,
    pub output: PathBuf,
    /// Link distance from the root that may still be captured.
    pub depth: u32,
    #[serde(default)]
    pub scope: ScopeConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub wait: WaitConfig,
    #[serde(default)]
    pub browser: BrowserOptions,
    #[serde(default = "default_layout")]
    pub layout: Layout,
    #[serde(default)]
    pub artifacts: ArtifactFlags,
    #[serde(default)]
    pub limits: LimitConfig,
    #[serde(default)]
    pub ignore_robots: bool,
    #[serde(default)]
    pub use_cache: bool,
    #[serde(default = "default_mode")]
    pub mode: RunMode,
}

fn default_layout() -> Layout {
    Layout::Original
}

fn default_mode() -> RunMode {
    RunMode::Mirror
}

impl CaptureJob {
    /// Minimal job for `url` mirrored into `output` with defaults everywhere.
    pub fn new(url: impl Into<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            output: output.into(),
            depth: 1,
            scope: ScopeConfig::default(),
            filters: FilterConfig::default(),
            wait: WaitConfig::default(),
            browser: BrowserOptions::default(),
            layout: Layout::Original,
            artifacts: ArtifactFlags::default(),
            limits: LimitConfig::default(),
            ignore_robots: false,
            use_cache: false,
            mode: RunMode::Mirror,
        }
    }

    /// Fail-fast validation; the crawler refuses to start on any error here.
    pub fn validate(&self) -> Result<Url, EngineError> {
        let root = Url::parse(&self.url)
            .map_err(|e| EngineError::Config(format!("invalid root URL `{}`: {e}", self.url)))?;
        if !matches!(root.scheme(), "http" | "https") {
            return Err(EngineError::Config(format!(
                "root URL must be http(s), got `{}`",
                root.scheme()
            )));
        }
        if self.limits.concurrency == 0 {
            return Err(EngineError::Config("concurrency must be at least 1".into()));
        }
        if let (Some(max), Some(min)) = (self.filters.max_size, self.filters.min_size)
            && min > max
        {
            return Err(EngineError::Config(format!(
                "min_size {min} exceeds max_size {max}"
            )));
        }
        if let Some(vp) = self.browser.viewport
            && (vp.width == 0 || vp.height == 0)
        {
            return Err(EngineError::Config("viewport must be non-zero".into()));
        }
        if self.wait.timeout_ms == 0 {
            return Err(EngineError::Config("timeout must be non-zero".into()));
        }
        Ok(root)
    }

    /// Effective viewport, user agent, and mobile flag after applying the
    /// device preset (explicit settings win).
    pub fn effective_emulation(&self) -> (Viewport, Option<String>, bool) {
        let preset = self
            .browser
            .device
            .as_deref()
            .and_then(device_preset);

        let viewport = self
            .browser
            .viewport
            .or(preset.map(|p| p.0))
            .unwrap_or_default();
        let ua = self
            .browser
            .user_agent
            .clone()
            .or(preset.map(|p| p.1.to_string()));
        let mobile = preset.map(|p| p.2).unwrap_or(false);
        (viewport, ua, mobile)
    }
}

// ---------------------------------------------------------------------------
// Device presets
// ---------------------------------------------------------------------------

/// Small named emulation table: (viewport, user agent, mobile).
fn device_preset(name: &str) -> Option<(Viewport, &'static str, bool)> {
    const DESKTOP_UA: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";
    const PHONE_UA: &str = "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/126.0.0.0 Mobile Safari/537.36";
    const TABLET_UA: &str = "Mozilla/5.0 (Linux; Android 14; Pixel Tablet) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

    match name.to_ascii_lowercase().as_str() {
        "desktop" => Some((
            Viewport {
                width: 1920,
                height: 1080,
            },
            DESKTOP_UA,
            false,
        )),
        "laptop" => Some((
            Viewport {
                width: 1366,
                height: 768,
            },
            DESKTOP_UA,
            false,
        )),
        "tablet" => Some((
            Viewport {
                width: 820,
                height: 1180,
            },
            TABLET_UA,
            false,
        )),
        "phone" | "mobile" => Some((
            Viewport {
                width: 393,
                height: 852,
            },
            PHONE_UA,
            true,
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_bad_root() {
        let job = CaptureJob::new("not a url", "/tmp/out");
        assert!(job.validate().is_err());

        let job = CaptureJob::new("ftp://example.com/", "/tmp/out");
        assert!(job.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut job = CaptureJob::new("https://example.com/", "/tmp/out");
        job.limits.concurrency = 0;
        assert!(job.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_size_bounds() {
        let mut job = CaptureJob::new("https://example.com/", "/tmp/out");
        job.filters.min_size = Some(10_000);
        job.filters.max_size = Some(100);
        assert!(job.validate().is_err());
    }

    #[test]
    fn device_preset_yields_to_explicit_settings() {
        let mut job = CaptureJob::new("https://example.com/", "/tmp/out");
        job.browser.device = Some("phone".to_string());
        let (vp, ua, mobile) = job.effective_emulation();
        assert_eq!(vp.width, 393);
        assert!(ua.unwrap().contains("Mobile"));
        assert!(mobile);

        job.browser.viewport = Some(Viewport {
            width: 800,
            height: 600,
        });
        job.browser.user_agent = Some("custom-ua".to_string());
        let (vp, ua, _) = job.effective_emulation();
        assert_eq!(vp.width, 800);
        assert_eq!(ua.unwrap(), "custom-ua");
    }

    #[test]
    fn unknown_device_falls_back_to_defaults() {
        let mut job = CaptureJob::new("https://example.com/", "/tmp/out");
        job.browser.device = Some("vt100".to_string());
        let (vp, ua, mobile) = job.effective_emulation();
        assert_eq!(vp, Viewport::default());
        assert!(ua.is_none());
        assert!(!mobile);
    }
}
