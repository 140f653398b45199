/// file: src/filter.rs
/// description: URL and resource filtering — crawl scope, include/exclude
/// globs, MIME and size gates, plus the built-in analytics exclude table.
use std::sync::LazyLock;

use globset::{GlobBuilder, GlobMatcher};
use regex::Regex;
use url::Url;

use crate::config::{FilterConfig, Scope, ScopeConfig};
use crate::models::EngineError;
use crate::urlpath;

// ---------------------------------------------------------------------------
// Pattern compilation
// ---------------------------------------------------------------------------

/// HTTrack-style URL pattern: without `*` a case-insensitive prefix,
/// otherwise a glob over the full URL.
enum UrlPattern {
    Prefix(String),
    Glob(GlobMatcher),
}

impl UrlPattern {
    fn compile(pattern: &str) -> Result<Self, EngineError> {
        if !pattern.contains('*') {
            return Ok(UrlPattern::Prefix(pattern.to_ascii_lowercase()));
        }
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .literal_separator(false)
            .build()
            .map_err(|e| EngineError::Config(format!("invalid pattern `{pattern}`: {e}")))?;
        Ok(UrlPattern::Glob(glob.compile_matcher()))
    }

    fn matches(&self, url: &str) -> bool {
        match self {
            UrlPattern::Prefix(prefix) => url.to_ascii_lowercase().starts_with(prefix),
            UrlPattern::Glob(glob) => glob.is_match(url),
        }
    }
}

/// MIME pattern: `image/*` prefix form or exact `application/json`.
enum MimePattern {
    Family(String),
    Exact(String),
}

impl MimePattern {
    fn compile(pattern: &str) -> Self {
        let pattern = pattern.to_ascii_lowercase();
        match pattern.strip_suffix("/*") {
            Some(family) => MimePattern::Family(format!("{family}/")),
            None => MimePattern::Exact(pattern),
        }
    }

    fn matches(&self, primary: &str) -> bool {
        match self {
            MimePattern::Family(prefix) => primary.starts_with(prefix),
            MimePattern::Exact(exact) => primary == exact,
        }
    }
}

/// The primary part of a content type: up to the first `;`, trimmed,
/// lowercased.
pub fn mime_primary(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or(mime)
        .trim()
        .to_ascii_lowercase()
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Purely functional filter over URLs and sniffed resources. Safe for
/// concurrent use: construction compiles everything, queries only read.
pub struct Filter {
    base: Url,
    scope: Scope,
    stay_in_dir: bool,
    external_assets: bool,
    include: Vec<UrlPattern>,
    exclude: Vec<UrlPattern>,
    mime_include: Vec<MimePattern>,
    mime_exclude: Vec<MimePattern>,
    max_size: Option<u64>,
    min_size: Option<u64>,
}

impl Filter {
    pub fn new(
        base: Url,
        scope: &ScopeConfig,
        filters: &FilterConfig,
    ) -> Result<Self, EngineError> {
        let compile_all = |patterns: &[String]| -> Result<Vec<UrlPattern>, EngineError> {
            patterns.iter().map(|p| UrlPattern::compile(p)).collect()
        };

        Ok(Self {
            base,
            scope: scope.scope,
            stay_in_dir: scope.stay_in_dir,
            external_assets: scope.external_assets,
            include: compile_all(&filters.include)?,
            exclude: compile_all(&filters.exclude)?,
            mime_include: filters
                .mime_include
                .iter()
                .map(|p| MimePattern::compile(p))
                .collect(),
            mime_exclude: filters
                .mime_exclude
                .iter()
                .map(|p| MimePattern::compile(p))
                .collect(),
            max_size: filters.max_size,
            min_size: filters.min_size,
        })
    }

    fn in_scope(&self, url: &str) -> bool {
        match Url::parse(url) {
            Ok(parsed) => urlpath::in_scope(&parsed, &self.base, self.scope, self.stay_in_dir),
            Err(_) => false,
        }
    }

    fn excluded(&self, url: &str) -> bool {
        self.exclude.iter().any(|p| p.matches(url))
    }

    fn included(&self, url: &str) -> bool {
        self.include.is_empty() || self.include.iter().any(|p| p.matches(url))
    }

    /// Whether `url` may be crawled as a page. Exclude beats include.
    pub fn should_follow(&self, url: &str) -> bool {
        self.in_scope(url) && !self.excluded(url) && self.included(url)
    }

    /// Whether `url` may be downloaded as an asset. With `external_assets`
    /// only the exclude patterns apply; scope is waived.
    pub fn should_download_asset(&self, url: &str) -> bool {
        if self.external_assets {
            !self.excluded(url)
        } else {
            self.should_follow(url)
        }
    }

    /// Full save gate: URL, MIME, and size. An empty MIME passes.
    pub fn should_save(&self, url: &str, mime: &str, size: u64) -> bool {
        if !self.should_download_asset(url) {
            return false;
        }
        if !self.mime_passes(mime) {
            return false;
        }
        if let Some(max) = self.max_size
            && size > max
        {
            return false;
        }
        if let Some(min) = self.min_size
            && size < min
        {
            return false;
        }
        true
    }

    fn mime_passes(&self, mime: &str) -> bool {
        if mime.is_empty() {
            return true;
        }
        let primary = mime_primary(mime);
        if self.mime_exclude.iter().any(|p| p.matches(&primary)) {
            return false;
        }
        self.mime_include.is_empty() || self.mime_include.iter().any(|p| p.matches(&primary))
    }
}

// ---------------------------------------------------------------------------
// Built-in exclude table
// ---------------------------------------------------------------------------

/// Fixed table of resources never worth mirroring: telemetry, analytics,
/// widgets, and live API endpoints. Matches omit a resource from saving,
/// not from rewriting.
static BUILTIN_EXCLUDES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    const TABLE: &[(&str, &str)] = &[
        (r"(?i)\.map($|\?)", "source-map"),
        (r"(?i)/\.well-known/", "well-known"),
        (
            r"(?i)/cdn-cgi/(rum|beacon|trace|challenge-platform)|cloudflareinsights\.com",
            "cloudflare-telemetry",
        ),
        (
            r"(?i)google-analytics|googletagmanager|doubleclick|/gtag/js|/ga\.js|/analytics\.js|/gtm\.js",
            "analytics",
        ),
        (
            r"(?i)connect\.facebook\.net|platform\.twitter\.com/widgets|t\.co/i/adsct|linkedin\.com/px",
            "social-pixel",
        ),
        (
            r"(?i)hotjar|mixpanel|segment\.(io|com)|amplitude|heapanalytics|sentry|logrocket|fullstory|newrelic|datadoghq",
            "tracking",
        ),
        (
            r"(?i)intercom|drift\.com|driftt\.com|hubspot|zendesk|crisp\.chat|tawk\.to|livechat",
            "chat-widget",
        ),
        (
            r"(?i)adsystem|adservice|adnxs\.com|taboola|outbrain|criteo",
            "ad-network",
        ),
        (
            r"(?i)cookielaw\.org|cookiebot|onetrust|consentmanager",
            "consent-banner",
        ),
        (r"(?i)onesignal|pushwoosh", "push-notifications"),
        (r"(?i)optimizely|vwo\.com|abtasty", "ab-testing"),
        (
            r"(?i)/beacon/|/collect\?|/pixel\?|/track\?|/event\?|/log\?",
            "beacon",
        ),
        (
            r"(?i)/api/v\d+/|graphql|webhook|socket\.io|/ws/",
            "api-endpoint",
        ),
    ];
    TABLE
        .iter()
        .map(|(pattern, reason)| {
            let re = Regex::new(pattern).unwrap_or_else(|e| {
                unreachable!("builtin exclude pattern `{pattern}` failed to compile: {e}")
            });
            (re, *reason)
        })
        .collect()
});

/// Reason code when `url` falls on the built-in exclude table, else `None`.
pub fn builtin_exclude_reason(url: &str) -> Option<&'static str> {
    BUILTIN_EXCLUDES
        .iter()
        .find(|(re, _)| re.is_match(url))
        .map(|(_, reason)| *reason)
}
