/// file: src/models.rs
/// description: Engine error taxonomy, capture data records, and the
/// progress observer seam consumed by external collaborators.
use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("navigation failed for {url}: {reason}")]
    Navigation { url: String, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timeout")]
    Timeout,

    #[error("rewrite error: {0}")]
    Rewrite(String),
}

// ---------------------------------------------------------------------------
// Capture records
// ---------------------------------------------------------------------------

/// One network response collected by the passive sniffer during a page
/// load. `mime` is the primary part only: lowercased, parameters stripped.
#[derive(Debug, Clone)]
pub struct Resource {
    pub url: String,
    pub status: u16,
    pub mime: String,
    pub size: u64,
    pub bytes: Vec<u8>,
    pub headers: HashMap<String, String>,
}

/// Links discovered in a captured page, already resolved to absolute
/// HTTP(S) URLs and split by the page/asset classifier.
#[derive(Debug, Clone, Default)]
pub struct ExtractedLinks {
    pub pages: Vec<String>,
    pub assets: Vec<String>,
    pub all: Vec<String>,
}

/// The single-use result of one page capture.
#[derive(Debug)]
pub struct PageCaptureResult {
    pub requested_url: String,
    pub final_url: String,
    pub html: String,
    pub title: Option<String>,
    /// HTTP status of the main document, when the sniffer observed it.
    pub status: Option<u16>,
    pub links: ExtractedLinks,
    /// Keyed by response URL; last writer wins.
    pub resources: HashMap<String, Resource>,
    pub screenshot: Option<Vec<u8>>,
    pub pdf: Option<Vec<u8>>,
    pub duration: Duration,
}

/// One pending unit of crawl work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub url: String,
    pub remaining_depth: u32,
}

// ---------------------------------------------------------------------------
// Progress observer
// ---------------------------------------------------------------------------

/// Narrow observer interface for the progress collaborator. All methods
/// default to no-ops; implementations must be cheap and non-blocking, as
/// they are invoked from worker tasks.
pub trait CrawlObserver: Send + Sync {
    fn on_page_start(&self, _url: &str) {}
    fn on_page_complete(&self, _url: &str, _size: u64, _links_found: usize) {}
    fn on_asset_save(&self, _url: &str, _size: u64) {}
    fn on_error(&self, _url: &str, _error: &EngineError) {}
}

/// Default observer: discards every event.
pub struct NullObserver;

impl CrawlObserver for NullObserver {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_carry_context() {
        let e = EngineError::Navigation {
            url: "https://example.com/x".into(),
            reason: "net::ERR_CONNECTION_RESET".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("example.com/x"));
        assert!(msg.contains("ERR_CONNECTION_RESET"));
    }

    #[test]
    fn null_observer_accepts_all_events() {
        let obs = NullObserver;
        obs.on_page_start("https://example.com/");
        obs.on_page_complete("https://example.com/", 10, 2);
        obs.on_asset_save("https://example.com/s.css", 5);
        obs.on_error("https://example.com/x", &EngineError::Timeout);
    }
}
