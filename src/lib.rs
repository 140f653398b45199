/// file: src/lib.rs
/// description: Crate root — module wiring and the public engine surface.
/// Smippo mirrors JavaScript-rendered web sites to disk: a headless
/// browser captures each page after dynamic content settles, a passive
/// sniffer collects every response the page loads, and a link rewriter
/// produces an offline-browsable tree whose references are closed over
/// the saved artifacts.
pub mod capture;
pub mod config;
pub mod crawler;
pub mod extract;
pub mod filter;
pub mod manifest;
pub mod models;
pub mod robots;
pub mod rewrite;
pub mod saver;
pub mod urlpath;

pub use config::{CaptureJob, Layout, RunMode, Scope, WaitStrategy};
pub use crawler::{Crawler, StopHandle};
pub use manifest::{Manifest, RunStats};
pub use models::{CrawlObserver, EngineError, NullObserver, PageCaptureResult};
