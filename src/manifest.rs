/// file: src/manifest.rs
/// description: Run persistence under `<output>/.smippo/` — the resumable
/// manifest, the validator cache, the append-only run log, and the
/// optional HAR document.
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::CaptureJob;
use crate::models::EngineError;

/// Directory under the output root holding run metadata.
pub const SMIPPO_DIR: &str = ".smippo";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const CACHE_FILE: &str = "cache.json";
pub const HAR_FILE: &str = "network.har";
pub const LOG_FILE: &str = "log.txt";

// ---------------------------------------------------------------------------
// Manifest records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub url: String,
    #[serde(rename = "localPath")]
    pub local_path: String,
    pub status: u16,
    /// ISO-8601 capture timestamp.
    pub captured: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRecord {
    pub url: String,
    #[serde(rename = "localPath")]
    pub local_path: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FiltersSnapshot {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionsSnapshot {
    pub depth: u32,
    pub scope: String,
    #[serde(rename = "stayInDir")]
    pub stay_in_dir: bool,
    #[serde(rename = "externalAssets")]
    pub external_assets: bool,
    pub filters: FiltersSnapshot,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    #[serde(rename = "pagesCapt")]
    pub pages_capt: u64,
    #[serde(rename = "assetsCapt")]
    pub assets_capt: u64,
    #[serde(rename = "totalSize")]
    pub total_size: u64,
    /// Milliseconds.
    pub duration: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub created: String,
    pub updated: String,
    #[serde(rename = "rootUrl")]
    pub root_url: String,
    pub options: OptionsSnapshot,
    pub stats: RunStats,
    pub pages: Vec<PageRecord>,
    pub assets: Vec<AssetRecord>,
}

impl Manifest {
    pub fn new(job: &CaptureJob) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            created: now.clone(),
            updated: now,
            root_url: job.url.clone(),
            options: OptionsSnapshot {
                depth: job.depth,
                scope: job.scope.scope.to_string(),
                stay_in_dir: job.scope.stay_in_dir,
                external_assets: job.scope.external_assets,
                filters: FiltersSnapshot {
                    include: job.filters.include.clone(),
                    exclude: job.filters.exclude.clone(),
                },
            },
            stats: RunStats::default(),
            pages: Vec::new(),
            assets: Vec::new(),
        }
    }

    pub fn record_page(&mut self, record: PageRecord) {
        self.stats.pages_capt += 1;
        self.stats.total_size += record.size;
        self.pages.push(record);
    }

    pub fn record_asset(&mut self, record: AssetRecord) {
        self.stats.assets_capt += 1;
        self.stats.total_size += record.size;
        self.assets.push(record);
    }

    pub fn record_error(&mut self) {
        self.stats.errors += 1;
    }

    pub fn manifest_path(output: &Path) -> PathBuf {
        output.join(SMIPPO_DIR).join(MANIFEST_FILE)
    }

    pub async fn load(output: &Path) -> Result<Option<Self>, EngineError> {
        let path = Self::manifest_path(output);
        match tokio::fs::read_to_string(&path).await {
            Ok(body) => Ok(Some(serde_json::from_str(&body)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stamp `updated` and write the manifest out. Called after every page
    /// so an interrupted run stays resumable.
    pub async fn persist(&mut self, output: &Path) -> Result<(), EngineError> {
        self.updated = Utc::now().to_rfc3339();
        self.write_to(output).await
    }

    /// Write the manifest as-is, without touching timestamps.
    pub async fn write_to(&self, output: &Path) -> Result<(), EngineError> {
        let path = Self::manifest_path(output);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&path, body).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validator cache
// ---------------------------------------------------------------------------

/// Advisory per-URL validators for `update` runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheFile {
    pub etags: BTreeMap<String, String>,
    #[serde(rename = "lastModified")]
    pub last_modified: BTreeMap<String, String>,
    #[serde(rename = "contentTypes")]
    pub content_types: BTreeMap<String, String>,
}

impl CacheFile {
    pub fn cache_path(output: &Path) -> PathBuf {
        output.join(SMIPPO_DIR).join(CACHE_FILE)
    }

    pub async fn load(output: &Path) -> Result<Self, EngineError> {
        let path = Self::cache_path(output);
        match tokio::fs::read_to_string(&path).await {
            Ok(body) => Ok(serde_json::from_str(&body)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn persist(&self, output: &Path) -> Result<(), EngineError> {
        let path = Self::cache_path(output);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_string_pretty(self)?).await?;
        Ok(())
    }

    /// Record validators observed on a sniffed response.
    pub fn record(&mut self, url: &str, etag: Option<&str>, last_modified: Option<&str>, content_type: Option<&str>) {
        if let Some(etag) = etag {
            self.etags.insert(url.to_string(), etag.to_string());
        }
        if let Some(lm) = last_modified {
            self.last_modified.insert(url.to_string(), lm.to_string());
        }
        if let Some(ct) = content_type {
            self.content_types.insert(url.to_string(), ct.to_string());
        }
    }

    /// Validators usable for a conditional request, if any were recorded.
    pub fn validators(&self, url: &str) -> (Option<&str>, Option<&str>) {
        (
            self.etags.get(url).map(String::as_str),
            self.last_modified.get(url).map(String::as_str),
        )
    }
}

// ---------------------------------------------------------------------------
// Run log
// ---------------------------------------------------------------------------

/// Append-only text log. Lines are tiny and the file handle is kept open
/// for the run, so writes are synchronous.
pub struct RunLog {
    file: Mutex<std::fs::File>,
}

impl RunLog {
    pub fn open(output: &Path) -> Result<Self, EngineError> {
        let dir = output.join(SMIPPO_DIR);
        std::fs::create_dir_all(&dir)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn line(&self, kind: &str, detail: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{} {kind} {detail}", Utc::now().to_rfc3339());
        }
    }
}

// ---------------------------------------------------------------------------
// HAR synthesis
// ---------------------------------------------------------------------------

/// Metadata of one sniffed response, retained for the HAR document.
#[derive(Debug, Clone)]
pub struct HarEntryMeta {
    pub url: String,
    pub status: u16,
    pub mime: String,
    pub size: u64,
    pub started: String,
}

/// Build an HAR 1.2 document from the run's sniffed responses.
pub fn har_document(entries: &[HarEntryMeta]) -> serde_json::Value {
    json!({
        "log": {
            "version": "1.2",
            "creator": {
                "name": "smippo",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "entries": entries.iter().map(|e| json!({
                "startedDateTime": e.started,
                "time": 0,
                "request": {
                    "method": "GET",
                    "url": e.url,
                    "httpVersion": "HTTP/1.1",
                    "headers": [],
                    "queryString": [],
                    "cookies": [],
                    "headersSize": -1,
                    "bodySize": 0,
                },
                "response": {
                    "status": e.status,
                    "statusText": "",
                    "httpVersion": "HTTP/1.1",
                    "headers": [],
                    "cookies": [],
                    "content": {
                        "size": e.size,
                        "mimeType": e.mime,
                    },
                    "redirectURL": "",
                    "headersSize": -1,
                    "bodySize": e.size,
                },
                "cache": {},
                "timings": { "send": 0, "wait": 0, "receive": 0 },
            })).collect::<Vec<_>>(),
        }
    })
}

pub async fn persist_har(output: &Path, entries: &[HarEntryMeta]) -> Result<(), EngineError> {
    let path = output.join(SMIPPO_DIR).join(HAR_FILE);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, serde_json::to_string_pretty(&har_document(entries))?).await?;
    Ok(())
}
