/// file: src/saver.rs
/// description: Resource saver — URL → unique relative path reservation,
/// content-type-driven extension fixing, and the URL map consumed by the
/// link rewriter.
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use url::Url;

use crate::config::Layout;
use crate::urlpath::{self, is_known_extension, normalize, url_to_path};

// ---------------------------------------------------------------------------
// URL map
// ---------------------------------------------------------------------------

/// Authoritative mapping from canonical URL to saved relative path.
/// Append-only during a run (entries are only removed to roll back a
/// failed write).
#[derive(Debug, Default, Clone)]
pub struct UrlMap {
    inner: HashMap<String, String>,
}

impl UrlMap {
    pub fn insert(&mut self, url: &str, relative_path: String) {
        self.inner.insert(normalize(url), relative_path);
    }

    pub fn remove(&mut self, url: &str) {
        self.inner.remove(&normalize(url));
    }

    pub fn get(&self, url: &str) -> Option<&str> {
        self.inner.get(&normalize(url)).map(String::as_str)
    }

    /// Rewriter lookup: try `abs` itself, `abs` without its trailing `/`,
    /// `abs` + `index.html` when it ends with `/`, then `abs` without its
    /// query string.
    pub fn lookup(&self, abs: &str) -> Option<&str> {
        if let Some(hit) = self.get(abs) {
            return Some(hit);
        }
        if let Some(stripped) = abs.strip_suffix('/')
            && let Some(hit) = self.get(stripped)
        {
            return Some(hit);
        }
        if abs.ends_with('/')
            && let Some(hit) = self.get(&format!("{abs}index.html"))
        {
            return Some(hit);
        }
        if let Some((without_query, _)) = abs.split_once('?')
            && let Some(hit) = self.get(without_query)
        {
            return Some(hit);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Extension fixing
// ---------------------------------------------------------------------------

/// Preferred extension for a primary content type.
fn mime_extension(primary: &str) -> Option<&'static str> {
    Some(match primary {
        "text/html" | "application/xhtml+xml" => "html",
        "text/css" => "css",
        "text/javascript" | "application/javascript" | "application/x-javascript" => "js",
        "application/json" => "json",
        "text/xml" | "application/xml" => "xml",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "image/x-icon" | "image/vnd.microsoft.icon" => "ico",
        "image/bmp" => "bmp",
        "font/woff" | "application/font-woff" => "woff",
        "font/woff2" => "woff2",
        "font/ttf" | "application/x-font-ttf" => "ttf",
        "font/otf" => "otf",
        "application/vnd.ms-fontobject" => "eot",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "audio/wav" | "audio/x-wav" => "wav",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        "application/x-tar" => "tar",
        "application/gzip" => "gz",
        _ => return None,
    })
}

/// Extensions considered interchangeable for the purpose of fixing.
fn equivalent_extensions(a: &str, b: &str) -> bool {
    const FAMILIES: &[&[&str]] = &[&["jpg", "jpeg"], &["htm", "html"], &["js", "mjs", "cjs"]];
    a == b
        || FAMILIES
            .iter()
            .any(|family| family.contains(&a) && family.contains(&b))
}

/// Append the mime-derived extension when the path's own extension is
/// absent or unrecognized. A known extension is never overridden, even
/// when it disagrees with the content type.
fn fix_extension(relative: &str, mime_primary: &str) -> String {
    let Some(want) = mime_extension(mime_primary) else {
        return relative.to_string();
    };
    match urlpath::path_extension(relative) {
        Some(current) => {
            if equivalent_extensions(&current, want) || is_known_extension(&current) {
                relative.to_string()
            } else {
                format!("{relative}.{want}")
            }
        }
        None => format!("{relative}.{want}"),
    }
}

// ---------------------------------------------------------------------------
// ResourceSaver
// ---------------------------------------------------------------------------

/// Reserves unique relative paths for URLs and records them in the URL
/// map. Path reservation is synchronous and belongs inside the crawl
/// state's critical section; the actual disk write happens outside it via
/// [`write_file`].
#[derive(Debug)]
pub struct ResourceSaver {
    output: PathBuf,
    layout: Layout,
    reserved: HashSet<String>,
    map: UrlMap,
}

impl ResourceSaver {
    pub fn new(output: PathBuf, layout: Layout) -> Self {
        Self {
            output,
            layout,
            reserved: HashSet::new(),
            map: UrlMap::default(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output
    }

    pub fn url_map(&self) -> &UrlMap {
        &self.map
    }

    /// The already-reserved path for `url`, if any.
    pub fn saved_path(&self, url: &str) -> Option<String> {
        self.map.get(url).map(str::to_string)
    }

    /// Reserve a unique relative path for an asset URL, fixing the
    /// extension against the sniffed content type, and record it in the
    /// URL map.
    pub fn reserve_asset(&mut self, url: &Url, mime_primary: &str) -> String {
        let relative = fix_extension(&url_to_path(url, self.layout), mime_primary);
        self.reserve(url.as_str(), relative)
    }

    /// Reserve the relative path for a page URL.
    pub fn reserve_page(&mut self, url: &Url) -> String {
        let relative = url_to_path(url, self.layout);
        self.reserve(url.as_str(), relative)
    }

    fn reserve(&mut self, url: &str, relative: String) -> String {
        let unique = self.uniquify(relative);
        self.reserved.insert(unique.clone());
        self.map.insert(url, unique.clone());
        unique
    }

    /// Resolve a path collision by splicing `-N` before the extension.
    fn uniquify(&self, relative: String) -> String {
        if !self.reserved.contains(&relative) {
            return relative;
        }
        // Split at the filename's extension, never at a dot inside a
        // directory component.
        let (stem, ext) = match relative.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => {
                (stem.to_string(), Some(ext.to_string()))
            }
            _ => (relative.clone(), None),
        };
        for n in 1u32.. {
            let candidate = match &ext {
                Some(ext) => format!("{stem}-{n}.{ext}"),
                None => format!("{stem}-{n}"),
            };
            if !self.reserved.contains(&candidate) {
                return candidate;
            }
        }
        unreachable!("collision counter exhausted");
    }

    /// Roll a reservation's map entry back after a failed write so the
    /// rewriter never points at a file that does not exist. The path stays
    /// burned.
    pub fn forget(&mut self, url: &str) {
        self.map.remove(url);
    }

    /// Re-seed a mapping from a prior run's manifest without touching the
    /// filesystem.
    pub fn restore(&mut self, url: &str, relative: &str) {
        self.reserved.insert(relative.to_string());
        self.map.insert(url, relative.to_string());
    }

    /// Sibling artifact path: `page.html` → `page.png` / `page.pdf`.
    pub fn sibling_path(page_relative: &str, new_extension: &str) -> String {
        for suffix in [".html", ".htm"] {
            if let Some(stem) = page_relative.strip_suffix(suffix) {
                return format!("{stem}.{new_extension}");
            }
        }
        format!("{page_relative}.{new_extension}")
    }
}

/// Write `bytes` under `output/relative`, creating parent directories.
pub async fn write_file(
    output: &Path,
    relative: &str,
    bytes: &[u8],
) -> Result<(), std::io::Error> {
    let full = output.join(relative);
    if let Some(parent) = full.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&full, bytes).await
}

/// Read a previously saved artifact back (used by the CSS re-rewriter).
pub async fn read_file(output: &Path, relative: &str) -> Result<String, std::io::Error> {
    tokio::fs::read_to_string(output.join(relative)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn saver() -> ResourceSaver {
        ResourceSaver::new(PathBuf::from("/tmp/ignored"), Layout::Original)
    }

    fn u(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn reserves_pages_and_assets_into_the_map() {
        let mut s = saver();
        let page = s.reserve_page(&u("https://example.com/"));
        let css = s.reserve_asset(&u("https://example.com/s.css"), "text/css");
        assert_eq!(page, "example.com/index.html");
        assert_eq!(css, "example.com/s.css");
        assert_eq!(s.url_map().get("https://example.com/"), Some("example.com/index.html"));
        assert_eq!(s.url_map().get("https://example.com/s.css"), Some("example.com/s.css"));
    }

    #[test]
    fn collisions_get_numeric_suffixes() {
        let mut s = saver();
        // All three sanitize to the same relative path.
        let first = s.reserve_page(&u("https://example.com/a:b"));
        let second = s.reserve_page(&u("https://example.com/a*b"));
        let third = s.reserve_page(&u("https://example.com/a_b"));
        assert_eq!(first, "example.com/a_b.html");
        assert_eq!(second, "example.com/a_b-1.html");
        assert_eq!(third, "example.com/a_b-2.html");
    }

    #[test]
    fn unknown_extension_gains_mime_extension() {
        let mut s = saver();
        let rel = s.reserve_asset(&u("https://example.com/data.blob"), "image/png");
        assert_eq!(rel, "example.com/data.blob.png");
    }

    #[test]
    fn known_extension_is_never_overridden() {
        let mut s = saver();
        let rel = s.reserve_asset(&u("https://example.com/pic.png"), "text/css");
        assert_eq!(rel, "example.com/pic.png");
    }

    #[test]
    fn equivalent_extensions_are_left_alone() {
        let mut s = saver();
        assert_eq!(
            s.reserve_asset(&u("https://example.com/photo.jpeg"), "image/jpeg"),
            "example.com/photo.jpeg"
        );
        assert_eq!(
            s.reserve_asset(&u("https://example.com/mod.mjs"), "application/javascript"),
            "example.com/mod.mjs"
        );
    }

    #[test]
    fn forget_rolls_back_the_map_entry_only() {
        let mut s = saver();
        let rel = s.reserve_asset(&u("https://example.com/s.css"), "text/css");
        s.forget("https://example.com/s.css");
        assert!(s.url_map().get("https://example.com/s.css").is_none());
        // Path stays reserved: a retry cannot silently overwrite it.
        let again = s.reserve_asset(&u("https://example.com/s.css"), "text/css");
        assert_ne!(rel, again);
    }

    #[test]
    fn lookup_tries_slash_and_query_fallbacks() {
        let mut map = UrlMap::default();
        map.insert("https://example.com/docs", "example.com/docs.html".into());
        map.insert(
            "https://example.com/a/index.html",
            "example.com/a/index.html".into(),
        );

        assert_eq!(
            map.lookup("https://example.com/docs/"),
            Some("example.com/docs.html")
        );
        assert_eq!(
            map.lookup("https://example.com/a/"),
            Some("example.com/a/index.html")
        );
        assert_eq!(
            map.lookup("https://example.com/docs?draft=1"),
            Some("example.com/docs.html")
        );
        assert_eq!(map.lookup("https://example.com/missing"), None);
    }

    #[test]
    fn sibling_paths_replace_html_suffix() {
        assert_eq!(
            ResourceSaver::sibling_path("example.com/index.html", "png"),
            "example.com/index.png"
        );
        assert_eq!(
            ResourceSaver::sibling_path("example.com/old.htm", "pdf"),
            "example.com/old.pdf"
        );
        assert_eq!(
            ResourceSaver::sibling_path("example.com/page.php", "png"),
            "example.com/page.php.png"
        );
    }

    #[tokio::test]
    async fn write_file_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "example.com/a/b/logo.png", b"\x89PNG")
            .await
            .unwrap();
        let on_disk = tokio::fs::read(dir.path().join("example.com/a/b/logo.png"))
            .await
            .unwrap();
        assert_eq!(on_disk, b"\x89PNG");
    }
}
