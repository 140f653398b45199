/// file: src/urlpath.rs
/// description: URL canonicalization, scope decisions, page/asset classification,
/// and URL → local-path mapping.
use std::collections::HashSet;
use std::sync::LazyLock;

use url::Url;

use crate::config::{Layout, Scope};

// ---------------------------------------------------------------------------
// Canonicalization
// ---------------------------------------------------------------------------

/// Canonicalize a URL string: strip the fragment, strip the default port
/// (the `url` crate does this on parse), strip a single trailing `/` from a
/// non-root path, and sort query parameters lexicographically by name while
/// preserving duplicates. A string that does not parse as an absolute URL is
/// returned unchanged.
pub fn normalize(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };

    url.set_fragment(None);

    if let Some(q) = url.query() {
        if q.is_empty() {
            url.set_query(None);
        } else {
            let mut pairs: Vec<(String, String)> = url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            // Stable sort: duplicate keys keep their original relative order.
            pairs.sort_by(|a, b| a.0.cmp(&b.0));

            let mut ser = url::form_urlencoded::Serializer::new(String::new());
            for (k, v) in &pairs {
                ser.append_pair(k, v);
            }
            let sorted = ser.finish();
            url.set_query(Some(&sorted));
        }
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(&path[..path.len() - 1]);
    }

    url.to_string()
}

// ---------------------------------------------------------------------------
// Scope oracle
// ---------------------------------------------------------------------------

/// Multi-part public suffixes where the registrable domain spans three
/// labels instead of two.
const MULTI_PART_SUFFIXES: &[&str] = &["co.uk", "com.au", "co.nz", "org.uk"];

/// The registrable domain of a host: its last two labels, or the last three
/// when the last two form a known multi-part public suffix.
pub fn registrable_domain(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host.to_ascii_lowercase();
    }
    let last_two = labels[labels.len() - 2..].join(".").to_ascii_lowercase();
    let take = if MULTI_PART_SUFFIXES.contains(&last_two.as_str()) {
        3
    } else {
        2
    };
    let take = take.min(labels.len());
    labels[labels.len() - take..].join(".").to_ascii_lowercase()
}

/// The directory prefix of a base URL: its path up to and including the
/// last `/`. A base whose path carries no trailing slash is treated as a
/// leaf, so `/docs` yields `/` while `/docs/` yields `/docs/`.
pub fn base_directory(base: &Url) -> String {
    let path = base.path();
    match path.rfind('/') {
        Some(idx) => path[..=idx].to_string(),
        None => "/".to_string(),
    }
}

/// Decide whether `url` is inside the crawl scope anchored at `base`.
pub fn in_scope(url: &Url, base: &Url, scope: Scope, stay_in_dir: bool) -> bool {
    let scope_ok = match scope {
        Scope::Subdomain => {
            url.scheme() == base.scheme()
                && url.host_str() == base.host_str()
                && url.port_or_known_default() == base.port_or_known_default()
        }
        Scope::Domain => match (url.host_str(), base.host_str()) {
            (Some(a), Some(b)) => registrable_domain(a) == registrable_domain(b),
            _ => false,
        },
        Scope::Tld => {
            let last = |h: &str| h.rsplit('.').next().map(str::to_ascii_lowercase);
            match (url.host_str(), base.host_str()) {
                (Some(a), Some(b)) => last(a) == last(b),
                _ => false,
            }
        }
        Scope::All => true,
    };

    if !scope_ok {
        return false;
    }
    if stay_in_dir {
        return url.path().starts_with(&base_directory(base));
    }
    true
}

// ---------------------------------------------------------------------------
// Page / asset classification
// ---------------------------------------------------------------------------

static ASSET_EXTENSIONS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        // styles / scripts / data
        "css", "js", "map", "json", "xml",
        // images
        "png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "bmp",
        // fonts
        "woff", "woff2", "ttf", "eot", "otf",
        // media
        "mp3", "mp4", "webm", "ogg", "wav",
        // archives / documents
        "pdf", "zip", "tar", "gz",
    ]
    .into_iter()
    .collect()
});

/// The last-segment extension of a path, lowercased, without the dot.
pub fn path_extension(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// A URL is an asset iff its path ends in one of the enumerated non-page
/// extensions. Everything else, `.html`/`.htm` and extensionless paths
/// included, is a page.
pub fn is_asset(url: &str) -> bool {
    let path = match Url::parse(url) {
        Ok(u) => u.path().to_string(),
        Err(_) => url.to_string(),
    };
    match path_extension(&path) {
        Some(ext) => ASSET_EXTENSIONS.contains(ext.as_str()),
        None => false,
    }
}

/// Whether `ext` (lowercased, no dot) is a recognized extension — asset
/// extensions plus the page extensions.
pub fn is_known_extension(ext: &str) -> bool {
    ASSET_EXTENSIONS.contains(ext) || ext == "html" || ext == "htm"
}

// ---------------------------------------------------------------------------
// URL → relative local path
// ---------------------------------------------------------------------------

/// Stable 32-bit rolling hash over the query string (djb2 xor variant).
fn query_hash(query: &str) -> u32 {
    let mut h: u32 = 5381;
    for b in query.bytes() {
        h = h.wrapping_mul(33) ^ u32::from(b);
    }
    h
}

/// Splice `suffix` in front of the filename extension, or append it when
/// the filename has none.
fn splice_before_extension(name: &str, suffix: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}{suffix}.{ext}"),
        _ => format!("{name}{suffix}"),
    }
}

/// Map a URL to a relative local path under the chosen layout. The result
/// is sanitized but not yet collision-resolved; the saver owns step 7.
pub fn url_to_path(url: &Url, layout: Layout) -> String {
    let mut path = url.path().to_string();

    if path.is_empty() || path == "/" {
        path = "/index.html".to_string();
    } else if path.ends_with('/') {
        path.push_str("index.html");
    } else {
        let last = path.rsplit('/').next().unwrap_or_default();
        if !last.contains('.') {
            path.push_str(".html");
        }
    }

    if let Some(q) = url.query() {
        if !q.is_empty() {
            let tag = format!("-{:08x}", query_hash(q));
            let (dir, name) = path.rsplit_once('/').unwrap_or(("", path.as_str()));
            path = format!("{dir}/{}", splice_before_extension(name, &tag));
        }
    }

    let host = url.host_str().unwrap_or("unknown-host");
    let derived = match layout {
        Layout::Original => {
            let host = host.strip_prefix("www.").unwrap_or(host);
            format!("{host}{path}")
        }
        Layout::Domain => format!("{host}{path}"),
        Layout::Flat => path.replace('/', "-").trim_start_matches('-').to_string(),
    };

    sanitize_relative_path(&derived)
}

/// Sanitize a relative path: per-component replacement of `<>:"|?*` with
/// `_`, `..` collapsed to `_`, runs of `/` collapsed, and the whole string
/// truncated to at most 200 bytes on a char boundary.
pub fn sanitize_relative_path(path: &str) -> String {
    let components: Vec<String> = path
        .split('/')
        .filter(|c| !c.is_empty())
        .map(|component| {
            if component == ".." {
                return "_".to_string();
            }
            component
                .chars()
                .map(|c| match c {
                    '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
                    other => other,
                })
                .collect()
        })
        .collect();

    let mut joined = components.join("/");
    if joined.len() > 200 {
        let mut cut = 200;
        while cut > 0 && !joined.is_char_boundary(cut) {
            cut -= 1;
        }
        joined.truncate(cut);
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn normalize_sorts_query_params() {
        assert_eq!(
            normalize("https://example.com/page?b=2&a=1"),
            normalize("https://example.com/page?a=1&b=2"),
        );
    }

    #[test]
    fn normalize_preserves_duplicate_params() {
        let n = normalize("https://example.com/p?x=2&a=1&x=1");
        assert_eq!(n, "https://example.com/p?a=1&x=2&x=1");
    }

    #[test]
    fn normalize_strips_default_port() {
        assert_eq!(
            normalize("http://example.com:80/a"),
            normalize("http://example.com/a"),
        );
        assert_eq!(
            normalize("https://example.com:443/a"),
            normalize("https://example.com/a"),
        );
    }

    #[test]
    fn normalize_strips_trailing_slash_on_non_root() {
        assert_eq!(
            normalize("https://example.com/page/"),
            "https://example.com/page"
        );
        assert_eq!(normalize("https://example.com/"), "https://example.com/");
    }

    #[test]
    fn normalize_strips_fragment() {
        assert_eq!(
            normalize("https://example.com/page#top"),
            "https://example.com/page"
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in [
            "https://example.com/page?b=2&a=1#x",
            "http://example.com:80/deep/path/",
            "https://example.com",
            "not a url at all",
        ] {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once, "not idempotent for {raw}");
        }
    }

    #[test]
    fn normalize_returns_malformed_input_unchanged() {
        assert_eq!(normalize("::not-a-url::"), "::not-a-url::");
    }

    #[test]
    fn registrable_domain_handles_multi_part_suffixes() {
        assert_eq!(registrable_domain("www.example.co.uk"), "example.co.uk");
        assert_eq!(registrable_domain("a.b.example.com.au"), "example.com.au");
        assert_eq!(registrable_domain("shop.example.co.nz"), "example.co.nz");
        assert_eq!(registrable_domain("x.example.org.uk"), "example.org.uk");
        assert_eq!(registrable_domain("www.example.com"), "example.com");
        assert_eq!(registrable_domain("example.com"), "example.com");
        assert_eq!(registrable_domain("localhost"), "localhost");
    }

    #[test]
    fn scope_subdomain_requires_equal_origin() {
        let base = u("https://example.com/");
        assert!(in_scope(
            &u("https://example.com/x"),
            &base,
            Scope::Subdomain,
            false
        ));
        assert!(!in_scope(
            &u("https://cdn.example.com/x"),
            &base,
            Scope::Subdomain,
            false
        ));
        assert!(!in_scope(
            &u("http://example.com/x"),
            &base,
            Scope::Subdomain,
            false
        ));
    }

    #[test]
    fn scope_domain_crosses_subdomains() {
        let base = u("https://example.com/");
        assert!(in_scope(
            &u("https://cdn.example.com/x"),
            &base,
            Scope::Domain,
            false
        ));
        assert!(!in_scope(
            &u("https://evil.com/x"),
            &base,
            Scope::Domain,
            false
        ));
    }

    #[test]
    fn scope_tld_matches_last_label() {
        let base = u("https://example.com/");
        assert!(in_scope(
            &u("https://other.com/x"),
            &base,
            Scope::Tld,
            false
        ));
        assert!(!in_scope(&u("https://other.org/x"), &base, Scope::Tld, false));
    }

    #[test]
    fn stay_in_dir_uses_base_directory_prefix() {
        // Trailing slash: /docs/ is the directory.
        let base = u("https://example.com/docs/");
        assert!(in_scope(
            &u("https://example.com/docs/a"),
            &base,
            Scope::Subdomain,
            true
        ));
        assert!(!in_scope(
            &u("https://example.com/blog/a"),
            &base,
            Scope::Subdomain,
            true
        ));

        // Filename base: the directory is everything up to the last slash.
        let base = u("https://example.com/docs/index.html");
        assert!(in_scope(
            &u("https://example.com/docs/deep/a"),
            &base,
            Scope::Subdomain,
            true
        ));
        assert!(!in_scope(
            &u("https://example.com/other"),
            &base,
            Scope::Subdomain,
            true
        ));

        // Leaf base without trailing slash: directory is the root.
        let base = u("https://example.com/docs");
        assert!(in_scope(
            &u("https://example.com/anything"),
            &base,
            Scope::Subdomain,
            true
        ));
    }

    #[test]
    fn classifies_assets_by_extension() {
        assert!(is_asset("https://example.com/style.css"));
        assert!(is_asset("https://example.com/a/logo.PNG"));
        assert!(is_asset("https://example.com/app.js"));
        assert!(is_asset("https://example.com/font.woff2"));
        assert!(!is_asset("https://example.com/"));
        assert!(!is_asset("https://example.com/about"));
        assert!(!is_asset("https://example.com/page.html"));
        assert!(!is_asset("https://example.com/index.php"));
    }

    #[test]
    fn url_to_path_maps_root_and_directories() {
        assert_eq!(
            url_to_path(&u("https://example.com/"), Layout::Original),
            "example.com/index.html"
        );
        assert_eq!(
            url_to_path(&u("https://example.com/a/"), Layout::Original),
            "example.com/a/index.html"
        );
        assert_eq!(
            url_to_path(&u("https://example.com/about"), Layout::Original),
            "example.com/about.html"
        );
        assert_eq!(
            url_to_path(&u("https://example.com/a/logo.png"), Layout::Original),
            "example.com/a/logo.png"
        );
    }

    #[test]
    fn url_to_path_strips_www_only_for_original_layout() {
        assert_eq!(
            url_to_path(&u("https://www.example.com/"), Layout::Original),
            "example.com/index.html"
        );
        assert_eq!(
            url_to_path(&u("https://www.example.com/"), Layout::Domain),
            "www.example.com/index.html"
        );
    }

    #[test]
    fn url_to_path_flattens_for_flat_layout() {
        assert_eq!(
            url_to_path(&u("https://example.com/a/b/c.css"), Layout::Flat),
            "a-b-c.css"
        );
        assert_eq!(
            url_to_path(&u("https://example.com/"), Layout::Flat),
            "index.html"
        );
    }

    #[test]
    fn url_to_path_hashes_queries_stably() {
        let a = url_to_path(&u("https://example.com/p?a=1&b=2"), Layout::Original);
        let b = url_to_path(&u("https://example.com/p?a=1&b=2"), Layout::Original);
        let c = url_to_path(&u("https://example.com/p?a=1&b=3"), Layout::Original);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("example.com/p-"));
        assert!(a.ends_with(".html"));
    }

    #[test]
    fn query_hash_lands_before_real_extensions() {
        let p = url_to_path(&u("https://example.com/img.png?v=2"), Layout::Original);
        assert!(p.starts_with("example.com/img-"));
        assert!(p.ends_with(".png"));
    }

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(
            sanitize_relative_path("a/b<c>/d:e?.html"),
            "a/b_c_/d_e_.html"
        );
        assert_eq!(sanitize_relative_path("a/../b"), "a/_/b");
        assert_eq!(sanitize_relative_path("a//b///c"), "a/b/c");
    }

    #[test]
    fn sanitize_truncates_to_200_bytes() {
        let long = format!("host/{}.html", "x".repeat(400));
        assert!(sanitize_relative_path(&long).len() <= 200);
    }
}
