/// file: src/extract.rs
/// description: Link and asset extraction from a captured page's serialized
/// DOM. Candidates are resolved against the final URL and split by the
/// page/asset classifier.
use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::models::ExtractedLinks;
use crate::rewrite::css_targets;
use crate::urlpath::is_asset;

/// Values that are never crawl candidates.
pub const SKIP_PREFIXES: &[&str] = &[
    "javascript:",
    "mailto:",
    "tel:",
    "data:",
    "blob:",
    "about:",
    "#",
];

/// Whether an attribute value must be left alone entirely.
pub fn has_skip_prefix(value: &str) -> bool {
    let trimmed = value.trim_start();
    SKIP_PREFIXES.iter().any(|p| {
        trimmed
            .get(..p.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(p))
    })
}

/// Split a `srcset` value into (URL token, optional descriptor) entries.
pub fn srcset_entries(srcset: &str) -> Vec<(String, Option<String>)> {
    srcset
        .split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let mut parts = entry.split_whitespace();
            let url = parts.next()?.to_string();
            let descriptor = parts.collect::<Vec<_>>().join(" ");
            Some((url, (!descriptor.is_empty()).then_some(descriptor)))
        })
        .collect()
}

static META_REFRESH_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)url\s*=\s*['"]?([^'">;\s]+)"#).unwrap());

/// The redirect target inside a `<meta http-equiv=refresh>` content value.
pub fn meta_refresh_target(content: &str) -> Option<String> {
    META_REFRESH_URL
        .captures(content)
        .map(|c| c[1].to_string())
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

enum Kind {
    /// Classify by extension.
    Auto,
    Page,
    Asset,
    /// Saved as an asset and also crawlable (iframes).
    PageAndAsset,
}

/// Extract every link and asset candidate from `html`, resolved against
/// `base`. Candidates with skip prefixes or non-HTTP(S) schemes are
/// dropped; the result sets are deduplicated in discovery order.
pub fn extract_links(html: &str, base: &Url) -> ExtractedLinks {
    let doc = Html::parse_document(html);
    let every = Selector::parse("*").unwrap_or_else(|_| unreachable!("universal selector"));

    let mut candidates: Vec<(String, Kind)> = Vec::new();
    let push = |candidates: &mut Vec<(String, Kind)>, value: Option<&str>, kind: Kind| {
        if let Some(v) = value {
            let v = v.trim();
            if !v.is_empty() && !has_skip_prefix(v) {
                candidates.push((v.to_string(), kind));
            }
        }
    };

    for el in doc.select(&every) {
        let v = el.value();
        let name = v.name();
        let attr = |a: &str| v.attr(a);
        let href_like = || attr("href").or_else(|| attr("xlink:href"));

        if name.eq_ignore_ascii_case("a") {
            push(&mut candidates, attr("href"), Kind::Auto);
        } else if name.eq_ignore_ascii_case("link") {
            let rel = attr("rel").unwrap_or_default().to_ascii_lowercase();
            let tokens: Vec<&str> = rel.split_whitespace().collect();
            if tokens
                .iter()
                .any(|t| matches!(*t, "stylesheet" | "preload" | "prefetch") || t.contains("icon"))
            {
                push(&mut candidates, attr("href"), Kind::Asset);
            } else if tokens.contains(&"canonical") {
                push(&mut candidates, attr("href"), Kind::Page);
            }
        } else if name.eq_ignore_ascii_case("script") {
            push(&mut candidates, attr("src"), Kind::Asset);
        } else if name.eq_ignore_ascii_case("img") {
            push(&mut candidates, attr("src"), Kind::Asset);
            push(&mut candidates, attr("data-src"), Kind::Asset);
            for (url, _) in srcset_entries(attr("srcset").unwrap_or_default()) {
                push(&mut candidates, Some(&url), Kind::Asset);
            }
        } else if name.eq_ignore_ascii_case("iframe") {
            push(&mut candidates, attr("src"), Kind::PageAndAsset);
        } else if name.eq_ignore_ascii_case("object") {
            push(&mut candidates, attr("data"), Kind::Asset);
        } else if name.eq_ignore_ascii_case("video") {
            push(&mut candidates, attr("src"), Kind::Asset);
            push(&mut candidates, attr("poster"), Kind::Asset);
        } else if name.eq_ignore_ascii_case("audio") {
            push(&mut candidates, attr("src"), Kind::Asset);
        } else if name.eq_ignore_ascii_case("source") {
            push(&mut candidates, attr("src"), Kind::Asset);
            for (url, _) in srcset_entries(attr("srcset").unwrap_or_default()) {
                push(&mut candidates, Some(&url), Kind::Asset);
            }
        } else if name.eq_ignore_ascii_case("image")
            || name.eq_ignore_ascii_case("use")
            || name.eq_ignore_ascii_case("feImage")
        {
            push(&mut candidates, href_like(), Kind::Asset);
        } else if name.eq_ignore_ascii_case("meta") {
            let http_equiv = attr("http-equiv").unwrap_or_default();
            if http_equiv.eq_ignore_ascii_case("refresh")
                && let Some(target) = attr("content").and_then(|c| meta_refresh_target(c))
            {
                push(&mut candidates, Some(&target), Kind::Page);
            }
        } else if name.eq_ignore_ascii_case("style") {
            let css: String = el.text().collect();
            for target in css_targets(&css) {
                push(&mut candidates, Some(&target), Kind::Asset);
            }
        }

        if let Some(style) = attr("style") {
            for target in css_targets(style) {
                push(&mut candidates, Some(&target), Kind::Asset);
            }
        }
    }

    let mut links = ExtractedLinks::default();
    let mut seen_pages = HashSet::new();
    let mut seen_assets = HashSet::new();
    let mut seen_all = HashSet::new();

    for (raw, kind) in candidates {
        let Ok(mut abs) = base.join(&raw) else {
            continue;
        };
        if !matches!(abs.scheme(), "http" | "https") {
            continue;
        }
        // Fragments never distinguish crawl targets.
        abs.set_fragment(None);
        let abs = abs.to_string();

        let (as_page, as_asset) = match kind {
            Kind::Auto => {
                let asset = is_asset(&abs);
                (!asset, asset)
            }
            Kind::Page => (true, false),
            Kind::Asset => (false, true),
            Kind::PageAndAsset => (true, true),
        };

        if as_page && seen_pages.insert(abs.clone()) {
            links.pages.push(abs.clone());
        }
        if as_asset && seen_assets.insert(abs.clone()) {
            links.assets.push(abs.clone());
        }
        if seen_all.insert(abs.clone()) {
            links.all.push(abs);
        }
    }

    links
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/blog/post").unwrap()
    }

    #[test]
    fn anchors_split_into_pages_and_assets() {
        let html = r#"
            <a href="/about">About</a>
            <a href="/report.pdf">Report</a>
            <a href="next">Relative</a>
        "#;
        let links = extract_links(html, &base());
        assert_eq!(
            links.pages,
            vec![
                "https://example.com/about",
                "https://example.com/blog/next"
            ]
        );
        assert_eq!(links.assets, vec!["https://example.com/report.pdf"]);
    }

    #[test]
    fn skip_prefixes_and_foreign_schemes_are_dropped() {
        let html = r##"
            <a href="javascript:void(0)">x</a>
            <a href="MAILTO:x@example.com">m</a>
            <a href="#top">t</a>
            <a href="ftp://example.com/f">f</a>
            <a href="tel:+123">p</a>
        "##;
        let links = extract_links(html, &base());
        assert!(links.all.is_empty());
    }

    #[test]
    fn stylesheet_and_icon_links_are_assets() {
        let html = r#"
            <link rel="stylesheet" href="/s.css">
            <link rel="shortcut icon" href="/favicon.ico">
            <link rel="preload" href="/font.woff2" as="font">
            <link rel="canonical" href="https://example.com/blog/post">
        "#;
        let links = extract_links(html, &base());
        assert_eq!(links.assets.len(), 3);
        assert_eq!(links.pages, vec!["https://example.com/blog/post"]);
    }

    #[test]
    fn media_and_svg_references_are_assets() {
        let html = r#"
            <script src="/app.js"></script>
            <img src="/a/logo.png" data-src="/a/lazy.png">
            <video src="/v.mp4" poster="/v-poster.jpg"></video>
            <audio src="/a.mp3"></audio>
            <object data="/doc.pdf"></object>
            <svg><use xlink:href="/sprite.svg#icon"></use></svg>
        "#;
        let links = extract_links(html, &base());
        for expected in [
            "https://example.com/app.js",
            "https://example.com/a/logo.png",
            "https://example.com/a/lazy.png",
            "https://example.com/v.mp4",
            "https://example.com/v-poster.jpg",
            "https://example.com/a.mp3",
            "https://example.com/doc.pdf",
            "https://example.com/sprite.svg",
        ] {
            assert!(
                links.assets.contains(&expected.to_string()),
                "missing {expected}"
            );
        }
    }

    #[test]
    fn iframes_are_both_pages_and_assets() {
        let html = r#"<iframe src="/embed/widget"></iframe>"#;
        let links = extract_links(html, &base());
        assert_eq!(links.pages, vec!["https://example.com/embed/widget"]);
        assert_eq!(links.assets, vec!["https://example.com/embed/widget"]);
        assert_eq!(links.all.len(), 1);
    }

    #[test]
    fn srcset_entries_yield_first_tokens() {
        let html = r#"<img srcset="/a-1x.png 1x, /a-2x.png 2x, /a-wide.png 640w">"#;
        let links = extract_links(html, &base());
        assert_eq!(
            links.assets,
            vec![
                "https://example.com/a-1x.png",
                "https://example.com/a-2x.png",
                "https://example.com/a-wide.png",
            ]
        );
    }

    #[test]
    fn meta_refresh_yields_a_page() {
        let html = r#"<meta http-equiv="refresh" content="3; url=/moved">"#;
        let links = extract_links(html, &base());
        assert_eq!(links.pages, vec!["https://example.com/moved"]);
    }

    #[test]
    fn inline_styles_yield_css_assets() {
        let html = r#"
            <div style="background-image: url('/bg.png')"></div>
            <style>
              .hero { background: url("/hero.webp"); }
              @import "/extra.css";
            </style>
        "#;
        let links = extract_links(html, &base());
        for expected in [
            "https://example.com/bg.png",
            "https://example.com/hero.webp",
            "https://example.com/extra.css",
        ] {
            assert!(
                links.assets.contains(&expected.to_string()),
                "missing {expected}"
            );
        }
    }

    #[test]
    fn duplicates_are_collapsed_in_discovery_order() {
        let html = r#"
            <a href="/x">1</a>
            <a href="/x">2</a>
            <img src="/i.png"><img src="/i.png">
        "#;
        let links = extract_links(html, &base());
        assert_eq!(links.pages, vec!["https://example.com/x"]);
        assert_eq!(links.assets, vec!["https://example.com/i.png"]);
        assert_eq!(links.all.len(), 2);
    }

    #[test]
    fn srcset_parser_preserves_descriptors() {
        let entries = srcset_entries("/a.png 1x, /b.png 2x,/c.png");
        assert_eq!(
            entries,
            vec![
                ("/a.png".to_string(), Some("1x".to_string())),
                ("/b.png".to_string(), Some("2x".to_string())),
                ("/c.png".to_string(), None),
            ]
        );
    }
}
