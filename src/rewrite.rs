/// file: src/rewrite.rs
/// description: Offline link rewriting — HTML attributes, srcset entries,
/// inline and standalone CSS, and optional script stripping. Rewritten
/// output is referentially closed over the URL map.
use std::sync::LazyLock;

use lol_html::html_content::{ContentType, Element};
use lol_html::{RewriteStrSettings, element, text};
use regex::{Captures, Regex};
use url::Url;

use crate::extract::{has_skip_prefix, srcset_entries};
use crate::models::EngineError;
use crate::saver::UrlMap;

// ---------------------------------------------------------------------------
// Relative path computation
// ---------------------------------------------------------------------------

/// POSIX relative path from the directory of `from` to `to`, with a `./`
/// prefix when the result does not already begin with `.` or `/`.
pub fn relative_href(from: &str, to: &str) -> String {
    let to = to.replace('\\', "/");
    let from_dirs: Vec<&str> = match from.rsplit_once('/') {
        Some((dir, _)) => dir.split('/').collect(),
        None => Vec::new(),
    };
    let to_parts: Vec<&str> = to.split('/').collect();
    let (to_dirs, to_file) = to_parts.split_at(to_parts.len() - 1);

    let mut common = 0;
    while common < from_dirs.len() && common < to_dirs.len() && from_dirs[common] == to_dirs[common]
    {
        common += 1;
    }

    let mut parts: Vec<&str> = vec![".."; from_dirs.len() - common];
    parts.extend(&to_dirs[common..]);
    parts.push(to_file[0]);
    let rel = parts.join("/");

    if rel.starts_with('.') || rel.starts_with('/') {
        rel
    } else {
        format!("./{rel}")
    }
}

/// Resolve an attribute value against the page URL and map it to a
/// relative offline href. `None` leaves the attribute untouched. Fragments
/// survive the rewrite.
fn rewrite_target(value: &str, page_url: &Url, page_path: &str, map: &UrlMap) -> Option<String> {
    let abs = page_url.join(value.trim()).ok()?;
    if !matches!(abs.scheme(), "http" | "https") {
        return None;
    }
    let fragment = abs.fragment().map(str::to_string);
    let mut lookup = abs;
    lookup.set_fragment(None);

    let target = map.lookup(lookup.as_str())?;
    let rel = relative_href(page_path, target);
    Some(match fragment {
        Some(f) => format!("{rel}#{f}"),
        None => rel,
    })
}

// ---------------------------------------------------------------------------
// CSS rewriting
// ---------------------------------------------------------------------------

static CSS_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"url\(\s*['"]?([^'")]+)['"]?\s*\)"#).unwrap());
static CSS_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"@import\s+['"]([^'"]+)['"]"#).unwrap());

/// Every `url(...)` and `@import "..."` target in a CSS body.
pub fn css_targets(css: &str) -> Vec<String> {
    let mut targets: Vec<String> = CSS_URL
        .captures_iter(css)
        .map(|c| c[1].trim().to_string())
        .collect();
    targets.extend(CSS_IMPORT.captures_iter(css).map(|c| c[1].trim().to_string()));
    targets.retain(|t| !t.is_empty() && !has_skip_prefix(t));
    targets
}

/// Rewrite `url(...)` and `@import "..."` targets in a CSS body against
/// the URL map, using `base_url`/`own_path` as the resolution context.
/// Returns the rewritten body and whether anything changed.
pub fn rewrite_css(css: &str, base_url: &Url, own_path: &str, map: &UrlMap) -> (String, bool) {
    let mut changed = false;

    let pass1 = CSS_URL.replace_all(css, |caps: &Captures<'_>| {
        let target = caps[1].trim();
        if has_skip_prefix(target) {
            return caps[0].to_string();
        }
        match rewrite_target(target, base_url, own_path, map) {
            Some(rel) => {
                changed = true;
                format!("url(\"{rel}\")")
            }
            None => caps[0].to_string(),
        }
    });

    let pass2 = CSS_IMPORT.replace_all(&pass1, |caps: &Captures<'_>| {
        let target = caps[1].trim();
        match rewrite_target(target, base_url, own_path, map) {
            Some(rel) => {
                changed = true;
                format!("@import \"{rel}\"")
            }
            None => caps[0].to_string(),
        }
    });

    (pass2.into_owned(), changed)
}

// ---------------------------------------------------------------------------
// HTML rewriting
// ---------------------------------------------------------------------------

/// Event-handler attributes removed when scripts are stripped.
const EVENT_ATTRIBUTES: &[&str] = &[
    "onclick",
    "onload",
    "onerror",
    "onmouseover",
    "onmouseout",
    "onkeydown",
    "onkeyup",
    "onsubmit",
    "onchange",
    "onfocus",
    "onblur",
];

fn rewrite_attr(el: &mut Element<'_, '_>, attr: &str, page_url: &Url, page_path: &str, map: &UrlMap) {
    let Some(value) = el.get_attribute(attr) else {
        return;
    };
    if has_skip_prefix(&value) {
        return;
    }
    if let Some(rel) = rewrite_target(&value, page_url, page_path, map) {
        let _ = el.set_attribute(attr, &rel);
    }
}

fn rewrite_srcset(el: &mut Element<'_, '_>, page_url: &Url, page_path: &str, map: &UrlMap) {
    let Some(srcset) = el.get_attribute("srcset") else {
        return;
    };
    let rewritten: Vec<String> = srcset_entries(&srcset)
        .into_iter()
        .map(|(url, descriptor)| {
            let url = if has_skip_prefix(&url) {
                url
            } else {
                rewrite_target(&url, page_url, page_path, map).unwrap_or(url)
            };
            match descriptor {
                Some(d) => format!("{url} {d}"),
                None => url,
            }
        })
        .collect();
    let _ = el.set_attribute("srcset", &rewritten.join(", "));
}

/// Rewrite a captured page's HTML against the URL map. `page_path` is the
/// page's own saved relative path; every hit becomes a relative offline
/// href, every miss is left untouched.
pub fn rewrite_html(
    html: &str,
    page_url: &Url,
    page_path: &str,
    map: &UrlMap,
    strip_scripts: bool,
) -> Result<String, EngineError> {
    // (tag, attribute) pairs rewritten with the plain attribute rule.
    const ATTR_TABLE: &[(&str, &str)] = &[
        ("a", "href"),
        ("script", "src"),
        ("img", "src"),
        ("img", "data-src"),
        ("iframe", "src"),
        ("object", "data"),
        ("video", "src"),
        ("video", "poster"),
        ("audio", "src"),
        ("source", "src"),
    ];

    // SVG reference elements carry either `href` or legacy `xlink:href`;
    // no attribute selector, both are tried in the handler.
    const SVG_TAGS: &[&str] = &["image", "use", "feimage"];

    let mut handlers = Vec::new();

    for &(tag, attr) in ATTR_TABLE {
        let selector = format!("{tag}[{attr}]");
        handlers.push(element!(selector, move |el| {
            rewrite_attr(el, attr, page_url, page_path, map);
            Ok(())
        }));
    }

    for &tag in SVG_TAGS {
        handlers.push(element!(tag, move |el| {
            rewrite_attr(el, "href", page_url, page_path, map);
            rewrite_attr(el, "xlink:href", page_url, page_path, map);
            Ok(())
        }));
    }

    handlers.push(element!("link[href]", move |el| {
        if strip_scripts {
            let rel = el.get_attribute("rel").unwrap_or_default();
            if rel
                .split_whitespace()
                .any(|t| t.eq_ignore_ascii_case("modulepreload"))
            {
                el.remove();
                return Ok(());
            }
        }
        rewrite_attr(el, "href", page_url, page_path, map);
        Ok(())
    }));

    handlers.push(element!("img[srcset]", move |el| {
        rewrite_srcset(el, page_url, page_path, map);
        Ok(())
    }));
    handlers.push(element!("source[srcset]", move |el| {
        rewrite_srcset(el, page_url, page_path, map);
        Ok(())
    }));

    handlers.push(element!("[style]", move |el| {
        if let Some(style) = el.get_attribute("style") {
            let (rewritten, changed) = rewrite_css(&style, page_url, page_path, map);
            if changed {
                let _ = el.set_attribute("style", &rewritten);
            }
        }
        Ok(())
    }));

    // <style> text arrives in chunks; buffer until the last one, then emit
    // the rewritten body in place.
    let mut style_buffer = String::new();
    handlers.push(text!("style", move |chunk| {
        style_buffer.push_str(chunk.as_str());
        if chunk.last_in_text_node() {
            let (rewritten, _) = rewrite_css(&style_buffer, page_url, page_path, map);
            chunk.replace(&rewritten, ContentType::Html);
            style_buffer.clear();
        } else {
            chunk.remove();
        }
        Ok(())
    }));

    if strip_scripts {
        handlers.push(element!("script", |el| {
            el.remove();
            Ok(())
        }));
        handlers.push(element!("*", |el| {
            for attr in EVENT_ATTRIBUTES {
                el.remove_attribute(attr);
            }
            Ok(())
        }));
    }

    lol_html::rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: handlers,
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|e| EngineError::Rewrite(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_url() -> Url {
        Url::parse("https://example.com/").unwrap()
    }

    fn map(entries: &[(&str, &str)]) -> UrlMap {
        let mut m = UrlMap::default();
        for (url, path) in entries {
            m.insert(url, path.to_string());
        }
        m
    }

    #[test]
    fn relative_href_walks_directories() {
        assert_eq!(
            relative_href("example.com/index.html", "example.com/s.css"),
            "./s.css"
        );
        assert_eq!(
            relative_href("example.com/blog/post.html", "example.com/s.css"),
            "../s.css"
        );
        assert_eq!(
            relative_href("example.com/index.html", "example.com/a/logo.png"),
            "./a/logo.png"
        );
        assert_eq!(
            relative_href("index.html", "s.css"),
            "./s.css"
        );
        assert_eq!(
            relative_href("example.com/a/b.html", "cdn.example.com/x.js"),
            "../../cdn.example.com/x.js"
        );
    }

    #[test]
    fn rewrites_mapped_attributes_and_leaves_misses() {
        let m = map(&[
            ("https://example.com/s.css", "example.com/s.css"),
            ("https://example.com/a/logo.png", "example.com/a/logo.png"),
        ]);
        let html = r#"<link rel="stylesheet" href="/s.css"><img src="/a/logo.png"><img src="/missing.png">"#;
        let out = rewrite_html(html, &page_url(), "example.com/index.html", &m, false).unwrap();
        assert!(out.contains(r#"href="./s.css""#));
        assert!(out.contains(r#"src="./a/logo.png""#));
        assert!(out.contains(r#"src="/missing.png""#));
    }

    #[test]
    fn skip_prefixed_values_are_untouched() {
        let m = map(&[("https://example.com/x", "example.com/x.html")]);
        let html = r##"<a href="javascript:void(0)">j</a><a href="#top">t</a><a href="mailto:a@b.c">m</a>"##;
        let out = rewrite_html(html, &page_url(), "example.com/index.html", &m, false).unwrap();
        assert!(out.contains("javascript:void(0)"));
        assert!(out.contains(r##"href="#top""##));
        assert!(out.contains("mailto:a@b.c"));
    }

    #[test]
    fn fragments_survive_rewriting() {
        let m = map(&[("https://example.com/about", "example.com/about.html")]);
        let html = r#"<a href="/about#team">team</a>"#;
        let out = rewrite_html(html, &page_url(), "example.com/index.html", &m, false).unwrap();
        assert!(out.contains(r#"href="./about.html#team""#));
    }

    #[test]
    fn srcset_descriptors_are_preserved() {
        let m = map(&[
            ("https://example.com/a-1x.png", "example.com/a-1x.png"),
            ("https://example.com/a-2x.png", "example.com/a-2x.png"),
        ]);
        let html = r#"<img srcset="/a-1x.png 1x, /a-2x.png 2x, /miss.png 3x">"#;
        let out = rewrite_html(html, &page_url(), "example.com/index.html", &m, false).unwrap();
        assert!(out.contains("./a-1x.png 1x"));
        assert!(out.contains("./a-2x.png 2x"));
        assert!(out.contains("/miss.png 3x"));
    }

    #[test]
    fn style_attribute_and_style_body_are_rewritten() {
        let m = map(&[
            ("https://example.com/bg.png", "example.com/bg.png"),
            ("https://example.com/extra.css", "example.com/extra.css"),
        ]);
        let html = r#"<div style="background: url('/bg.png')"></div><style>@import "/extra.css"; .x { background: url(/bg.png); }</style>"#;
        let out = rewrite_html(html, &page_url(), "example.com/index.html", &m, false).unwrap();
        assert!(out.contains(r#"url(&quot;./bg.png&quot;)"#) || out.contains(r#"url("./bg.png")"#));
        assert!(out.contains(r#"@import "./extra.css""#));
    }

    #[test]
    fn strip_scripts_removes_scripts_handlers_and_modulepreload() {
        let m = UrlMap::default();
        let html = r#"<script src="/app.js"></script><link rel="modulepreload" href="/m.js"><body onload="init()"><div onclick="go()">x</div></body>"#;
        let out = rewrite_html(html, &page_url(), "example.com/index.html", &m, true).unwrap();
        assert!(!out.contains("<script"));
        assert!(!out.contains("modulepreload"));
        assert!(!out.contains("onload"));
        assert!(!out.contains("onclick"));
        assert!(out.contains("<div"));
    }

    #[test]
    fn css_file_rewrite_reports_change() {
        let m = map(&[("https://example.com/fonts/a.woff2", "example.com/fonts/a.woff2")]);
        let base = Url::parse("https://example.com/css/site.css").unwrap();
        let css = "@font-face { src: url(/fonts/a.woff2); } .x { background: url(data:image/png;base64,xx); }";
        let (out, changed) = rewrite_css(css, &base, "example.com/css/site.css", &m);
        assert!(changed);
        assert!(out.contains(r#"url("../fonts/a.woff2")"#));
        // data: URIs are never rewritten.
        assert!(out.contains("url(data:image/png;base64,xx)"));
    }

    #[test]
    fn css_without_hits_is_unchanged() {
        let m = UrlMap::default();
        let base = Url::parse("https://example.com/css/site.css").unwrap();
        let css = ".x { background: url(/nope.png); }";
        let (out, changed) = rewrite_css(css, &base, "example.com/css/site.css", &m);
        assert!(!changed);
        assert_eq!(out, css);
    }

    #[test]
    fn css_targets_finds_urls_and_imports() {
        let css = r#"@import "/a.css"; .x { background: url('/b.png'); } .y { background: url(/c.gif); }"#;
        let targets = css_targets(css);
        assert!(targets.contains(&"/a.css".to_string()));
        assert!(targets.contains(&"/b.png".to_string()));
        assert!(targets.contains(&"/c.gif".to_string()));
    }
}
