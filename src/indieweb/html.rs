//! Just enough HTML scanning for the protocol layer: plain-text extraction,
//! entity unescaping and link discovery. Content here is either our own
//! rendered output or remote pages we only mine for metadata, so a full DOM
//! parser buys nothing.

use std::sync::OnceLock;

use regex::Regex;

fn script_style_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").expect("valid regex")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("valid regex"))
}

fn href_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)<a\s[^>]*href\s*=\s*["']([^"']+)["']"#).expect("valid regex")
    })
}

/// Plain text of an HTML fragment: script/style dropped, tags stripped,
/// entities unescaped.
pub fn strip_tags(html: &str) -> String {
    let without_blocks = script_style_re().replace_all(html, "");
    let without_tags = tag_re().replace_all(&without_blocks, "");
    unescape(&without_tags)
}

/// Decode the handful of entities our own renderer and typical remote pages
/// produce.
pub fn unescape(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

/// All `<a href>` targets in document order.
pub fn extract_hrefs(html: &str) -> Vec<String> {
    href_re()
        .captures_iter(html)
        .map(|c| c[1].to_string())
        .collect()
}
