//! Fetches context for replies and bookmarks: the linked page's title,
//! description and author, cached onto the entry at creation time.
//!
//! Lookup order for the title is JSON-LD `headline`, then `title`, then
//! `name`, then the page's `og:title`, then `<title>`, and finally the raw
//! URL. Fetching is strictly best-effort; this never returns an error.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::indieweb::html;

const TITLE_KEYS: &[&str] = &["headline", "title", "name"];
const DESCRIPTION_KEYS: &[&str] = &["description", "summary"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkedPageAuthor {
    pub name: String,
    pub url: String,
    pub photo: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkedPage {
    pub url: String,
    pub title: String,
    pub description: String,
    pub author: LinkedPageAuthor,
}

impl LinkedPage {
    /// The no-metadata fallback: the URL stands in for the title.
    fn bare(url: &str) -> Self {
        Self {
            url: url.to_string(),
            title: url.to_string(),
            description: String::new(),
            author: LinkedPageAuthor::default(),
        }
    }
}

fn json_ld_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<script[^>]*type\s*=\s*["']application/ld\+json["'][^>]*>(.*?)</script>"#)
            .expect("valid regex")
    })
}

fn title_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex"))
}

/// Fetch the target URL and extract whatever metadata it declares. Any
/// failure along the way degrades to the bare-URL fallback.
pub async fn fetch_linked_page(client: &reqwest::Client, url: &str) -> LinkedPage {
    let response = match client.get(url).send().await {
        Ok(r) if r.status().is_success() => r,
        _ => return LinkedPage::bare(url),
    };
    let body = match response.text().await {
        Ok(b) => b,
        Err(_) => return LinkedPage::bare(url),
    };
    extract_linked_page(url, &body)
}

/// Extract metadata from an already-fetched page body.
pub fn extract_linked_page(url: &str, body: &str) -> LinkedPage {
    let mut page = LinkedPage::bare(url);

    if let Some(title) = meta_content(body, "og:title").or_else(|| title_tag(body)) {
        if !title.is_empty() {
            page.title = title;
        }
    }
    if let Some(description) = meta_content(body, "og:description") {
        page.description = description;
    }

    if let Some(schema) = first_json_ld(body) {
        if let Some(title) = first_string(&schema, TITLE_KEYS) {
            page.title = title;
        }
        if let Some(description) = first_string(&schema, DESCRIPTION_KEYS) {
            page.description = description;
        }
        if let Some(author) = schema.get("author") {
            page.author = extract_author(author);
        }
    }

    page
}

/// First parseable JSON-LD object on the page. A top-level array counts as
/// its first object element.
fn first_json_ld(body: &str) -> Option<Value> {
    for captures in json_ld_re().captures_iter(body) {
        let parsed: Value = match serde_json::from_str(captures[1].trim()) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if parsed.is_object() {
            return Some(parsed);
        }
        if let Value::Array(items) = parsed {
            if let Some(obj) = items.into_iter().find(|v| v.is_object()) {
                return Some(obj);
            }
        }
    }
    None
}

fn first_string(schema: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| schema.get(*key).and_then(|v| v.as_str()))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// JSON-LD authors come as an object, an array of objects, or a bare name.
fn extract_author(author: &Value) -> LinkedPageAuthor {
    let author = match author {
        Value::Array(items) => match items.first() {
            Some(first) => first,
            None => return LinkedPageAuthor::default(),
        },
        other => other,
    };
    match author {
        Value::String(name) => LinkedPageAuthor {
            name: name.clone(),
            ..Default::default()
        },
        Value::Object(_) => LinkedPageAuthor {
            name: str_field(author, "name"),
            url: str_field(author, "url"),
            photo: str_field(author, "image"),
        },
        _ => LinkedPageAuthor::default(),
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

/// `<meta property="og:..." content="...">` in either attribute order.
fn meta_content(body: &str, property: &str) -> Option<String> {
    let patterns = [
        format!(
            r#"(?is)<meta[^>]*property\s*=\s*["']{}["'][^>]*content\s*=\s*["']([^"']*)["']"#,
            regex::escape(property)
        ),
        format!(
            r#"(?is)<meta[^>]*content\s*=\s*["']([^"']*)["'][^>]*property\s*=\s*["']{}["']"#,
            regex::escape(property)
        ),
    ];
    for pattern in &patterns {
        let re = Regex::new(pattern).expect("valid regex");
        if let Some(captures) = re.captures(body) {
            let content = html::unescape(captures[1].trim());
            if !content.is_empty() {
                return Some(content);
            }
        }
    }
    None
}

fn title_tag(body: &str) -> Option<String> {
    title_tag_re()
        .captures(body)
        .map(|c| html::strip_tags(c[1].trim()))
}
