//! Outbound webmentions: link discovery, endpoint discovery, delivery, and
//! idempotent per-(entry, target) bookkeeping.
//!
//! Most targets are not webmention-aware; a target without an endpoint is
//! skipped silently. Per the webmention spec any 2xx response counts as a
//! delivered mention. Records are upserted on the (entry, target) unique
//! constraint, so repeated publish cycles and racing publishes alike leave
//! at most one record per pair.

use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use rusqlite::params;
use url::Url;

use crate::db::models::{Entry, PostKind};
use crate::error::{AppError, AppResult};
use crate::indieweb::html;
use crate::state::DbPool;

#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub target: String,
    pub success: bool,
}

/// Collect webmention targets for a piece of published content: every
/// `<a href>` plus any protocol-mandated extras (a reply's target), minus
/// the source itself and anything on a local domain, deduplicated in
/// first-seen order.
pub fn find_target_links(
    content: &str,
    extra_targets: &[String],
    source_url: &str,
    local_domains: &[String],
) -> Vec<String> {
    let mut targets = Vec::new();
    let candidates = html::extract_hrefs(content)
        .into_iter()
        .chain(extra_targets.iter().cloned());

    for candidate in candidates {
        if candidate == source_url || targets.contains(&candidate) {
            continue;
        }
        if let Ok(parsed) = Url::parse(&candidate) {
            let host = parsed.host_str().unwrap_or("");
            if local_domains.iter().any(|d| d.eq_ignore_ascii_case(host)) {
                continue;
            }
            targets.push(candidate);
        }
    }
    targets
}

fn link_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<([^>]*)>\s*;[^,]*rel\s*=\s*"?([^",]+)"?"#).expect("valid regex")
    })
}

fn link_or_a_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<(?:link|a)\s[^>]*>").expect("valid regex"))
}

fn attr_re(name: &str) -> Regex {
    Regex::new(&format!(
        r#"(?i){}\s*=\s*["']([^"']*)["']"#,
        regex::escape(name)
    ))
    .expect("valid regex")
}

/// Endpoint declared in a Link header value, resolved against the target.
pub fn endpoint_from_link_header(base: &Url, value: &str) -> Option<String> {
    for captures in link_header_re().captures_iter(value) {
        if captures[2].split_whitespace().any(|r| r == "webmention") {
            return resolve(base, &captures[1]);
        }
    }
    None
}

/// First `<link>`/`<a>` with `rel~=webmention`, in document order. An empty
/// href means the page itself is the endpoint.
pub fn endpoint_from_html(base: &Url, body: &str) -> Option<String> {
    let rel_re = attr_re("rel");
    let href_re = attr_re("href");
    for tag in link_or_a_tag_re().find_iter(body) {
        let tag = tag.as_str();
        let rels = rel_re
            .captures(tag)
            .map(|c| c[1].to_string())
            .unwrap_or_default();
        if rels.split_whitespace().any(|r| r == "webmention") {
            let href = href_re.captures(tag).map(|c| c[1].to_string());
            return resolve(base, href.as_deref().unwrap_or(""));
        }
    }
    None
}

fn resolve(base: &Url, href: &str) -> Option<String> {
    if href.is_empty() {
        return Some(base.to_string());
    }
    base.join(href).map(|u| u.to_string()).ok()
}

/// Fetch a target and look for its webmention endpoint. Link headers win
/// over HTML declarations. Any failure means "no endpoint".
pub async fn discover_endpoint(client: &reqwest::Client, target: &str) -> Option<String> {
    let base = Url::parse(target).ok()?;
    let response = match client.get(target).send().await {
        Ok(r) if r.status().is_success() => r,
        _ => return None,
    };

    for header in response.headers().get_all(reqwest::header::LINK) {
        if let Ok(value) = header.to_str() {
            if let Some(endpoint) = endpoint_from_link_header(&base, value) {
                return Some(endpoint);
            }
        }
    }

    let body = response.text().await.ok()?;
    endpoint_from_html(&base, &body)
}

/// Deliver one webmention. Returns (success, response body); transport
/// errors are failures with an empty body.
pub async fn send_webmention(
    client: &reqwest::Client,
    endpoint: &str,
    source: &str,
    target: &str,
) -> (bool, String) {
    let response = client
        .post(endpoint)
        .form(&[("source", source), ("target", target)])
        .send()
        .await;
    match response {
        // Per webmention spec: any 2xx response code MUST be considered a
        // success.
        Ok(r) => {
            let success = r.status().is_success();
            let body = r.text().await.unwrap_or_default();
            (success, body)
        }
        Err(_) => (false, String::new()),
    }
}

/// Record a delivery outcome, keeping at most one row per (entry, target).
pub fn record_send(
    pool: &DbPool,
    entry_id: &str,
    target: &str,
    success: bool,
    response_body: &str,
) -> AppResult<()> {
    let conn = pool.get()?;
    upsert_send(&conn, entry_id, target, success, response_body)
}

fn upsert_send(
    conn: &rusqlite::Connection,
    entry_id: &str,
    target: &str,
    success: bool,
    response_body: &str,
) -> AppResult<()> {
    conn.execute(
        "INSERT INTO webmention_sends (id, entry_id, target, sent_at, success, response_body)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(entry_id, target) DO UPDATE SET
             sent_at = excluded.sent_at,
             success = excluded.success,
             response_body = excluded.response_body",
        params![
            uuid::Uuid::now_v7().to_string(),
            entry_id,
            target,
            Utc::now().to_rfc3339(),
            success,
            response_body,
        ],
    )?;
    Ok(())
}

/// Send webmentions for a published entry to every outbound link that
/// declares an endpoint. Called on every publish; failures are recorded,
/// never raised.
pub async fn send_webmentions(
    client: &reqwest::Client,
    pool: &DbPool,
    entry: &Entry,
    source_url: &str,
    local_domains: &[String],
) -> AppResult<Vec<SendOutcome>> {
    let mut extra_targets = Vec::new();
    if entry.kind == PostKind::Reply {
        let conn = pool.get()?;
        let in_reply_to: Option<String> = conn
            .query_row(
                "SELECT in_reply_to FROM replies WHERE entry_id = ?1",
                params![entry.id],
                |row| row.get(0),
            )
            .ok();
        extra_targets.extend(in_reply_to);
    }

    let targets = find_target_links(&entry.content, &extra_targets, source_url, local_domains);

    let mut outcomes = Vec::new();
    for target in targets {
        let endpoint = match discover_endpoint(client, &target).await {
            Some(endpoint) => endpoint,
            None => {
                tracing::debug!(url = %target, "No webmention endpoint, skipping");
                continue;
            }
        };

        let (success, body) = send_webmention(client, &endpoint, source_url, &target).await;
        record_send(pool, &entry.id, &target, success, &body)?;
        tracing::info!(url = %target, success, "Webmention sent");
        outcomes.push(SendOutcome { target, success });
    }
    Ok(outcomes)
}

/// Post an entry to a bridgy-style syndication endpoint. Bridgy accepts a
/// single webmention per post, so a record that already succeeded raises
/// `AlreadySentWebmention`; callers treat that as a no-op. On success the
/// syndicated copy's URL is stored as a syndication link.
pub async fn post_to_bridgy(
    client: &reqwest::Client,
    pool: &DbPool,
    entry_id: &str,
    source_url: &str,
    bridgy_target: &str,
) -> AppResult<Option<String>> {
    {
        let conn = pool.get()?;
        let already_succeeded: bool = conn
            .query_row(
                "SELECT success FROM webmention_sends WHERE entry_id = ?1 AND target = ?2",
                params![entry_id, bridgy_target],
                |row| row.get(0),
            )
            .unwrap_or(false);
        if already_succeeded {
            return Err(AppError::AlreadySentWebmention);
        }
    }

    let endpoint = discover_endpoint(client, bridgy_target)
        .await
        .unwrap_or_else(|| bridgy_target.to_string());

    let response = client
        .post(&endpoint)
        .form(&[("source", source_url), ("target", bridgy_target)])
        .send()
        .await;
    let (success, location, body) = match response {
        Ok(r) => {
            let success = r.status().is_success();
            let location = r
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            (success, location, r.text().await.unwrap_or_default())
        }
        Err(_) => (false, None, String::new()),
    };

    record_send(pool, entry_id, bridgy_target, success, &body)?;
    if !success {
        return Ok(None);
    }

    // Bridgy answers with the syndicated copy's location.
    let syndication_url = location.or_else(|| {
        serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("url").and_then(|u| u.as_str()).map(String::from))
    });
    if let Some(url) = &syndication_url {
        let conn = pool.get()?;
        conn.execute(
            "INSERT OR IGNORE INTO syndications (id, entry_id, url) VALUES (?1, ?2, ?3)",
            params![uuid::Uuid::now_v7().to_string(), entry_id, url],
        )?;
    }
    Ok(syndication_url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn seed_entry(pool: &DbPool, id: &str) {
        let conn = pool.get().unwrap();
        conn.execute(
            "INSERT INTO entries (id, author_id, kind, status) VALUES (?1, 'owner', 'note', 'published')",
            params![id],
        )
        .unwrap();
    }

    // --- Link discovery ---

    #[test]
    fn find_links_excludes_source_and_local_domains() {
        let content = r#"
            <a href="https://other.example/post">other</a>
            <a href="https://me.example/entries/1">self link</a>
            <a href="https://me.example/entries/2">another self page</a>
        "#;
        let targets = find_target_links(
            content,
            &[],
            "https://me.example/entries/1",
            &["me.example".to_string()],
        );
        assert_eq!(targets, vec!["https://other.example/post"]);
    }

    #[test]
    fn duplicate_links_produce_one_target() {
        let content = r#"
            <a href="https://other.example/post">one</a>
            <a href="https://other.example/post">two</a>
        "#;
        let targets = find_target_links(content, &[], "https://me.example/e/1", &[]);
        assert_eq!(targets.len(), 1);
    }

    #[test]
    fn reply_target_is_always_included() {
        let targets = find_target_links(
            "<p>no links</p>",
            &["https://other.example/post".to_string()],
            "https://me.example/e/1",
            &[],
        );
        assert_eq!(targets, vec!["https://other.example/post"]);
    }

    #[test]
    fn relative_hrefs_are_ignored() {
        let targets = find_target_links(
            r#"<a href="/local/page">x</a>"#,
            &[],
            "https://me.example/e/1",
            &[],
        );
        assert!(targets.is_empty());
    }

    // --- Endpoint discovery parsing ---

    #[test]
    fn link_header_endpoint_is_found() {
        let base = Url::parse("https://target.example/post").unwrap();
        assert_eq!(
            endpoint_from_link_header(&base, r#"<https://target.example/wm>; rel="webmention""#),
            Some("https://target.example/wm".to_string())
        );
    }

    #[test]
    fn link_header_with_multiple_rels() {
        let base = Url::parse("https://target.example/post").unwrap();
        assert_eq!(
            endpoint_from_link_header(&base, r#"</wm>; rel="webmention somethingelse""#),
            Some("https://target.example/wm".to_string())
        );
    }

    #[test]
    fn link_header_without_webmention_rel_is_ignored() {
        let base = Url::parse("https://target.example/post").unwrap();
        assert_eq!(
            endpoint_from_link_header(&base, r#"<https://target.example/style>; rel="stylesheet""#),
            None
        );
    }

    #[test]
    fn html_link_tag_endpoint_is_found() {
        let base = Url::parse("https://target.example/post").unwrap();
        let body = r#"<html><head>
            <link rel="stylesheet" href="/style.css">
            <link rel="webmention" href="/webmention">
        </head></html>"#;
        assert_eq!(
            endpoint_from_html(&base, body),
            Some("https://target.example/webmention".to_string())
        );
    }

    #[test]
    fn html_a_tag_endpoint_is_found() {
        let base = Url::parse("https://target.example/post").unwrap();
        let body = r#"<a rel="webmention" href="https://wm.example/endpoint">webmention</a>"#;
        assert_eq!(
            endpoint_from_html(&base, body),
            Some("https://wm.example/endpoint".to_string())
        );
    }

    #[test]
    fn empty_href_means_the_page_itself() {
        let base = Url::parse("https://target.example/post").unwrap();
        let body = r#"<link rel="webmention" href="">"#;
        assert_eq!(
            endpoint_from_html(&base, body),
            Some("https://target.example/post".to_string())
        );
    }

    #[test]
    fn page_without_declaration_has_no_endpoint() {
        let base = Url::parse("https://target.example/post").unwrap();
        assert_eq!(endpoint_from_html(&base, "<p>plain page</p>"), None);
    }

    // --- Record bookkeeping ---

    #[test]
    fn record_send_is_idempotent_per_target() {
        let pool = test_pool();
        seed_entry(&pool, "e1");

        record_send(&pool, "e1", "https://other.example/post", false, "").unwrap();
        record_send(&pool, "e1", "https://other.example/post", true, "accepted").unwrap();

        let conn = pool.get().unwrap();
        let (count, success, body): (i64, bool, String) = conn
            .query_row(
                "SELECT COUNT(*), MAX(success), MAX(response_body) FROM webmention_sends
                 WHERE entry_id = 'e1' AND target = 'https://other.example/post'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert!(success);
        assert_eq!(body, "accepted");
    }

    #[test]
    fn records_for_different_targets_coexist() {
        let pool = test_pool();
        seed_entry(&pool, "e1");

        record_send(&pool, "e1", "https://a.example/1", true, "").unwrap();
        record_send(&pool, "e1", "https://b.example/2", false, "").unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM webmention_sends WHERE entry_id = 'e1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn bridgy_resend_after_success_is_rejected() {
        let pool = test_pool();
        seed_entry(&pool, "e1");
        record_send(&pool, "e1", "https://brid.gy/publish/mastodon", true, "{}").unwrap();

        let client = reqwest::Client::new();
        let result = post_to_bridgy(
            &client,
            &pool,
            "e1",
            "https://me.example/entries/e1",
            "https://brid.gy/publish/mastodon",
        )
        .await;
        assert!(matches!(result, Err(AppError::AlreadySentWebmention)));
    }
}
