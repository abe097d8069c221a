//! Inbound webmention processing: resolve which local entry a webmention
//! targets, mine the remote page for its microformat comment data, and keep
//! a moderation record per (webmention, entry) pair.
//!
//! An unresolvable webmention is logged and dropped; it is irrelevant, not
//! an error. A redelivered webmention resets its moderation record to
//! pending and replaces the cached comment data, because the remote content
//! changed and the earlier decision no longer applies to it.

use std::sync::OnceLock;

use regex::Regex;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::db::models::IncomingWebmention;
use crate::error::{AppError, AppResult};
use crate::indieweb::html;
use crate::state::DbPool;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommentAuthor {
    pub name: String,
    pub url: String,
    pub photo: String,
}

/// Cached parse of a remote comment, stored on the moderation record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommentData {
    pub author: CommentAuthor,
    pub content: String,
    pub published: Option<String>,
    pub url: Option<String>,
    /// like | reply | repost | mention
    pub comment_type: String,
}

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}",
        )
        .expect("valid regex")
    })
}

fn h_entry_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)<[a-z][a-z0-9]*\s[^>]*class\s*=\s*["'][^"']*\bh-entry\b"#)
            .expect("valid regex")
    })
}

/// Persist (or refresh) a raw inbound webmention. Redelivery for the same
/// (source, target) pair replaces the stored body and clears the reviewed
/// flag.
pub fn store_incoming(
    pool: &DbPool,
    source: &str,
    response_to: &str,
    response_body: &str,
) -> AppResult<IncomingWebmention> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO incoming_webmentions (id, source, response_to, response_body, reviewed)
         VALUES (?1, ?2, ?3, ?4, 0)
         ON CONFLICT(source, response_to) DO UPDATE SET
             response_body = excluded.response_body,
             reviewed = 0",
        params![
            uuid::Uuid::now_v7().to_string(),
            source,
            response_to,
            response_body,
        ],
    )?;
    conn.query_row(
        "SELECT id, source, response_to, response_body, reviewed, created_at
         FROM incoming_webmentions WHERE source = ?1 AND response_to = ?2",
        params![source, response_to],
        |row| {
            Ok(IncomingWebmention {
                id: row.get(0)?,
                source: row.get(1)?,
                response_to: row.get(2)?,
                response_body: row.get(3)?,
                reviewed: row.get(4)?,
                created_at: row.get(5)?,
            })
        },
    )
    .map_err(AppError::from)
}

/// Resolve which local entry a URL refers to: an embedded entry id first,
/// then the imported legacy-permalink table.
pub fn resolve_entry_for_url(conn: &rusqlite::Connection, url: &str) -> Option<String> {
    if let Some(m) = uuid_re().find(url) {
        let id = m.as_str().to_lowercase();
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM entries WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .ok();
        if found.is_some() {
            return found;
        }
    }

    let path = Url::parse(url).ok().map(|u| u.path().to_string())?;
    conn.query_row(
        "SELECT entry_id FROM legacy_paths WHERE path = ?1",
        params![path],
        |row| row.get(0),
    )
    .ok()
}

/// Process a stored webmention: resolve the entry it targets and create or
/// reset its moderation record. Returns the moderation record id, or None
/// when the webmention resolves to no local entry and is discarded.
pub fn create_moderation_record(pool: &DbPool, webmention_id: &str) -> AppResult<Option<String>> {
    let mut conn = pool.get()?;

    let webmention = conn
        .query_row(
            "SELECT id, source, response_to, response_body, reviewed, created_at
             FROM incoming_webmentions WHERE id = ?1",
            params![webmention_id],
            |row| {
                Ok(IncomingWebmention {
                    id: row.get(0)?,
                    source: row.get(1)?,
                    response_to: row.get(2)?,
                    response_body: row.get(3)?,
                    reviewed: row.get(4)?,
                    created_at: row.get(5)?,
                })
            },
        )
        .map_err(|_| AppError::NotFound)?;

    let entry_id = match resolve_entry_for_url(&conn, &webmention.response_to) {
        Some(id) => id,
        None => {
            tracing::info!(
                url = %webmention.response_to,
                "Discarding webmention for unknown target"
            );
            return Ok(None);
        }
    };

    let comment = extract_comment(
        &webmention.response_body,
        &webmention.source,
        &webmention.response_to,
    );
    let comment_json = serde_json::to_string(&comment)?;

    let tx = conn.transaction()?;
    // Content changed on redelivery, so any earlier approval is void: the
    // upsert always lands the record back on pending.
    tx.execute(
        "INSERT INTO webmention_moderations (id, webmention_id, entry_id, approval_status, comment_json)
         VALUES (?1, ?2, ?3, NULL, ?4)
         ON CONFLICT(webmention_id, entry_id) DO UPDATE SET
             approval_status = NULL,
             comment_json = excluded.comment_json,
             updated_at = datetime('now')",
        params![
            uuid::Uuid::now_v7().to_string(),
            webmention.id,
            entry_id,
            comment_json,
        ],
    )?;
    let moderation_id: String = tx.query_row(
        "SELECT id FROM webmention_moderations WHERE webmention_id = ?1 AND entry_id = ?2",
        params![webmention.id, entry_id],
        |row| row.get(0),
    )?;
    tx.commit()?;

    Ok(Some(moderation_id))
}

/// Approve or disapprove a moderation record, marking the underlying
/// webmention reviewed in the same transaction.
pub fn set_approval(pool: &DbPool, moderation_id: &str, approved: bool) -> AppResult<()> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;

    let updated = tx.execute(
        "UPDATE webmention_moderations
         SET approval_status = ?1, updated_at = datetime('now')
         WHERE id = ?2",
        params![approved, moderation_id],
    )?;
    if updated == 0 {
        return Err(AppError::NotFound);
    }
    tx.execute(
        "UPDATE incoming_webmentions SET reviewed = 1
         WHERE id = (SELECT webmention_id FROM webmention_moderations WHERE id = ?1)",
        params![moderation_id],
    )?;
    tx.commit()?;
    Ok(())
}

/// Extract comment data from a remote page.
///
/// A page may hold several h-entries; the one whose like-of/in-reply-to/
/// repost-of points at our target is the comment, and which of those
/// properties matched decides the comment type. With no match the first
/// h-entry is used and the mention is generic.
pub fn extract_comment(body: &str, source: &str, target: &str) -> CommentData {
    let blocks = h_entry_blocks(body);

    let mut chosen: Option<(&str, String)> = None;
    for block in &blocks {
        if let Some(kind) = target_match(block, target) {
            chosen = Some((*block, kind));
            break;
        }
    }
    let (block, comment_type) = match chosen {
        Some((block, kind)) => (block, kind),
        None => match blocks.first() {
            Some(block) => (*block, "mention".to_string()),
            None => {
                return CommentData {
                    url: Some(source.to_string()),
                    comment_type: "mention".to_string(),
                    ..Default::default()
                }
            }
        },
    };

    CommentData {
        author: extract_author(block),
        content: extract_content(block),
        published: attr_of_class(block, "dt-published", "datetime"),
        url: attr_of_class(block, "u-url", "href").or_else(|| Some(source.to_string())),
        comment_type,
    }
}

/// Split a document into h-entry regions: each runs from its root tag to the
/// start of the next h-entry (or the end of the document). Good enough to
/// scope property scans per entry.
fn h_entry_blocks(body: &str) -> Vec<&str> {
    let starts: Vec<usize> = h_entry_re().find_iter(body).map(|m| m.start()).collect();
    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(body.len());
            &body[start..end]
        })
        .collect()
}

/// Which response property of this block points at the target, if any.
fn target_match(block: &str, target: &str) -> Option<String> {
    for (class, kind) in [
        ("u-like-of", "like"),
        ("u-in-reply-to", "reply"),
        ("u-repost-of", "repost"),
    ] {
        if let Some(href) = attr_of_class(block, class, "href") {
            if href == target {
                return Some(kind.to_string());
            }
        }
    }
    None
}

/// First `attr` value of a tag carrying `class_name`, regardless of
/// attribute order within the tag.
fn attr_of_class(block: &str, class_name: &str, attr: &str) -> Option<String> {
    let tag_re = Regex::new(&format!(
        r#"(?is)<[a-z][a-z0-9]*\s[^>]*class\s*=\s*["'][^"']*\b{}\b[^"']*["'][^>]*>"#,
        regex::escape(class_name)
    ))
    .expect("valid regex");
    let attr_re = Regex::new(&format!(
        r#"(?i){}\s*=\s*["']([^"']*)["']"#,
        regex::escape(attr)
    ))
    .expect("valid regex");

    for tag in tag_re.find_iter(block) {
        if let Some(captures) = attr_re.captures(tag.as_str()) {
            return Some(captures[1].to_string());
        }
    }
    None
}

fn extract_author(block: &str) -> CommentAuthor {
    // The common compact card: <a class="p-author h-card" href="...">Name</a>
    let a_re = Regex::new(
        r#"(?is)<a\s[^>]*class\s*=\s*["'][^"']*\bp-author\b[^"']*["'][^>]*>(.*?)</a>"#,
    )
    .expect("valid regex");
    if let Some(captures) = a_re.captures(block) {
        let inner = &captures[1];
        let tag = captures.get(0).map(|m| m.as_str()).unwrap_or("");
        let href = Regex::new(r#"(?i)href\s*=\s*["']([^"']*)["']"#)
            .expect("valid regex")
            .captures(tag)
            .map(|c| c[1].to_string())
            .unwrap_or_default();
        let photo = attr_of_class(inner, "u-photo", "src").unwrap_or_default();
        let name = html::strip_tags(inner).trim().to_string();
        return CommentAuthor {
            name,
            url: href,
            photo,
        };
    }

    // Expanded card: scope scans to everything after the p-author tag.
    let marker_re = Regex::new(r#"(?is)<[a-z][a-z0-9]*\s[^>]*class\s*=\s*["'][^"']*\bp-author\b"#)
        .expect("valid regex");
    if let Some(m) = marker_re.find(block) {
        let region = &block[m.start()..];
        let name = text_of_class(region, "p-name").unwrap_or_default();
        let url = attr_of_class(region, "u-url", "href").unwrap_or_default();
        let photo = attr_of_class(region, "u-photo", "src").unwrap_or_default();
        return CommentAuthor { name, url, photo };
    }

    CommentAuthor::default()
}

fn extract_content(block: &str) -> String {
    for tag in ["div", "p", "span", "section", "article"] {
        let re = Regex::new(&format!(
            r#"(?is)<{tag}\s[^>]*class\s*=\s*["'][^"']*\be-content\b[^"']*["'][^>]*>(.*?)</{tag}>"#,
        ))
        .expect("valid regex");
        if let Some(captures) = re.captures(block) {
            return html::strip_tags(&captures[1]).trim().to_string();
        }
    }
    // p-content fallback used by plain-text notes.
    text_of_class(block, "p-content").unwrap_or_default()
}

fn text_of_class(block: &str, class_name: &str) -> Option<String> {
    for tag in ["span", "div", "p", "a"] {
        let re = Regex::new(&format!(
            r#"(?is)<{tag}\s[^>]*class\s*=\s*["'][^"']*\b{}\b[^"']*["'][^>]*>(.*?)</{tag}>"#,
            regex::escape(class_name)
        ))
        .expect("valid regex");
        if let Some(captures) = re.captures(block) {
            return Some(html::strip_tags(&captures[1]).trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    const TARGET: &str = "https://me.example/entries/0190a0b0-aaaa-7bbb-8ccc-000000000001";

    fn seed_entry(pool: &DbPool, id: &str) {
        let conn = pool.get().unwrap();
        conn.execute(
            "INSERT INTO entries (id, author_id, kind, status) VALUES (?1, 'owner', 'note', 'published')",
            params![id],
        )
        .unwrap();
    }

    fn reply_page(content: &str) -> String {
        format!(
            r#"<html><body>
            <article class="h-entry">
                <a class="p-author h-card" href="https://alice.example/">Alice</a>
                <div class="e-content">{content}</div>
                <a class="u-in-reply-to" href="{TARGET}">in reply to</a>
                <time class="dt-published" datetime="2024-06-01T10:00:00Z">June 1</time>
                <a class="u-url" href="https://alice.example/notes/7">permalink</a>
            </article>
            </body></html>"#
        )
    }

    // --- Entry resolution ---

    #[test]
    fn resolves_entry_by_embedded_uuid() {
        let pool = test_pool();
        seed_entry(&pool, "0190a0b0-aaaa-7bbb-8ccc-000000000001");
        let conn = pool.get().unwrap();
        assert_eq!(
            resolve_entry_for_url(&conn, TARGET).as_deref(),
            Some("0190a0b0-aaaa-7bbb-8ccc-000000000001")
        );
    }

    #[test]
    fn falls_back_to_legacy_path() {
        let pool = test_pool();
        seed_entry(&pool, "0190a0b0-aaaa-7bbb-8ccc-000000000002");
        let conn = pool.get().unwrap();
        conn.execute(
            "INSERT INTO legacy_paths (path, entry_id) VALUES ('/2015/03/old-post', '0190a0b0-aaaa-7bbb-8ccc-000000000002')",
            [],
        )
        .unwrap();
        assert_eq!(
            resolve_entry_for_url(&conn, "https://me.example/2015/03/old-post").as_deref(),
            Some("0190a0b0-aaaa-7bbb-8ccc-000000000002")
        );
    }

    #[test]
    fn unknown_url_resolves_to_nothing() {
        let pool = test_pool();
        let conn = pool.get().unwrap();
        assert!(resolve_entry_for_url(&conn, "https://me.example/nope").is_none());
    }

    // --- Comment extraction ---

    #[test]
    fn extracts_reply_comment() {
        let comment = extract_comment(
            &reply_page("Great <b>post</b>!"),
            "https://alice.example/notes/7",
            TARGET,
        );
        assert_eq!(comment.comment_type, "reply");
        assert_eq!(comment.content, "Great post!");
        assert_eq!(comment.author.name, "Alice");
        assert_eq!(comment.author.url, "https://alice.example/");
        assert_eq!(comment.published.as_deref(), Some("2024-06-01T10:00:00Z"));
        assert_eq!(comment.url.as_deref(), Some("https://alice.example/notes/7"));
    }

    #[test]
    fn classifies_likes_and_reposts() {
        let like = format!(
            r#"<div class="h-entry"><a class="u-like-of" href="{TARGET}">liked</a></div>"#
        );
        assert_eq!(
            extract_comment(&like, "https://a.example/1", TARGET).comment_type,
            "like"
        );

        let repost = format!(
            r#"<div class="h-entry"><a class="u-repost-of" href="{TARGET}">reposted</a></div>"#
        );
        assert_eq!(
            extract_comment(&repost, "https://a.example/1", TARGET).comment_type,
            "repost"
        );
    }

    #[test]
    fn entry_addressing_our_target_wins_over_first() {
        let body = format!(
            r#"
            <div class="h-entry">
                <a class="u-in-reply-to" href="https://someone-else.example/post">other</a>
                <div class="e-content">Wrong one</div>
            </div>
            <div class="h-entry">
                <a class="u-in-reply-to" href="{TARGET}">ours</a>
                <div class="e-content">Right one</div>
            </div>"#
        );
        let comment = extract_comment(&body, "https://a.example/1", TARGET);
        assert_eq!(comment.content, "Right one");
        assert_eq!(comment.comment_type, "reply");
    }

    #[test]
    fn no_matching_entry_is_a_generic_mention() {
        let body = r#"<div class="h-entry"><div class="e-content">Just a link.</div></div>"#;
        let comment = extract_comment(body, "https://a.example/1", TARGET);
        assert_eq!(comment.comment_type, "mention");
        assert_eq!(comment.content, "Just a link.");
    }

    #[test]
    fn page_without_h_entry_still_yields_a_mention() {
        let comment = extract_comment("<p>plain page</p>", "https://a.example/1", TARGET);
        assert_eq!(comment.comment_type, "mention");
        assert_eq!(comment.url.as_deref(), Some("https://a.example/1"));
        assert!(comment.content.is_empty());
    }

    #[test]
    fn expanded_author_card_is_parsed() {
        let body = format!(
            r#"<article class="h-entry">
                <span class="p-author h-card">
                    <img class="u-photo" src="https://bob.example/b.jpg">
                    <a class="u-url" href="https://bob.example/"><span class="p-name">Bob</span></a>
                </span>
                <div class="e-content">Hi</div>
                <a class="u-in-reply-to" href="{TARGET}">re</a>
            </article>"#
        );
        let comment = extract_comment(&body, "https://bob.example/1", TARGET);
        assert_eq!(comment.author.name, "Bob");
        assert_eq!(comment.author.url, "https://bob.example/");
        assert_eq!(comment.author.photo, "https://bob.example/b.jpg");
    }

    // --- Ingestion and moderation ---

    #[test]
    fn ingest_creates_pending_moderation() {
        let pool = test_pool();
        seed_entry(&pool, "0190a0b0-aaaa-7bbb-8ccc-000000000001");

        let wm = store_incoming(
            &pool,
            "https://alice.example/notes/7",
            TARGET,
            &reply_page("First version"),
        )
        .unwrap();
        let moderation_id = create_moderation_record(&pool, &wm.id).unwrap().unwrap();

        let conn = pool.get().unwrap();
        let (approval, json): (Option<bool>, String) = conn
            .query_row(
                "SELECT approval_status, comment_json FROM webmention_moderations WHERE id = ?1",
                params![moderation_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(approval, None);
        assert!(json.contains("First version"));
    }

    #[test]
    fn unresolvable_webmention_is_discarded() {
        let pool = test_pool();
        let wm = store_incoming(
            &pool,
            "https://alice.example/notes/7",
            "https://me.example/entries/0190a0b0-ffff-7fff-8fff-00000000dead",
            "<p>whatever</p>",
        )
        .unwrap();
        assert_eq!(create_moderation_record(&pool, &wm.id).unwrap(), None);

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM webmention_moderations", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn redelivery_resets_approval_and_replaces_comment() {
        let pool = test_pool();
        seed_entry(&pool, "0190a0b0-aaaa-7bbb-8ccc-000000000001");

        let wm = store_incoming(
            &pool,
            "https://alice.example/notes/7",
            TARGET,
            &reply_page("First version"),
        )
        .unwrap();
        let moderation_id = create_moderation_record(&pool, &wm.id).unwrap().unwrap();
        set_approval(&pool, &moderation_id, true).unwrap();

        // The remote page was edited and the webmention redelivered.
        let wm2 = store_incoming(
            &pool,
            "https://alice.example/notes/7",
            TARGET,
            &reply_page("Edited version"),
        )
        .unwrap();
        assert_eq!(wm.id, wm2.id);
        let moderation_id2 = create_moderation_record(&pool, &wm2.id).unwrap().unwrap();
        assert_eq!(moderation_id, moderation_id2);

        let conn = pool.get().unwrap();
        let (count, approval, json): (i64, Option<bool>, String) = conn
            .query_row(
                "SELECT COUNT(*), MAX(approval_status), MAX(comment_json)
                 FROM webmention_moderations WHERE webmention_id = ?1",
                params![wm.id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(approval, None);
        assert!(json.contains("Edited version"));
    }

    #[test]
    fn approval_marks_webmention_reviewed() {
        let pool = test_pool();
        seed_entry(&pool, "0190a0b0-aaaa-7bbb-8ccc-000000000001");

        let wm = store_incoming(
            &pool,
            "https://alice.example/notes/7",
            TARGET,
            &reply_page("Nice"),
        )
        .unwrap();
        let moderation_id = create_moderation_record(&pool, &wm.id).unwrap().unwrap();
        set_approval(&pool, &moderation_id, false).unwrap();

        let conn = pool.get().unwrap();
        let (approval, reviewed): (Option<bool>, bool) = conn
            .query_row(
                "SELECT m.approval_status, w.reviewed
                 FROM webmention_moderations m
                 JOIN incoming_webmentions w ON w.id = m.webmention_id
                 WHERE m.id = ?1",
                params![moderation_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(approval, Some(false));
        assert!(reviewed);
    }

    #[test]
    fn approving_unknown_moderation_is_not_found() {
        let pool = test_pool();
        assert!(matches!(
            set_approval(&pool, "missing", true),
            Err(AppError::NotFound)
        ));
    }
}
