//! Entry classification and construction.
//!
//! A Micropub body is classified into a post kind by which distinguishing
//! properties it carries, and the kind-specific payload travels as one
//! variant of `KindPayload` so an entry can never be created with a payload
//! that disagrees with its kind. Updates check the variant against the
//! stored kind instead; kinds are fixed for the life of an entry.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::params;
use serde_json::json;

use crate::db::models::{Entry, PostKind, PostStatus, Visibility};
use crate::error::{AppError, AppResult};
use crate::indieweb::html;
use crate::indieweb::linked_page::LinkedPage;
use crate::indieweb::location::Point;
use crate::micropub::normalize::Mf2Entry;
use crate::state::DbPool;

/// Summaries are a plain-text excerpt of the content, capped at this many
/// characters.
pub const SUMMARY_MAX_LEN: usize = 255;

/// Cached context about the page a reply or bookmark points at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkedContext {
    pub url: String,
    pub title: String,
    pub quote: String,
    pub author: String,
    pub author_url: String,
    pub author_photo: String,
}

impl From<LinkedPage> for LinkedContext {
    fn from(page: LinkedPage) -> Self {
        Self {
            url: page.url,
            title: page.title,
            quote: page.description,
            author: page.author.name,
            author_url: page.author.url,
            author_photo: page.author.photo,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckinPayload {
    pub name: String,
    pub url: Option<String>,
}

/// Kind-specific payload of a new or updated entry.
#[derive(Debug, Clone, PartialEq)]
pub enum KindPayload {
    Note,
    Article,
    Reply(LinkedContext),
    Bookmark(LinkedContext),
    Checkin(CheckinPayload),
}

impl KindPayload {
    pub fn kind(&self) -> PostKind {
        match self {
            KindPayload::Note => PostKind::Note,
            KindPayload::Article => PostKind::Article,
            KindPayload::Reply(_) => PostKind::Reply,
            KindPayload::Bookmark(_) => PostKind::Bookmark,
            KindPayload::Checkin(_) => PostKind::Checkin,
        }
    }
}

/// A location destined for storage. The point is mandatory; callers drop
/// locations that never resolved to coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryLocation {
    pub street_address: String,
    pub locality: String,
    pub region: String,
    pub country_name: String,
    pub postal_code: String,
    pub point: Point,
}

#[derive(Debug, Clone)]
pub struct NewEntry {
    pub author_id: String,
    pub status: PostStatus,
    pub visibility: Visibility,
    pub title: String,
    pub content: String,
    pub published_at: Option<DateTime<Utc>>,
    pub payload: KindPayload,
    pub location: Option<EntryLocation>,
    pub syndication_urls: Vec<String>,
    pub stream_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct UpdateEntry {
    pub status: PostStatus,
    pub visibility: Visibility,
    pub title: String,
    pub content: String,
    pub published_at: Option<DateTime<Utc>>,
    pub payload: KindPayload,
    /// None removes any stored location; updates are full replacements.
    pub location: Option<EntryLocation>,
    /// Some replaces the whole syndication set; None leaves it untouched.
    pub syndication_urls: Option<Vec<String>>,
    pub stream_ids: Vec<String>,
}

/// Decide the post kind from normalized properties. Precedence: checkin,
/// then bookmark, then reply, then article (a non-empty name), else note.
pub fn classify(entry: &Mf2Entry) -> PostKind {
    if entry.has("checkin") {
        PostKind::Checkin
    } else if entry.has("bookmark_of") {
        PostKind::Bookmark
    } else if entry.has("in_reply_to") {
        PostKind::Reply
    } else if entry.first_str("name").map(|n| !n.trim().is_empty()) == Some(true) {
        PostKind::Article
    } else {
        PostKind::Note
    }
}

/// Plain-text excerpt of an HTML body.
pub fn summarize(content: &str) -> String {
    let text = html::strip_tags(content);
    text.trim().chars().take(SUMMARY_MAX_LEN).collect()
}

fn attachment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"/files/([0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12})",
        )
        .expect("valid regex")
    })
}

/// Identifiers of stored files referenced by the content body.
pub fn attachment_ids(content: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for captures in attachment_re().captures_iter(content) {
        let id = captures[1].to_lowercase();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

fn determine_published_at(
    status: PostStatus,
    explicit: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    if explicit.is_some() {
        return explicit;
    }
    if status == PostStatus::Published {
        return Some(Utc::now());
    }
    None
}

/// Create an entry and all of its related rows in one transaction.
pub fn create_entry(pool: &DbPool, new: &NewEntry) -> AppResult<Entry> {
    if matches!(new.payload, KindPayload::Checkin(_)) && new.location.is_none() {
        return Err(AppError::Validation(
            json!({"checkin": ["A checkin requires a location"]}),
        ));
    }

    let mut conn = pool.get()?;
    let tx = conn.transaction()?;

    let id = uuid::Uuid::now_v7().to_string();
    let published_at = determine_published_at(new.status, new.published_at);
    let summary = summarize(&new.content);

    tx.execute(
        "INSERT INTO entries (id, author_id, kind, status, visibility, title, content,
                              summary, published_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id,
            new.author_id,
            new.payload.kind().as_str(),
            new.status.as_str(),
            new.visibility.as_str(),
            new.title,
            new.content,
            summary,
            published_at.map(|t| t.to_rfc3339()),
        ],
    )?;

    write_payload(&tx, &id, &new.payload)?;

    if let Some(location) = &new.location {
        write_location(&tx, &id, location)?;
    }
    replace_syndications(&tx, &id, &new.syndication_urls)?;
    replace_streams(&tx, &id, &new.stream_ids)?;
    link_content_files(&tx, &id, &new.content)?;

    let entry = read_entry(&tx, &id)?;
    tx.commit()?;
    Ok(entry)
}

/// Update an entry in one transaction. The payload variant must match the
/// entry's stored kind; kinds never change after creation.
pub fn update_entry(pool: &DbPool, entry_id: &str, up: &UpdateEntry) -> AppResult<Entry> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;

    let existing = read_entry(&tx, entry_id).map_err(|_| AppError::NotFound)?;
    if up.payload.kind() != existing.kind {
        return Err(AppError::PostKindMismatch(format!(
            "cannot apply a {} payload to a {} entry",
            up.payload.kind().as_str(),
            existing.kind.as_str()
        )));
    }

    // published_at is written once, on the first transition to published,
    // and survives every later edit.
    let published_at = match &existing.published_at {
        Some(at) => Some(at.clone()),
        None => determine_published_at(up.status, up.published_at).map(|t| t.to_rfc3339()),
    };
    let summary = summarize(&up.content);

    tx.execute(
        "UPDATE entries SET status = ?1, visibility = ?2, title = ?3, content = ?4,
                summary = ?5, published_at = ?6, updated_at = ?7
         WHERE id = ?8",
        params![
            up.status.as_str(),
            up.visibility.as_str(),
            up.title,
            up.content,
            summary,
            published_at,
            Utc::now().to_rfc3339(),
            entry_id,
        ],
    )?;

    write_payload(&tx, entry_id, &up.payload)?;

    match &up.location {
        Some(location) => write_location(&tx, entry_id, location)?,
        None => {
            tx.execute("DELETE FROM locations WHERE entry_id = ?1", params![entry_id])?;
        }
    }

    if let Some(urls) = &up.syndication_urls {
        tx.execute(
            "DELETE FROM syndications WHERE entry_id = ?1",
            params![entry_id],
        )?;
        replace_syndications(&tx, entry_id, urls)?;
    }

    tx.execute(
        "DELETE FROM entry_streams WHERE entry_id = ?1",
        params![entry_id],
    )?;
    replace_streams(&tx, entry_id, &up.stream_ids)?;

    tx.execute(
        "DELETE FROM entry_files WHERE entry_id = ?1",
        params![entry_id],
    )?;
    link_content_files(&tx, entry_id, &up.content)?;

    let entry = read_entry(&tx, entry_id)?;
    tx.commit()?;
    Ok(entry)
}

pub fn get_entry(pool: &DbPool, entry_id: &str) -> AppResult<Entry> {
    let conn = pool.get()?;
    read_entry(&conn, entry_id).map_err(|_| AppError::NotFound)
}

fn write_payload(
    conn: &rusqlite::Connection,
    entry_id: &str,
    payload: &KindPayload,
) -> AppResult<()> {
    match payload {
        KindPayload::Note | KindPayload::Article => {}
        KindPayload::Reply(context) => {
            conn.execute(
                "INSERT INTO replies (entry_id, in_reply_to, title, quote, author,
                                      author_url, author_photo)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(entry_id) DO UPDATE SET
                     in_reply_to = excluded.in_reply_to,
                     title = excluded.title,
                     quote = excluded.quote,
                     author = excluded.author,
                     author_url = excluded.author_url,
                     author_photo = excluded.author_photo",
                params![
                    entry_id,
                    context.url,
                    context.title,
                    context.quote,
                    context.author,
                    context.author_url,
                    context.author_photo,
                ],
            )?;
        }
        KindPayload::Bookmark(context) => {
            conn.execute(
                "INSERT INTO bookmarks (entry_id, bookmark_of, title, quote, author,
                                        author_url, author_photo)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(entry_id) DO UPDATE SET
                     bookmark_of = excluded.bookmark_of,
                     title = excluded.title,
                     quote = excluded.quote,
                     author = excluded.author,
                     author_url = excluded.author_url,
                     author_photo = excluded.author_photo",
                params![
                    entry_id,
                    context.url,
                    context.title,
                    context.quote,
                    context.author,
                    context.author_url,
                    context.author_photo,
                ],
            )?;
        }
        KindPayload::Checkin(checkin) => {
            conn.execute(
                "INSERT INTO checkins (entry_id, name, url)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(entry_id) DO UPDATE SET
                     name = excluded.name,
                     url = excluded.url",
                params![entry_id, checkin.name, checkin.url],
            )?;
        }
    }
    Ok(())
}

fn write_location(
    conn: &rusqlite::Connection,
    entry_id: &str,
    location: &EntryLocation,
) -> AppResult<()> {
    conn.execute(
        "INSERT INTO locations (entry_id, street_address, locality, region,
                                country_name, postal_code, latitude, longitude)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(entry_id) DO UPDATE SET
             street_address = excluded.street_address,
             locality = excluded.locality,
             region = excluded.region,
             country_name = excluded.country_name,
             postal_code = excluded.postal_code,
             latitude = excluded.latitude,
             longitude = excluded.longitude",
        params![
            entry_id,
            location.street_address,
            location.locality,
            location.region,
            location.country_name,
            location.postal_code,
            location.point.latitude,
            location.point.longitude,
        ],
    )?;
    Ok(())
}

fn replace_syndications(
    conn: &rusqlite::Connection,
    entry_id: &str,
    urls: &[String],
) -> AppResult<()> {
    for url in urls {
        conn.execute(
            "INSERT OR IGNORE INTO syndications (id, entry_id, url) VALUES (?1, ?2, ?3)",
            params![uuid::Uuid::now_v7().to_string(), entry_id, url],
        )?;
    }
    Ok(())
}

fn replace_streams(
    conn: &rusqlite::Connection,
    entry_id: &str,
    stream_ids: &[String],
) -> AppResult<()> {
    for stream_id in stream_ids {
        conn.execute(
            "INSERT OR IGNORE INTO entry_streams (entry_id, stream_id)
             SELECT ?1, id FROM streams WHERE id = ?2",
            params![entry_id, stream_id],
        )?;
    }
    Ok(())
}

fn link_content_files(
    conn: &rusqlite::Connection,
    entry_id: &str,
    content: &str,
) -> AppResult<()> {
    for file_id in attachment_ids(content) {
        conn.execute(
            "INSERT OR IGNORE INTO entry_files (entry_id, file_id)
             SELECT ?1, id FROM files WHERE id = ?2",
            params![entry_id, file_id],
        )?;
    }
    Ok(())
}

fn read_entry(conn: &rusqlite::Connection, entry_id: &str) -> Result<Entry, rusqlite::Error> {
    conn.query_row(
        "SELECT id, author_id, kind, status, visibility, title, content, summary,
                published_at, created_at, updated_at
         FROM entries WHERE id = ?1",
        params![entry_id],
        |row| {
            let kind: String = row.get(2)?;
            let status: String = row.get(3)?;
            let visibility: String = row.get(4)?;
            Ok(Entry {
                id: row.get(0)?,
                author_id: row.get(1)?,
                kind: PostKind::parse(&kind).unwrap_or(PostKind::Note),
                status: PostStatus::parse(&status).unwrap_or(PostStatus::Draft),
                visibility: Visibility::parse(&visibility).unwrap_or(Visibility::Public),
                title: row.get(5)?,
                content: row.get(6)?,
                summary: row.get(7)?,
                published_at: row.get(8)?,
                created_at: row.get(9)?,
                updated_at: row.get(10)?,
            })
        },
    )
}
