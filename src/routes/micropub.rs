//! The Micropub endpoint: authenticates the request, normalizes the body,
//! resolves media, classifies the entry and builds it, then kicks off
//! outbound webmentions for published posts.

use std::collections::HashMap;

use axum::extract::{FromRequest, Multipart, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde_json::{json, Value};

use crate::db::models::{PostKind, PostStatus, Visibility};
use crate::entry::{
    classify, create_entry, CheckinPayload, EntryLocation, KindPayload, NewEntry,
};
use crate::error::{AppError, AppResult};
use crate::indieauth;
use crate::indieweb::linked_page::fetch_linked_page;
use crate::indieweb::location::get_location;
use crate::micropub::media;
use crate::micropub::normalize::{self, ContentType, Mf2Entry};
use crate::state::AppState;
use crate::webmention::send::send_webmentions;

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub fn router() -> Router<AppState> {
    Router::new().route("/micropub", get(micropub_query).post(micropub_post))
}

/// Parsed request body: text fields in wire order, uploaded file parts, and
/// the raw JSON document for JSON requests.
struct RequestBody {
    content_type: ContentType,
    pairs: Vec<(String, String)>,
    uploads: Vec<(String, Vec<u8>)>,
    json: Option<Value>,
}

impl RequestBody {
    /// Top-level field lookup, used for access_token/action before the body
    /// is normalized.
    fn field(&self, name: &str) -> Option<String> {
        match &self.json {
            Some(json) => json
                .get(name)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            None => self
                .pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone()),
        }
    }
}

/// `GET /micropub?q=config`: Micropub config discovery.
async fn micropub_query(Query(params): Query<HashMap<String, String>>) -> AppResult<Response> {
    match params.get("q").map(|q| q.as_str()) {
        Some("config") => Ok(Json(json!({"syndicate-to": []})).into_response()),
        Some(other) => Err(AppError::BadRequest(format!(
            "Unsupported query: {}",
            other
        ))),
        None => Err(AppError::BadRequest("Missing query parameter: q".into())),
    }
}

async fn micropub_post(State(state): State<AppState>, request: Request) -> AppResult<Response> {
    let content_type_header = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let headers = request.headers().clone();
    let body = read_body(&state, request, &content_type_header).await?;

    // Authenticate and scope-check before touching anything else.
    let token = indieauth::extract_bearer(&headers, body.field("access_token").as_deref())?;
    let action = body.field("action").unwrap_or_else(|| "create".to_string());
    let token_info = indieauth::get_token_with_scope(&state.db, &token, &action)?;

    let mf2 = match body.content_type {
        ContentType::Json => normalize::normalize_json(
            body.json
                .as_ref()
                .ok_or_else(|| AppError::BadRequest("Invalid JSON body".into()))?,
        )?,
        ContentType::FormUrlEncoded | ContentType::MultipartForm => {
            normalize::normalize_form(&body.pairs)
        }
    };

    if mf2.h_type != "h-entry" {
        return Err(AppError::Validation(json!({
            "h": [format!("{} is an unsupported h-type", mf2.h_type)]
        })));
    }

    // Persist uploaded photos so they can be appended to the content.
    let mut attachments = Vec::new();
    for (mime_type, bytes) in &body.uploads {
        let file = media::save_file(&state.db, state.config.uploads_path(), bytes, mime_type)?;
        attachments.push(file);
    }

    let mut content = entry_content(&mf2);
    content = media::replace_base64_images(&state.db, state.config.uploads_path(), &content)?;
    for photo_url in mf2.strs("photo") {
        if photo_url.starts_with("http://") || photo_url.starts_with("https://") {
            content.push_str(&media::render_photo(photo_url));
        }
    }
    for file in &attachments {
        content.push_str(&media::render_attachment(file));
    }

    let status = mf2
        .first_str("post_status")
        .and_then(PostStatus::parse)
        .unwrap_or(PostStatus::Published);
    let visibility = mf2
        .first_str("visibility")
        .and_then(Visibility::parse)
        .unwrap_or(Visibility::Public);
    let published_at = mf2
        .first_str("published")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));

    let location = get_location(&mf2).and_then(|data| {
        let point = data.point()?;
        Some(EntryLocation {
            street_address: data.street_address.unwrap_or_default(),
            locality: data.locality.unwrap_or_default(),
            region: data.region.unwrap_or_default(),
            country_name: data.country_name.unwrap_or_default(),
            postal_code: data.postal_code.unwrap_or_default(),
            point,
        })
    });

    let payload = build_payload(&state, &mf2).await?;

    let new = NewEntry {
        author_id: token_info.token.user_id.clone(),
        status,
        visibility,
        title: mf2.first_str("name").unwrap_or("").trim().to_string(),
        content,
        published_at,
        payload,
        location,
        syndication_urls: mf2.strs("syndication").iter().map(|s| s.to_string()).collect(),
        stream_ids: resolve_stream_ids(&state, &mf2.strs("stream"))?,
    };
    let entry = create_entry(&state.db, &new)?;

    // Published posts notify everything they link to. Delivery is
    // best-effort and runs off the request path.
    if entry.status == PostStatus::Published {
        let client = state.http.clone();
        let pool = state.db.clone();
        let source_url = state.config.entry_url(&entry.id);
        let local_domains = state.config.site.local_domains.clone();
        let entry_for_send = entry.clone();
        tokio::spawn(async move {
            if let Err(e) =
                send_webmentions(&client, &pool, &entry_for_send, &source_url, &local_domains).await
            {
                tracing::warn!("Webmention sending failed: {}", e);
            }
        });
    }

    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, state.config.entry_url(&entry.id))],
    )
        .into_response())
}

async fn read_body(
    state: &AppState,
    request: Request,
    content_type_header: &str,
) -> AppResult<RequestBody> {
    let content_type = ContentType::parse(content_type_header)?;
    match content_type {
        ContentType::Json => {
            let bytes = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
                .await
                .map_err(|_| AppError::BadRequest("Could not read request body".into()))?;
            let json: Value = serde_json::from_slice(&bytes)
                .map_err(|_| AppError::BadRequest("Invalid JSON body".into()))?;
            Ok(RequestBody {
                content_type,
                pairs: Vec::new(),
                uploads: Vec::new(),
                json: Some(json),
            })
        }
        ContentType::FormUrlEncoded => {
            let bytes = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
                .await
                .map_err(|_| AppError::BadRequest("Could not read request body".into()))?;
            let pairs = url::form_urlencoded::parse(&bytes)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            Ok(RequestBody {
                content_type,
                pairs,
                uploads: Vec::new(),
                json: None,
            })
        }
        ContentType::MultipartForm => {
            let mut multipart = Multipart::from_request(request, state)
                .await
                .map_err(|_| AppError::BadRequest("Invalid multipart body".into()))?;
            let mut pairs = Vec::new();
            let mut uploads = Vec::new();
            while let Some(field) = multipart
                .next_field()
                .await
                .map_err(|_| AppError::BadRequest("Invalid multipart body".into()))?
            {
                let name = field.name().unwrap_or("").to_string();
                if field.file_name().is_some() {
                    let mime_type = field
                        .content_type()
                        .unwrap_or("application/octet-stream")
                        .to_string();
                    let bytes = field
                        .bytes()
                        .await
                        .map_err(|_| AppError::BadRequest("Invalid multipart body".into()))?;
                    uploads.push((mime_type, bytes.to_vec()));
                } else {
                    let value = field
                        .text()
                        .await
                        .map_err(|_| AppError::BadRequest("Invalid multipart body".into()))?;
                    pairs.push((name, value));
                }
            }
            Ok(RequestBody {
                content_type,
                pairs,
                uploads,
                json: None,
            })
        }
    }
}

/// The content property: either a plain string or, in JSON requests, an
/// object carrying pre-rendered `html`.
fn entry_content(mf2: &Mf2Entry) -> String {
    match mf2.first("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(map)) => map
            .get("html")
            .or_else(|| map.get("value"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        _ => String::new(),
    }
}

/// Build the kind payload for the classified kind, fetching linked-page
/// context for replies and bookmarks.
async fn build_payload(state: &AppState, mf2: &Mf2Entry) -> AppResult<KindPayload> {
    match classify(mf2) {
        PostKind::Checkin => {
            let checkin = mf2
                .first("checkin")
                .ok_or_else(|| AppError::Validation(json!({"checkin": ["This field is required"]})))?;
            let name = checkin
                .get("properties")
                .and_then(|p| p.get("name"))
                .and_then(|n| n.as_array())
                .and_then(|n| n.first())
                .and_then(|n| n.as_str())
                .map(|n| n.to_string())
                .ok_or_else(|| {
                    AppError::Validation(json!({"checkin": ["A checkin requires a place name"]}))
                })?;
            let url = checkin
                .get("properties")
                .and_then(|p| p.get("url"))
                .and_then(|u| u.as_array())
                .and_then(|u| u.first())
                .and_then(|u| u.as_str())
                .map(|u| u.to_string());
            Ok(KindPayload::Checkin(CheckinPayload { name, url }))
        }
        PostKind::Bookmark => {
            let url = mf2
                .first_str("bookmark_of")
                .ok_or_else(|| AppError::Validation(json!({"bookmark_of": ["Invalid value"]})))?;
            let page = fetch_linked_page(&state.http, url).await;
            Ok(KindPayload::Bookmark(page.into()))
        }
        PostKind::Reply => {
            let url = mf2
                .first_str("in_reply_to")
                .ok_or_else(|| AppError::Validation(json!({"in_reply_to": ["Invalid value"]})))?;
            let page = fetch_linked_page(&state.http, url).await;
            Ok(KindPayload::Reply(page.into()))
        }
        PostKind::Article => Ok(KindPayload::Article),
        PostKind::Note | PostKind::Like => Ok(KindPayload::Note),
    }
}

/// Resolve stream slugs to ids; unknown slugs are ignored.
fn resolve_stream_ids(state: &AppState, slugs: &[&str]) -> AppResult<Vec<String>> {
    if slugs.is_empty() {
        return Ok(Vec::new());
    }
    let conn = state.db.get()?;
    let mut ids = Vec::new();
    for slug in slugs {
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM streams WHERE slug = ?1",
                params![slug],
                |row| row.get(0),
            )
            .ok();
        ids.extend(id);
    }
    Ok(ids)
}
