//! Inbound webmention receipt and moderation actions.
//!
//! The receipt endpoint validates the source/target parameters, fetches the
//! source page, stores the raw webmention, and hands it to the receiver for
//! moderation bookkeeping.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Form, Json, Router};
use serde_json::json;
use url::Url;

use crate::error::{AppError, AppResult};
use crate::indieauth;
use crate::state::AppState;
use crate::webmention::receive;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webmention", post(receive_webmention))
        .route("/webmentions/{id}/approve", post(approve))
        .route("/webmentions/{id}/disapprove", post(disapprove))
}

/// `POST /webmention` receives a webmention with `source` and `target`
/// form parameters.
async fn receive_webmention(
    State(state): State<AppState>,
    Form(form): Form<HashMap<String, String>>,
) -> AppResult<Response> {
    let source = require_url(&form, "source")?;
    let target = require_url(&form, "target")?;
    if source == target {
        return Err(AppError::BadRequest(
            "Source and target must differ".into(),
        ));
    }

    // The source must actually exist and link to the target.
    let response = state
        .http
        .get(source.as_str())
        .send()
        .await
        .map_err(|_| AppError::BadRequest("Source could not be fetched".into()))?;
    if !response.status().is_success() {
        return Err(AppError::BadRequest("Source could not be fetched".into()));
    }
    let body = response
        .text()
        .await
        .map_err(|_| AppError::BadRequest("Source could not be fetched".into()))?;
    if !body.contains(target.as_str()) {
        return Err(AppError::BadRequest(
            "Source does not link to target".into(),
        ));
    }

    let webmention = receive::store_incoming(&state.db, source.as_str(), target.as_str(), &body)?;
    receive::create_moderation_record(&state.db, &webmention.id)?;

    Ok((StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))).into_response())
}

async fn approve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    review(&state, &headers, &id, true)
}

async fn disapprove(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    review(&state, &headers, &id, false)
}

fn review(state: &AppState, headers: &HeaderMap, id: &str, approval: bool) -> AppResult<Response> {
    let key = indieauth::extract_bearer(headers, None)?;
    indieauth::get_token_with_scope(&state.db, &key, "update")?;

    receive::set_approval(&state.db, id, approval)?;
    Ok(Json(json!({"approved": approval})).into_response())
}

fn require_url(form: &HashMap<String, String>, name: &str) -> AppResult<Url> {
    let value = form
        .get(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("Missing parameter: {}", name)))?;
    Url::parse(value).map_err(|_| AppError::BadRequest(format!("Invalid {} URL", name)))
}
