//! The IndieAuth token endpoint: code-for-token exchange, revocation, and
//! bearer verification.

use std::collections::HashMap;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Json, Router};
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::indieauth;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/indieauth/token", get(verify_token).post(token_endpoint))
}

/// `GET /indieauth/token` verifies a bearer token, answering with the
/// identity and scopes it carries.
async fn verify_token(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    let key = indieauth::extract_bearer(&headers, None)?;
    let info = indieauth::get_token(&state.db, &key)?;

    Ok(Json(json!({
        "me": state.config.author_url(&info.username),
        "client_id": info.token.client_id,
        "scope": info.scope_string(),
    }))
    .into_response())
}

/// `POST /indieauth/token` exchanges an authorization code for a bearer
/// token, or revokes one with `action=revoke`.
async fn token_endpoint(
    State(state): State<AppState>,
    Form(form): Form<HashMap<String, String>>,
) -> AppResult<Response> {
    if form.get("action").map(|a| a.as_str()) == Some("revoke") {
        // Revoking an unknown token is a silent no-op.
        let key = form.get("token").map(|t| t.as_str()).unwrap_or("");
        indieauth::revoke_token(&state.db, key)?;
        return Ok(Json(json!({})).into_response());
    }

    let code = require_field(&form, "code")?;
    let client_id = require_field(&form, "client_id")?;
    let redirect_uri = require_field(&form, "redirect_uri")?;

    indieauth::validate_redirect_uri(&state.http, client_id, redirect_uri).await?;
    let exchange = indieauth::exchange_code(&state.db, code, client_id)?;

    Ok(Json(json!({
        "access_token": exchange.key,
        "token_type": "Bearer",
        "scope": exchange.scope,
        "me": state.config.author_url(&exchange.username),
    }))
    .into_response())
}

fn require_field<'a>(form: &'a HashMap<String, String>, name: &str) -> AppResult<&'a str> {
    form.get(name)
        .map(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Validation(json!({name: ["This field is required"]})))
}
