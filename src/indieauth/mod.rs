//! IndieAuth token lifecycle: issue, exchange, verify, revoke.
//!
//! A token starts life holding only an authorization code. Exchanging the
//! code mints the bearer key, clears the code and stamps `exchanged_at`, so
//! the exchange can only ever happen once. Revocation deletes the row.

use std::sync::OnceLock;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use chrono::Utc;
use rand::RngCore;
use regex::Regex;
use rusqlite::params;
use url::Url;

use crate::db::models::Token;
use crate::error::{AppError, AppResult};
use crate::state::DbPool;

/// A resolved bearer token with its owner and granted scopes.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub token: Token,
    pub username: String,
    pub scopes: Vec<String>,
}

impl TokenInfo {
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }
}

/// Generate a 40-char hex credential (code or bearer key).
pub fn generate_key() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Issue a token for a user: a fresh authorization code, no key yet.
/// Requested scopes that the server does not know are ignored.
pub fn create_token(
    pool: &DbPool,
    user_id: &str,
    client_id: &str,
    scopes: &[&str],
) -> AppResult<Token> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;

    let id = uuid::Uuid::now_v7().to_string();
    let auth_code = generate_key();
    tx.execute(
        "INSERT INTO tokens (id, user_id, auth_code, key, client_id) VALUES (?1, ?2, ?3, '', ?4)",
        params![id, user_id, auth_code, client_id],
    )?;
    for scope in scopes {
        tx.execute(
            "INSERT OR IGNORE INTO token_scopes (token_id, scope_id)
             SELECT ?1, id FROM scopes WHERE key = ?2",
            params![id, scope],
        )?;
    }

    let token = tx.query_row(
        "SELECT id, user_id, auth_code, key, client_id, exchanged_at, created_at
         FROM tokens WHERE id = ?1",
        params![id],
        token_from_row,
    )?;
    tx.commit()?;
    Ok(token)
}

/// The result of a successful code-for-token exchange.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub key: String,
    pub scope: String,
    pub username: String,
}

/// One-shot exchange of an authorization code for a bearer key. The code is
/// cleared in the same transaction, so a second attempt no longer matches
/// and fails as `TokenNotFound`.
pub fn exchange_code(pool: &DbPool, code: &str, client_id: &str) -> AppResult<Exchange> {
    if code.is_empty() {
        return Err(AppError::TokenNotFound);
    }

    let mut conn = pool.get()?;
    let tx = conn.transaction()?;

    let token_id: String = tx
        .query_row(
            "SELECT id FROM tokens
             WHERE auth_code = ?1 AND client_id = ?2 AND exchanged_at IS NULL",
            params![code, client_id],
            |row| row.get(0),
        )
        .map_err(|_| AppError::TokenNotFound)?;

    let key = generate_key();
    tx.execute(
        "UPDATE tokens SET key = ?1, auth_code = '', exchanged_at = ?2 WHERE id = ?3",
        params![key, Utc::now().to_rfc3339(), token_id],
    )?;

    let username: String = tx.query_row(
        "SELECT u.username FROM tokens t JOIN users u ON u.id = t.user_id WHERE t.id = ?1",
        params![token_id],
        |row| row.get(0),
    )?;
    let scopes = scopes_for_token(&tx, &token_id)?;
    tx.commit()?;

    Ok(Exchange {
        key,
        scope: scopes.join(" "),
        username,
    })
}

/// Resolve a bearer key to its token, owner and scopes.
pub fn get_token(pool: &DbPool, key: &str) -> AppResult<TokenInfo> {
    if key.is_empty() {
        return Err(AppError::TokenNotFound);
    }
    let conn = pool.get()?;

    let (token, username) = conn
        .query_row(
            "SELECT t.id, t.user_id, t.auth_code, t.key, t.client_id, t.exchanged_at,
                    t.created_at, u.username
             FROM tokens t JOIN users u ON u.id = t.user_id
             WHERE t.key = ?1",
            params![key],
            |row| Ok((token_from_row(row)?, row.get::<_, String>(7)?)),
        )
        .map_err(|_| AppError::TokenNotFound)?;

    let scopes = scopes_for_token(&conn, &token.id)?;
    Ok(TokenInfo {
        token,
        username,
        scopes,
    })
}

/// Resolve a bearer key and require one of its scopes to cover `action`.
pub fn get_token_with_scope(pool: &DbPool, key: &str, action: &str) -> AppResult<TokenInfo> {
    let info = get_token(pool, key)?;
    if !info.scopes.iter().any(|s| s == action) {
        return Err(AppError::PermissionDenied);
    }
    Ok(info)
}

/// Delete a token by bearer key. Revoking an unknown key is a no-op.
pub fn revoke_token(pool: &DbPool, key: &str) -> AppResult<()> {
    if key.is_empty() {
        return Ok(());
    }
    let conn = pool.get()?;
    conn.execute("DELETE FROM tokens WHERE key = ?1", params![key])?;
    Ok(())
}

/// Validate a redirect URI against the client it claims to belong to.
///
/// A redirect URI on the client's own host is accepted outright. Anything
/// cross-host must appear among the `rel="redirect_uri"` links the client
/// declares, otherwise an attacker could capture authorization codes by
/// pointing the redirect at a host they control.
pub async fn validate_redirect_uri(
    client: &reqwest::Client,
    client_id: &str,
    redirect_uri: &str,
) -> AppResult<()> {
    let client_url = Url::parse(client_id)
        .map_err(|_| AppError::BadRequest("Invalid client_id".into()))?;
    let redirect_url = Url::parse(redirect_uri)
        .map_err(|_| AppError::BadRequest("Invalid redirect_uri".into()))?;

    if client_url.host_str() == redirect_url.host_str() {
        return Ok(());
    }

    let declared = discover_redirect_uris(client, client_id).await;
    if declared.iter().any(|u| u == redirect_uri) {
        Ok(())
    } else {
        Err(AppError::BadRequest(
            "Redirect uri not found on client app".into(),
        ))
    }
}

fn link_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"<([^>]+)>\s*;[^,]*rel\s*=\s*"?([^",]+)"?"#).expect("valid regex"))
}

fn link_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<link\s[^>]*>"#).expect("valid regex")
    })
}

/// The redirect URIs a client declares, from `Link` headers and HTML
/// `<link rel="redirect_uri">` tags. Errors mean an empty list.
pub async fn discover_redirect_uris(client: &reqwest::Client, client_id: &str) -> Vec<String> {
    let response = match client.get(client_id).send().await {
        Ok(r) if r.status().is_success() => r,
        _ => return Vec::new(),
    };

    let base = Url::parse(client_id).ok();
    let mut uris = Vec::new();

    for header in response.headers().get_all(reqwest::header::LINK) {
        if let Ok(value) = header.to_str() {
            for captures in link_header_re().captures_iter(value) {
                if captures[2].split_whitespace().any(|r| r == "redirect_uri") {
                    push_resolved(&mut uris, &base, &captures[1]);
                }
            }
        }
    }

    let body = match response.text().await {
        Ok(b) => b,
        Err(_) => return uris,
    };
    for tag in link_tag_re().find_iter(&body) {
        let tag = tag.as_str();
        if rel_values(tag).iter().any(|r| r == "redirect_uri") {
            if let Some(href) = attr_value(tag, "href") {
                push_resolved(&mut uris, &base, &href);
            }
        }
    }

    uris
}

fn rel_values(tag: &str) -> Vec<String> {
    attr_value(tag, "rel")
        .map(|v| v.split_whitespace().map(|s| s.to_string()).collect())
        .unwrap_or_default()
}

fn attr_value(tag: &str, name: &str) -> Option<String> {
    let pattern = format!(r#"(?i){}\s*=\s*["']([^"']*)["']"#, regex::escape(name));
    Regex::new(&pattern)
        .expect("valid regex")
        .captures(tag)
        .map(|c| c[1].to_string())
}

fn push_resolved(uris: &mut Vec<String>, base: &Option<Url>, href: &str) {
    let resolved = match base {
        Some(base) => base.join(href).map(|u| u.to_string()).ok(),
        None => Some(href.to_string()),
    };
    if let Some(uri) = resolved {
        uris.push(uri);
    }
}

/// Pull the bearer token out of the Authorization header, falling back to a
/// form field. No credentials at all is an error.
pub fn extract_bearer(headers: &HeaderMap, form_token: Option<&str>) -> AppResult<String> {
    if let Some(value) = headers.get(AUTHORIZATION) {
        let value = value
            .to_str()
            .map_err(|_| AppError::InvalidToken("Invalid token header.".into()))?;
        if let Some(token) = value.split_whitespace().nth(1) {
            return Ok(token.to_string());
        }
    }
    match form_token {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        _ => Err(AppError::InvalidToken(
            "Invalid request. No credentials provided.".into(),
        )),
    }
}

fn scopes_for_token(conn: &rusqlite::Connection, token_id: &str) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT s.key FROM token_scopes ts JOIN scopes s ON s.id = ts.scope_id
         WHERE ts.token_id = ?1 ORDER BY s.key",
    )?;
    let scopes = stmt
        .query_map(params![token_id], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(scopes)
}

fn token_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Token> {
    Ok(Token {
        id: row.get(0)?,
        user_id: row.get(1)?,
        auth_code: row.get(2)?,
        key: row.get(3)?,
        client_id: row.get(4)?,
        exchanged_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}
