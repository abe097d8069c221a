use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
#[allow(dead_code)]
pub enum AppError {
    #[error("Not found")]
    NotFound,

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Per-field validation errors, rendered as `{field: [messages]}`.
    #[error("Validation failed")]
    Validation(serde_json::Value),

    #[error("Invalid content-type")]
    UnknownContentType,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token not found")]
    TokenNotFound,

    #[error("Scope permission denied")]
    PermissionDenied,

    /// A sub-entity operation was invoked against an entry of the wrong
    /// kind. Always a bug in the caller.
    #[error("Post kind mismatch: {0}")]
    PostKindMismatch(String),

    /// A webmention for this (entry, target) pair already succeeded.
    /// Callers treat this as an idempotent no-op.
    #[error("Webmention already sent")]
    AlreadySentWebmention,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, json!({"message": "Not found"})),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({"message": msg})),
            AppError::Validation(errors) => (StatusCode::BAD_REQUEST, errors.clone()),
            AppError::UnknownContentType => (
                StatusCode::BAD_REQUEST,
                json!({"message": "Invalid content-type"}),
            ),
            AppError::InvalidToken(msg) => (StatusCode::BAD_REQUEST, json!({"message": msg})),
            AppError::TokenNotFound => {
                (StatusCode::BAD_REQUEST, json!({"message": "Invalid token"}))
            }
            AppError::PermissionDenied => (
                StatusCode::FORBIDDEN,
                json!({"message": "Scope permission denied"}),
            ),
            AppError::PostKindMismatch(msg) => {
                tracing::error!("Post kind mismatch: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"message": "Internal server error"}),
                )
            }
            AppError::AlreadySentWebmention => {
                tracing::error!("AlreadySentWebmention escaped its call site");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"message": "Internal server error"}),
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"message": "Internal server error"}),
                )
            }
            AppError::Pool(e) => {
                tracing::error!("Pool error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"message": "Internal server error"}),
                )
            }
            AppError::Json(e) => {
                tracing::error!("JSON error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"message": "Internal server error"}),
                )
            }
            AppError::Http(e) => {
                tracing::error!("HTTP error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"message": "Internal server error"}),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"message": "Internal server error"}),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
