use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced to callers. Business outcomes (no drivers available,
/// candidates exhausted, ETA unavailable) are NOT errors; operations return
/// them as enum values so callers branch instead of catching.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The responder no longer holds the active offer: wrong driver, expired
    /// deadline, or the assignment already moved on.
    #[error("stale response: {0}")]
    StaleResponse(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match &self {
            DispatchError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            DispatchError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation", msg.clone()),
            DispatchError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone()),
            DispatchError::StaleResponse(msg) => (StatusCode::CONFLICT, "stale_response", msg.clone()),
            DispatchError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg.clone())
            }
        };

        let body = Json(json!({
            "error": message,
            "kind": kind
        }));

        (status, body).into_response()
    }
}
