//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use stackwatch_store::{StoreError, TailError};

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    /// The tailed file disappeared; clients should stop polling.
    Gone(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Gone(msg) => {
                let body = Json(json!({
                    "error": msg,
                    "gone": true
                }));
                return (StatusCode::GONE, body).into_response();
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<stackwatch_core::Error> for ApiError {
    fn from(err: stackwatch_core::Error) -> Self {
        match err {
            stackwatch_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            stackwatch_core::Error::InvalidName { .. } | stackwatch_core::Error::InvalidRunPath(_) => {
                ApiError::BadRequest(err.to_string())
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => ApiError::NotFound(msg),
            StoreError::Core(e) => e.into(),
            e if e.is_race() => ApiError::NotFound(e.to_string()),
            e => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<TailError> for ApiError {
    fn from(err: TailError) -> Self {
        match err {
            TailError::SourceGone(_) => ApiError::Gone(err.to_string()),
            TailError::Io { .. } => ApiError::Internal(err.to_string()),
        }
    }
}
