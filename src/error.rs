use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::rate_limit::LimitReason;

/// Errors raised by the artifact store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),

    #[error("unsupported extension: {0:?}")]
    InvalidExtension(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("write produced an empty file: {}", .0.display())]
    EmptyWrite(PathBuf),
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io { context: context.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Why the cleanup log could not yield a last-run timestamp.
/// Never surfaced past the retention service; every variant means "due".
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LogParseError {
    #[error("cleanup log does not exist")]
    Missing,

    #[error("cleanup log has no entries")]
    Empty,

    #[error("malformed cleanup log line: {0:?}")]
    Malformed(String),

    #[error("cleanup log unreadable: {0}")]
    Unreadable(String),
}

#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid generator url: {0}")]
    InvalidUrl(String),

    #[error("generator request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("generator returned status {0}")]
    Status(u16),

    #[error("generator timed out after {0:?}")]
    Timeout(Duration),

    #[error("generator returned an empty body")]
    EmptyBody,
}

/// Errors returned from HTTP handlers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("rate limit exceeded: {}", .0.message())]
    RateLimited(LimitReason),

    #[error("{0}")]
    BadRequest(String),

    #[error("file not found")]
    NotFound,

    #[error(transparent)]
    Generation(GenerateError),

    #[error(transparent)]
    Storage(StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) | StoreError::InvalidFilename(_) => ApiError::NotFound,
            other => ApiError::Storage(other),
        }
    }
}

impl From<GenerateError> for ApiError {
    fn from(err: GenerateError) -> Self {
        match err {
            GenerateError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            other => ApiError::Generation(other),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("blocking task failed: {err}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Generation(_) => StatusCode::BAD_GATEWAY,
            ApiError::Storage(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        match self {
            ApiError::RateLimited(reason) => {
                let retry_after = reason.retry_after().as_secs();
                let body = Json(serde_json::json!({
                    "error": "Rate limit exceeded",
                    "message": reason.message(),
                    "retry_after": retry_after,
                }));
                let mut resp = (status, body).into_response();
                resp.headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
                resp
            }
            other => {
                (status, Json(serde_json::json!({ "error": other.to_string() }))).into_response()
            }
        }
    }
}
