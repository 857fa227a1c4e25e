use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use crate::error::{ApiError, StoreError};
use crate::state::AppState;

#[derive(Deserialize, Debug, Default)]
pub struct DownloadQuery {
    pub date: Option<NaiveDate>,
}

fn content_type(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".png") { "image/png" } else { "image/jpeg" }
}

// Serves an artifact as an attachment. Rejected names are plain 404s.
pub async fn download_handler(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let store = Arc::clone(&state.store);
    let name = filename.clone();
    let bytes = tokio::task::spawn_blocking(move || {
        let path = match query.date {
            Some(date) => store.resolve_on(&name, date)?,
            None => store.resolve(&name)?,
        };
        std::fs::read(&path).map_err(|e| StoreError::io(format!("reading {name}"), e))
    })
    .await??;

    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(content_type(&filename))),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}
