use axum::{Json, extract::{Query, State}};
use std::sync::Arc;
use crate::error::ApiError;
use crate::models::ListQuery;
use crate::state::AppState;
use crate::storage::{StorageRecord, StorageStats};

pub async fn storage_stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StorageStats>, ApiError> {
    let store = Arc::clone(&state.store);
    let stats = tokio::task::spawn_blocking(move || store.stats()).await??;
    Ok(Json(stats))
}

pub async fn list_files_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<StorageRecord>>, ApiError> {
    let store = Arc::clone(&state.store);
    let files = tokio::task::spawn_blocking(move || store.list(query.date, query.limit)).await??;
    Ok(Json(files))
}
