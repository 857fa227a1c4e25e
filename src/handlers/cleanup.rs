use axum::{Json, extract::State};
use std::sync::Arc;
use crate::error::ApiError;
use crate::models::CleanupRequest;
use crate::retention::{CleanupStatus, ScheduleOutcome};
use crate::state::AppState;

pub async fn cleanup_status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CleanupStatus>, ApiError> {
    let retention = Arc::clone(&state.retention);
    let status = tokio::task::spawn_blocking(move || retention.status()).await??;
    Ok(Json(status))
}

// dry_run wins over force; neither means "only if due"
pub async fn cleanup_handler(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CleanupRequest>>,
) -> Result<Json<ScheduleOutcome>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let retention = Arc::clone(&state.retention);

    let outcome = tokio::task::spawn_blocking(move || {
        if req.dry_run {
            retention.sweep(retention.max_age_days(), true).map(ScheduleOutcome::Ran)
        } else if req.force {
            retention.run_forced().map(ScheduleOutcome::Ran)
        } else {
            retention.run_if_due()
        }
    })
    .await??;

    Ok(Json(outcome))
}
