use axum::{Json, extract::State};
use std::sync::Arc;
use crate::rate_limit::AdmissionSnapshot;
use crate::state::AppState;

pub async fn rate_limit_stats_handler(State(state): State<Arc<AppState>>) -> Json<AdmissionSnapshot> {
    Json(state.admission.snapshot())
}
