use axum::{Json, body::Bytes, extract::State};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use crate::error::ApiError;
use crate::handlers::ClientMeta;
use crate::metrics::REQUEST_TOTAL;
use crate::models::{GenerateRequest, GenerateResponse};
use crate::rate_limit::Admission;
use crate::state::AppState;

pub async fn generate_handler(
    State(state): State<Arc<AppState>>,
    ClientMeta(meta): ClientMeta,
    body: Bytes,
) -> Result<Json<GenerateResponse>, ApiError> {
    REQUEST_TOTAL.inc();

    // admission runs before the body is even parsed
    if let Admission::Denied(reason) = state.admission.admit(&meta) {
        return Err(ApiError::RateLimited(reason));
    }

    let payload: GenerateRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {e}")))?;
    let request = payload.normalized()?;

    let start_time = Instant::now();
    let image = state.generator.generate(&request).await?;

    let store = Arc::clone(&state.store);
    let prompt = request.prompt.clone();
    let record = tokio::task::spawn_blocking(move || store.save(&image, &prompt)).await??;

    let generation_time = start_time.elapsed().as_secs_f64();
    info!(filename = %record.filename, generation_time, "Generation complete");

    Ok(Json(GenerateResponse {
        success: true,
        download_url: format!("/download/{}", record.filename),
        filename: record.filename,
        generation_time,
        file_size: record.size_bytes,
    }))
}
