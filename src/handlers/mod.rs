mod cleanup;
mod download;
mod generate;
mod health;
mod metrics;
mod rate_limit;
mod storage;

pub use cleanup::{cleanup_handler, cleanup_status_handler};
pub use download::download_handler;
pub use generate::generate_handler;
pub use health::health_handler;
pub use metrics::metrics_handler;
pub use rate_limit::rate_limit_stats_handler;
pub use storage::{list_files_handler, storage_stats_handler};

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::header::USER_AGENT;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::Router;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::middleware;
use crate::rate_limit::RequestMeta;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let revalidated: Router<Arc<AppState>> = middleware::revalidate(
        Router::new()
            .route("/health", get(health_handler))
            .route("/api/storage/stats", get(storage_stats_handler)),
    );

    let routes = Router::new()
        .route("/generate", post(generate_handler))
        .route("/download/{filename}", get(download_handler))
        .route("/api/storage/files", get(list_files_handler))
        .route("/api/cleanup/status", get(cleanup_status_handler))
        .route("/api/cleanup", post(cleanup_handler))
        .route("/api/rate-limit/stats", get(rate_limit_stats_handler))
        .route("/metrics", get(metrics_handler))
        .merge(revalidated);

    let routes = middleware::security_headers(middleware::no_store(routes));
    middleware::request_tracing(routes).with_state(state)
}

/// Admission input pulled from the request: forwarded chain, peer, user agent.
pub struct ClientMeta(pub RequestMeta);

impl<S: Send + Sync> FromRequestParts<S> for ClientMeta {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded_for = parts.headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());
        let user_agent = parts.headers.get(USER_AGENT).and_then(|v| v.to_str().ok());

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(ClientMeta(RequestMeta::new(forwarded_for, &peer, user_agent.unwrap_or_default())))
    }
}
