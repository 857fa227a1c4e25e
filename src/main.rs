use clap::Parser; // for cli
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use imagegen_gateway::clock::{Clock, SystemClock};
use imagegen_gateway::config::Args;
use imagegen_gateway::generator::RemoteGenerator;
use imagegen_gateway::middleware::cors_layer;
use imagegen_gateway::rate_limit::{AdmissionController, spawn_client_sweeper};
use imagegen_gateway::retention::{RetentionService, spawn_cleanup_scheduler};
use imagegen_gateway::state::AppState;
use imagegen_gateway::storage::ArtifactStore;
use imagegen_gateway::{router, telemetry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // parse cli arguments
    let args = Args::parse();
    telemetry::init_tracing(&args.log_level)?;
    let settings = args.validate()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let admission = Arc::new(AdmissionController::new(
        settings.admission.enabled,
        settings.admission.limits,
        Arc::clone(&clock),
    ));
    let store = Arc::new(ArtifactStore::open(
        &settings.store.base_dir,
        settings.store.resolve_search_days,
        Arc::clone(&clock),
    )?);
    let retention = Arc::new(RetentionService::new(
        Arc::clone(&store),
        settings.retention.max_age_days,
    ));
    let generator = Arc::new(RemoteGenerator::new(
        reqwest::Client::new(),
        settings.generator.base_url.clone(),
        settings.generator.timeout,
        settings.generator.max_concurrent,
    ));

    // background tasks
    if settings.admission.enabled {
        spawn_client_sweeper(Arc::clone(&admission), settings.admission.sweep_interval);
    }
    spawn_cleanup_scheduler(Arc::clone(&retention), settings.retention.check_interval);

    let state = Arc::new(AppState { admission, store, retention, generator });
    let app = match &settings.http.cors_origins {
        Some(origins) => router(state).layer(cors_layer(origins)),
        None => router(state),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(%addr, "Gateway running");
    info!(url = %settings.generator.base_url, "Forwarding generations");
    info!(
        enabled = settings.admission.enabled,
        per_minute = ?settings.admission.limits.per_minute(),
        per_hour = ?settings.admission.limits.per_hour(),
        "Rate limit"
    );
    info!(
        dir = %settings.store.base_dir.display(),
        max_age_days = settings.retention.max_age_days,
        "Image storage"
    );
    info!(enabled = settings.http.cors_origins.is_some(), "CORS");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
