use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, register_counter, register_counter_vec, register_gauge,
    register_histogram,
};

lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("imagegen_requests_total", "Total number of generation requests")
            .unwrap();
    pub static ref ADMISSIONS_DENIED: CounterVec = register_counter_vec!(
        "imagegen_admissions_denied_total",
        "Requests rejected by the rate limiter",
        &["reason"]
    )
    .unwrap();
    pub static ref ACTIVE_CLIENTS: Gauge = register_gauge!(
        "imagegen_rate_limit_active_clients",
        "Clients with live rate-limit windows"
    )
    .unwrap();
    pub static ref GENERATION_LATENCY: Histogram = register_histogram!(
        "imagegen_generation_latency_seconds",
        "Remote image generation latency in seconds"
    )
    .unwrap();
    pub static ref ARTIFACTS_SAVED: Counter =
        register_counter!("imagegen_artifacts_saved_total", "Artifacts written to storage")
            .unwrap();
    pub static ref ARTIFACT_BYTES_WRITTEN: Counter = register_counter!(
        "imagegen_artifact_bytes_written_total",
        "Bytes written to storage"
    )
    .unwrap();
    pub static ref CLEANUP_RUNS: Counter =
        register_counter!("imagegen_cleanup_runs_total", "Recorded retention sweeps").unwrap();
    pub static ref CLEANUP_FILES_DELETED: Counter = register_counter!(
        "imagegen_cleanup_files_deleted_total",
        "Files removed by retention sweeps"
    )
    .unwrap();
    pub static ref CLEANUP_BYTES_FREED: Counter = register_counter!(
        "imagegen_cleanup_bytes_freed_total",
        "Bytes freed by retention sweeps"
    )
    .unwrap();
}
