pub mod clock;
pub mod config;
pub mod error;
pub mod generator;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod retention;
pub mod state;
pub mod storage;
pub mod telemetry;

pub use handlers::router;
