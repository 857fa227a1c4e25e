//! Layers wrapped around the router: security and cache headers, CORS and
//! request timing.

use axum::Router;
use axum::http::{HeaderValue, Method, header};
use axum::response::Response;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{Level, Span, debug, warn};

const SLOW_REQUEST: Duration = Duration::from_secs(1);

const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; img-src 'self' data: https:; \
    connect-src 'self'; object-src 'none'; base-uri 'self'; form-action 'self'";

pub const NO_STORE: &str = "no-cache, no-store, must-revalidate";
pub const REVALIDATE: &str = "no-cache, must-revalidate";

fn set_if_missing<S>(router: Router<S>, name: header::HeaderName, value: &'static str) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(SetResponseHeaderLayer::if_not_present(name, HeaderValue::from_static(value)))
}

/// nosniff, frame denial, referrer policy and CSP on every response.
pub fn security_headers<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    [
        (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        (header::X_FRAME_OPTIONS, "DENY"),
        (header::X_XSS_PROTECTION, "1; mode=block"),
        (header::REFERRER_POLICY, "strict-origin-when-cross-origin"),
        (header::CONTENT_SECURITY_POLICY, CONTENT_SECURITY_POLICY),
    ]
    .into_iter()
    .fold(router, |router, (name, value)| set_if_missing(router, name, value))
}

/// Health and storage stats may be cached but must be revalidated.
pub fn revalidate<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    set_if_missing(router, header::CACHE_CONTROL, REVALIDATE)
}

/// Everything else is never cached. Routes that already set `Cache-Control` keep it.
pub fn no_store<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let router = set_if_missing(router, header::PRAGMA, "no-cache");
    let router = set_if_missing(router, header::EXPIRES, "0");
    set_if_missing(router, header::CACHE_CONTROL, NO_STORE)
}

/// Request spans at info, with a warning for anything slower than a second.
pub fn request_tracing<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(|response: &Response, latency: Duration, _span: &Span| {
                if latency > SLOW_REQUEST {
                    warn!(status = %response.status(), ?latency, "Slow request");
                } else {
                    debug!(status = %response.status(), ?latency, "Request completed");
                }
            }),
    )
}

/// An empty origin list allows any origin.
pub fn cors_layer(origins: &[HeaderValue]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().cloned())
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(Duration::from_secs(3600))
}
