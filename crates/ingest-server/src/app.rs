use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{routes, state::AppState};

/// Construct the Axum [`Router`] with all routes and middleware attached.
///
/// Middleware runs outer-to-inner on the request, inner-to-outer on the
/// response:
///
/// 1. `TraceLayer` — structured request/response logging via `tracing`.
/// 2. `CorsLayer` — permissive CORS; the tracking script is embedded on
///    third-party sites, so the browser needs CORS headers to call `/api/v1/*`
///    cross-origin.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health::health))
        .route("/js/script.js", get(routes::script::script))
        .route("/api/v1/ingest", post(routes::ingest::ingest))
        .route("/api/v1/goals", post(routes::goals::record_goal))
        .route(
            "/api/webhooks/{provider}/{website_id}",
            post(routes::webhooks::webhook),
        )
        .route(
            "/api/cron/retention",
            get(routes::cron::retention).post(routes::cron::retention),
        )
        .route(
            "/api/cron/rollup-rebuild",
            get(routes::cron::rebuild).post(routes::cron::rebuild),
        )
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
