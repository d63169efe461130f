use std::sync::Arc;

use ingest_core::config::Config;
use ingest_duckdb::DuckDbBackend;

use crate::auth::rate_limit::RateLimiter;

/// Shared application state injected into every Axum handler via
/// [`axum::extract::State`].
///
/// Unlike a buffered collector, every route here drives the ingest pipeline
/// transactionally per request (`DuckDbBackend::ingest`/`record_goal`/
/// `process_webhook` each open and commit their own transaction) — there is
/// no in-memory event buffer to flush.
#[derive(Clone)]
pub struct AppState {
    /// The DuckDB backend. Internally uses `Arc<tokio::sync::Mutex<Connection>>`
    /// so it is already cheap to clone and async-safe.
    pub db: Arc<DuckDbBackend>,

    /// Parsed configuration, loaded once at startup from environment variables.
    pub config: Arc<Config>,

    /// In-process sliding-window rate limiter, sharded across mutexes.
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(db: DuckDbBackend, config: Config) -> Self {
        let rate_limiter = RateLimiter::new(
            config.rate_limit_per_ip_per_min,
            config.rate_limit_per_site_per_min,
        );
        Self {
            db: Arc::new(db),
            config: Arc::new(config),
            rate_limiter: Arc::new(rate_limiter),
        }
    }
}
