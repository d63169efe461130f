use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use ingest_core::config::Config;
use ingest_duckdb::DuckDbBackend;
use ingest_server::app::build_app;
use ingest_server::state::AppState;

pub fn test_config() -> Config {
    Config {
        port: 0,
        data_dir: "/tmp/ingest-server-test".to_string(),
        geoip_path: "/nonexistent/GeoLite2-City.mmdb".to_string(),
        duckdb_memory_limit: "512MB".to_string(),
        database_url: ":memory:".to_string(),
        max_payload_bytes: 32 * 1024,
        max_backfill_ms: 86_400_000,
        max_client_ts_skew_ms: 300_000,
        server_key: None,
        rate_limit_per_ip_per_min: 6000,
        rate_limit_per_site_per_min: 6000,
        raw_event_retention_days: 90,
        rollup_daily_retention_days: 1095,
        rollup_hourly_retention_days: 30,
        cleanup_interval_ms: 6 * 60 * 60 * 1000,
        revenue_provider_key_secret: "x".repeat(32),
        stripe_webhook_secret: None,
        lemonsqueezy_webhook_secret: None,
        cron_secret: None,
    }
}

pub async fn json_body(response: axum::http::Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("parse JSON")
}

#[tokio::test]
async fn health_returns_200_when_db_reachable() {
    let db = DuckDbBackend::open_in_memory().expect("in-memory DuckDB");
    let state = Arc::new(AppState::new(db, test_config()));
    let app = build_app(state);

    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .expect("build request");

    let response = app.oneshot(request).await.expect("request");
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn script_is_served_with_long_lived_cache_headers() {
    let db = DuckDbBackend::open_in_memory().expect("in-memory DuckDB");
    let state = Arc::new(AppState::new(db, test_config()));
    let app = build_app(state);

    let request = Request::builder()
        .method("GET")
        .uri("/js/script.js")
        .body(Body::empty())
        .expect("build request");

    let response = app.oneshot(request).await.expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "public, max-age=3600, immutable"
    );
}
