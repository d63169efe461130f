use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use ingest_core::config::Config;
use ingest_core::model::{RevenueProvider, Site};
use ingest_duckdb::DuckDbBackend;
use ingest_server::app::build_app;
use ingest_server::state::AppState;

fn test_config() -> Config {
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
        rate_limit_per_ip_per_min: 2,
        rate_limit_per_site_per_min: 6000,
        raw_event_retention_days: 90,
        rollup_daily_retention_days: 1095,
        rollup_hourly_retention_days: 30,
        cleanup_interval_ms: 6 * 60 * 60 * 1000,
        revenue_provider_key_secret: "x".repeat(32),
        stripe_webhook_secret: None,
        lemonsqueezy_webhook_secret: None,
        cron_secret: Some("cron-secret".to_string()),
    }
}

fn seeded_site() -> Site {
    Site {
        id: "site_1".to_string(),
        website_id: "w1".to_string(),
        api_key: "k1".to_string(),
        domain: "example.com".to_string(),
        timezone: "UTC".to_string(),
        revenue_provider: RevenueProvider::None,
        revenue_provider_key_enc: None,
    }
}

#[tokio::test]
async fn ingest_is_rate_limited_per_ip_without_connect_info() {
    let db = DuckDbBackend::open_in_memory().expect("in-memory DuckDB");
    db.seed_site(&seeded_site()).await.expect("seed site");
    let state = Arc::new(AppState::new(db, test_config()));
    let app = build_app(state);

    let body = r#"{"type":"pageview","websiteId":"w1","path":"/","visitorId":"v1"}"#;
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/ingest")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .expect("build request"),
            )
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK);
    }

    let third = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/ingest")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .expect("build request"),
        )
        .await
        .expect("request");
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(third.headers().contains_key("retry-after"));
}

#[tokio::test]
async fn cron_endpoint_requires_configured_secret() {
    let db = DuckDbBackend::open_in_memory().expect("in-memory DuckDB");
    let state = Arc::new(AppState::new(db, test_config()));
    let app = build_app(state);

    let unauthorized = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/cron/retention")
                .body(Body::empty())
                .expect("build request"),
        )
        .await
        .expect("request");
    assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

    let authorized = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/cron/retention")
                .header("x-cron-secret", "cron-secret")
                .body(Body::empty())
                .expect("build request"),
        )
        .await
        .expect("request");
    assert_eq!(authorized.status(), StatusCode::OK);
}

#[tokio::test]
async fn cron_rebuild_requires_secret_and_runs_dry_run() {
    let db = DuckDbBackend::open_in_memory().expect("in-memory DuckDB");
    db.seed_site(&seeded_site()).await.expect("seed site");
    let state = Arc::new(AppState::new(db, test_config()));
    let app = build_app(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/cron/rollup-rebuild?from=0&to=2000000000000&dryRun=true&secret=cron-secret")
                .body(Body::empty())
                .expect("build request"),
        )
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
}
