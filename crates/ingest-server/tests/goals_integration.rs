use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
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

async fn json_body(response: axum::http::Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("parse JSON")
}

#[tokio::test]
async fn goal_without_bearer_token_is_unauthorized() {
    let db = DuckDbBackend::open_in_memory().expect("in-memory DuckDB");
    db.seed_site(&seeded_site()).await.expect("seed site");
    let state = Arc::new(AppState::new(db, test_config()));
    let app = build_app(state);

    let body = r#"{"datafast_visitor_id":"v1","name":"signup"}"#;
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/goals")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("build request");

    let response = app.oneshot(request).await.expect("request");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn goal_after_pageview_is_recorded_and_idempotent() {
    let db = DuckDbBackend::open_in_memory().expect("in-memory DuckDB");
    db.seed_site(&seeded_site()).await.expect("seed site");
    let state = Arc::new(AppState::new(db, test_config()));
    let app = build_app(state);

    let pageview = r#"{"type":"pageview","websiteId":"w1","path":"/","visitorId":"v1"}"#;
    let pv_response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/ingest")
                .header("content-type", "application/json")
                .body(Body::from(pageview))
                .expect("build request"),
        )
        .await
        .expect("request");
    assert_eq!(pv_response.status(), StatusCode::OK);

    let goal = r#"{"datafast_visitor_id":"v1","name":"signup"}"#;
    let first = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/goals")
                .header("content-type", "application/json")
                .header("authorization", "Bearer k1")
                .header("x-idempotency-key", "idem-1")
                .body(Body::from(goal))
                .expect("build request"),
        )
        .await
        .expect("request");
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(json_body(first).await["deduped"], false);

    let second = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/goals")
                .header("content-type", "application/json")
                .header("authorization", "Bearer k1")
                .header("x-idempotency-key", "idem-1")
                .body(Body::from(goal))
                .expect("build request"),
        )
        .await
        .expect("request");
    assert_eq!(json_body(second).await["deduped"], true);
}

#[tokio::test]
async fn goal_without_prior_pageview_returns_conflict() {
    let db = DuckDbBackend::open_in_memory().expect("in-memory DuckDB");
    db.seed_site(&seeded_site()).await.expect("seed site");
    let state = Arc::new(AppState::new(db, test_config()));
    let app = build_app(state);

    let goal = r#"{"datafast_visitor_id":"unseen","name":"signup"}"#;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/goals")
                .header("content-type", "application/json")
                .header("authorization", "Bearer k1")
                .body(Body::from(goal))
                .expect("build request"),
        )
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::CONFLICT);
}
