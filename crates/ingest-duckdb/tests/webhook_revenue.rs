use hmac::{Hmac, Mac};
use sha2::Sha256;

use ingest_core::config::Config;
use ingest_core::model::{RevenueProvider, Site};
use ingest_duckdb::DuckDbBackend;

type HmacSha256 = Hmac<Sha256>;

fn config() -> Config {
    Config {
        port: 3000,
        data_dir: "./data".to_string(),
        geoip_path: "./GeoLite2-City.mmdb".to_string(),
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
        stripe_webhook_secret: Some("whsec_test".to_string()),
        lemonsqueezy_webhook_secret: None,
        cron_secret: None,
    }
}

fn stripe_header(secret: &str, body: &[u8], t: i64) -> String {
    let signed_payload = format!("{t}.{}", String::from_utf8_lossy(body));
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(signed_payload.as_bytes());
    let sig = hex::encode(mac.finalize().into_bytes());
    format!("t={t},v1={sig}")
}

/// A Stripe `order_created` webhook with an attributed
/// pageview creates a payment + derived `payment`/`goal` raw events and
/// additive revenue rollups; replaying the identical webhook is a no-op.
#[tokio::test]
async fn stripe_order_created_is_idempotent_and_attributes_revenue() {
    let db = DuckDbBackend::open_in_memory().unwrap();
    let cfg = config();
    let site = Site {
        id: "site_1".to_string(),
        website_id: "w1".to_string(),
        api_key: "k1".to_string(),
        domain: "example.com".to_string(),
        timezone: "UTC".to_string(),
        revenue_provider: RevenueProvider::Stripe,
        revenue_provider_key_enc: None,
    };
    db.seed_site(&site).await.unwrap();

    let now = 1_700_000_000_000_i64;
    let pageview = br#"{"type":"pageview","websiteId":"w1","path":"/","visitorId":"visitor-1"}"#;
    db.ingest(
        &cfg,
        &site,
        pageview,
        &ingest_core::validator::RequestHeaders {
            user_agent: Some("Mozilla/5.0"),
            origin: Some("https://example.com"),
            referer: None,
            server_key_provided: false,
        },
        None,
        Some("Mozilla/5.0"),
        now,
    )
    .await
    .unwrap();

    let body = serde_json::json!({
        "type": "order_created",
        "data": {
            "id": "txn_1",
            "amount": 1999,
            "currency": "USD",
            "meta": { "custom_data": { "ezlytics_visitor_id": "visitor-1" } }
        }
    })
    .to_string();
    let t = now / 1000;
    let header = stripe_header("whsec_test", body.as_bytes(), t);

    let first = db
        .process_webhook(
            &cfg,
            &site,
            RevenueProvider::Stripe,
            &header,
            body.as_bytes(),
            now,
        )
        .await
        .unwrap();
    assert!(!first.deduped);

    let second = db
        .process_webhook(
            &cfg,
            &site,
            RevenueProvider::Stripe,
            &header,
            body.as_bytes(),
            now,
        )
        .await
        .unwrap();
    assert!(second.deduped);

    let rebuild = db
        .rebuild(&ingest_duckdb::rebuild::RebuildRequest {
            site_id: Some(site.id.clone()),
            from_ms: now - 86_400_000,
            to_ms: now + 86_400_000,
            dry_run: true,
            include_diff: true,
        })
        .await
        .unwrap();
    assert!(rebuild.diff.is_empty(), "webhook revenue should rebuild identically: {:?}", rebuild.diff);
}

/// An invalid Stripe signature is rejected before any state changes.
#[tokio::test]
async fn invalid_stripe_signature_is_rejected() {
    let db = DuckDbBackend::open_in_memory().unwrap();
    let cfg = config();
    let site = Site {
        id: "site_1".to_string(),
        website_id: "w1".to_string(),
        api_key: "k1".to_string(),
        domain: "example.com".to_string(),
        timezone: "UTC".to_string(),
        revenue_provider: RevenueProvider::Stripe,
        revenue_provider_key_enc: None,
    };
    db.seed_site(&site).await.unwrap();

    let body = serde_json::json!({
        "type": "order_created",
        "data": {
            "id": "txn_2",
            "amount": 500,
            "currency": "USD",
            "meta": { "custom_data": { "ezlytics_visitor_id": "visitor-1" } }
        }
    })
    .to_string();
    let now = 1_700_000_000_000_i64;
    let bad_header = format!("t={},v1=deadbeef", now / 1000);

    let err = db
        .process_webhook(&cfg, &site, RevenueProvider::Stripe, &bad_header, body.as_bytes(), now)
        .await
        .unwrap_err();
    assert!(matches!(err, ingest_duckdb::webhook::WebhookError::SignatureMismatch));
}
