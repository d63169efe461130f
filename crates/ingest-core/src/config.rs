#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: String,
    pub geoip_path: String,
    pub duckdb_memory_limit: String,
    pub database_url: String,

    pub max_payload_bytes: usize,
    pub max_backfill_ms: i64,
    pub max_client_ts_skew_ms: i64,
    pub server_key: Option<String>,

    pub rate_limit_per_ip_per_min: u32,
    pub rate_limit_per_site_per_min: u32,

    pub raw_event_retention_days: u32,
    pub rollup_daily_retention_days: u32,
    pub rollup_hourly_retention_days: u32,
    pub cleanup_interval_ms: u64,

    pub revenue_provider_key_secret: String,
    pub stripe_webhook_secret: Option<String>,
    pub lemonsqueezy_webhook_secret: Option<String>,

    pub cron_secret: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let revenue_provider_key_secret = std::env::var("REVENUE_PROVIDER_KEY_SECRET")
            .map_err(|_| "REVENUE_PROVIDER_KEY_SECRET is required".to_string())?;
        if revenue_provider_key_secret.len() < 32 {
            return Err("REVENUE_PROVIDER_KEY_SECRET must be at least 32 chars".to_string());
        }

        Ok(Self {
            port: std::env::var("INGEST_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|e| format!("invalid INGEST_PORT: {e}"))?,
            data_dir: std::env::var("INGEST_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            geoip_path: std::env::var("GEOIP_MMDB_PATH")
                .unwrap_or_else(|_| "./GeoLite2-City.mmdb".to_string()),
            duckdb_memory_limit: std::env::var("INGEST_DUCKDB_MEMORY")
                .unwrap_or_else(|_| "1GB".to_string()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "./data/ingest.db".to_string()),

            max_payload_bytes: std::env::var("MAX_PAYLOAD_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(32 * 1024),
            max_backfill_ms: std::env::var("MAX_BACKFILL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(24 * 60 * 60 * 1000),
            max_client_ts_skew_ms: std::env::var("MAX_CLIENT_TS_SKEW_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5 * 60 * 1000),
            server_key: std::env::var("INGEST_SERVER_KEY").ok(),

            rate_limit_per_ip_per_min: std::env::var("RATE_LIMIT_PER_IP_PER_MIN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            rate_limit_per_site_per_min: std::env::var("RATE_LIMIT_PER_SITE_PER_MIN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),

            raw_event_retention_days: std::env::var("RAW_EVENT_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(90),
            rollup_daily_retention_days: std::env::var("ROLLUP_DAILY_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1095),
            rollup_hourly_retention_days: std::env::var("ROLLUP_HOURLY_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            cleanup_interval_ms: std::env::var("CLEANUP_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(6 * 60 * 60 * 1000),

            revenue_provider_key_secret,
            stripe_webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET").ok(),
            lemonsqueezy_webhook_secret: std::env::var("LEMONSQUEEZY_WEBHOOK_SECRET").ok(),

            cron_secret: std::env::var("CRON_SECRET").ok(),
        })
    }

    pub fn cleanup_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.cleanup_interval_ms)
    }
}
