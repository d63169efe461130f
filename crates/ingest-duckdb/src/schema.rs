/// DuckDB initialization SQL, executed once at open time via
/// `Connection::execute_batch`. Every statement uses `IF NOT EXISTS` so
/// startup is idempotent.
///
/// `memory_limit` comes from `Config.duckdb_memory_limit`
/// (env `INGEST_DUCKDB_MEMORY`, default `"1GB"`).
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

-- ===========================================
-- SETTINGS
-- ===========================================
-- 'daily_salt'    – hex secret for visitor_id hashing, rotated at midnight UTC
-- 'previous_salt' – yesterday's salt, kept briefly so ids derived just
--                   before rotation still resolve consistently
CREATE TABLE IF NOT EXISTS settings (
    key   VARCHAR PRIMARY KEY,
    value VARCHAR NOT NULL
);

-- ===========================================
-- SITES
-- ===========================================
CREATE TABLE IF NOT EXISTS sites (
    id                          VARCHAR PRIMARY KEY,
    website_id                  VARCHAR NOT NULL UNIQUE,
    api_key                     VARCHAR NOT NULL UNIQUE,
    domain                      VARCHAR NOT NULL,
    timezone                    VARCHAR(64) NOT NULL DEFAULT 'UTC',
    revenue_provider            VARCHAR NOT NULL DEFAULT 'none',
    revenue_provider_key_enc    VARCHAR,
    created_at                  TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_sites_website_id ON sites(website_id);

-- ===========================================
-- RAW EVENTS (immutable)
-- ===========================================
CREATE TABLE IF NOT EXISTS raw_events (
    id              VARCHAR PRIMARY KEY,
    site_id         VARCHAR NOT NULL,
    event_id        VARCHAR,
    event_type      VARCHAR NOT NULL,
    name            VARCHAR,
    visitor_id      VARCHAR NOT NULL,
    session_id      VARCHAR,
    timestamp_ms    BIGINT NOT NULL,
    metadata_json   VARCHAR NOT NULL,
    normalized_json VARCHAR NOT NULL,
    created_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_raw_events_dedupe
    ON raw_events(site_id, event_id) WHERE event_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_raw_events_site_time
    ON raw_events(site_id, created_at);
CREATE INDEX IF NOT EXISTS idx_raw_events_site_visitor
    ON raw_events(site_id, visitor_id, event_type, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_raw_events_retention
    ON raw_events(created_at);

-- ===========================================
-- SESSIONS
-- ===========================================
CREATE TABLE IF NOT EXISTS sessions (
    site_id             VARCHAR NOT NULL,
    session_id          VARCHAR NOT NULL,
    visitor_id          VARCHAR NOT NULL,
    first_timestamp_ms  BIGINT NOT NULL,
    last_timestamp_ms   BIGINT NOT NULL,
    pageviews           INTEGER NOT NULL,
    first_context_json  VARCHAR NOT NULL,
    PRIMARY KEY (site_id, session_id, visitor_id)
);
CREATE INDEX IF NOT EXISTS idx_sessions_retention
    ON sessions(last_timestamp_ms);

-- ===========================================
-- PAYMENTS
-- ===========================================
CREATE TABLE IF NOT EXISTS payments (
    site_id         VARCHAR NOT NULL,
    transaction_id  VARCHAR NOT NULL,
    amount_minor    BIGINT NOT NULL,
    currency        VARCHAR NOT NULL,
    provider        VARCHAR NOT NULL,
    event_type      VARCHAR NOT NULL,
    visitor_id      VARCHAR,
    customer_id     VARCHAR,
    email           VARCHAR,
    created_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (site_id, transaction_id)
);

-- ===========================================
-- VISITOR DAILY (dedupe membership)
-- ===========================================
CREATE TABLE IF NOT EXISTS visitor_daily (
    site_id     VARCHAR NOT NULL,
    date        DATE NOT NULL,
    visitor_id  VARCHAR NOT NULL,
    PRIMARY KEY (site_id, date, visitor_id)
);

-- ===========================================
-- ROLLUPS — overall
-- ===========================================
CREATE TABLE IF NOT EXISTS rollup_hourly (
    site_id                     VARCHAR NOT NULL,
    date                        DATE NOT NULL,
    hour                        INTEGER NOT NULL,
    visitors                    BIGINT NOT NULL DEFAULT 0,
    sessions                    BIGINT NOT NULL DEFAULT 0,
    bounced_sessions            BIGINT NOT NULL DEFAULT 0,
    avg_session_duration_ms     BIGINT NOT NULL DEFAULT 0,
    pageviews                   BIGINT NOT NULL DEFAULT 0,
    goals                       BIGINT NOT NULL DEFAULT 0,
    revenue                     BIGINT NOT NULL DEFAULT 0,
    revenue_new                 BIGINT NOT NULL DEFAULT 0,
    revenue_renewal             BIGINT NOT NULL DEFAULT 0,
    revenue_refund              BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (site_id, date, hour)
);

CREATE TABLE IF NOT EXISTS rollup_daily (
    site_id                     VARCHAR NOT NULL,
    date                        DATE NOT NULL,
    visitors                    BIGINT NOT NULL DEFAULT 0,
    sessions                    BIGINT NOT NULL DEFAULT 0,
    bounced_sessions            BIGINT NOT NULL DEFAULT 0,
    avg_session_duration_ms     BIGINT NOT NULL DEFAULT 0,
    pageviews                   BIGINT NOT NULL DEFAULT 0,
    goals                       BIGINT NOT NULL DEFAULT 0,
    revenue                     BIGINT NOT NULL DEFAULT 0,
    revenue_new                 BIGINT NOT NULL DEFAULT 0,
    revenue_renewal             BIGINT NOT NULL DEFAULT 0,
    revenue_refund              BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (site_id, date)
);

-- ===========================================
-- ROLLUPS — dimensional
-- ===========================================
CREATE TABLE IF NOT EXISTS rollup_dimension_hourly (
    site_id                     VARCHAR NOT NULL,
    date                        DATE NOT NULL,
    hour                        INTEGER NOT NULL,
    dimension                   VARCHAR NOT NULL,
    value                       VARCHAR NOT NULL,
    visitors                    BIGINT NOT NULL DEFAULT 0,
    sessions                    BIGINT NOT NULL DEFAULT 0,
    bounced_sessions            BIGINT NOT NULL DEFAULT 0,
    avg_session_duration_ms     BIGINT NOT NULL DEFAULT 0,
    pageviews                   BIGINT NOT NULL DEFAULT 0,
    goals                       BIGINT NOT NULL DEFAULT 0,
    revenue                     BIGINT NOT NULL DEFAULT 0,
    revenue_new                 BIGINT NOT NULL DEFAULT 0,
    revenue_renewal             BIGINT NOT NULL DEFAULT 0,
    revenue_refund              BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (site_id, date, hour, dimension, value)
);

CREATE TABLE IF NOT EXISTS rollup_dimension_daily (
    site_id                     VARCHAR NOT NULL,
    date                        DATE NOT NULL,
    dimension                   VARCHAR NOT NULL,
    value                       VARCHAR NOT NULL,
    visitors                    BIGINT NOT NULL DEFAULT 0,
    sessions                    BIGINT NOT NULL DEFAULT 0,
    bounced_sessions            BIGINT NOT NULL DEFAULT 0,
    avg_session_duration_ms     BIGINT NOT NULL DEFAULT 0,
    pageviews                   BIGINT NOT NULL DEFAULT 0,
    goals                       BIGINT NOT NULL DEFAULT 0,
    revenue                     BIGINT NOT NULL DEFAULT 0,
    revenue_new                 BIGINT NOT NULL DEFAULT 0,
    revenue_renewal             BIGINT NOT NULL DEFAULT 0,
    revenue_refund              BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (site_id, date, dimension, value)
);
"#
    )
}

/// Migrations tracking table, run before [`init_sql`].
pub const MIGRATIONS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS _migrations (
    id          VARCHAR PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#;
