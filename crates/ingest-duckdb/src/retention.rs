//! Retention: periodic deletion of rows past their configured horizons,
//! scheduled on a `tokio::time::interval` with `MissedTickBehavior::Delay`,
//! with a process-wide timestamp guarding re-entry since both the
//! background loop and the `/api/cron/retention` endpoint can trigger a run.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tracing::{error, info};

use ingest_core::config::Config;

use crate::backend::DuckDbBackend;

static LAST_RUN_MS: AtomicI64 = AtomicI64::new(0);

/// Maximum rows one `DELETE` statement removes per chunk. A site with a
/// multi-year backlog deletes in many small transactions instead of one
/// unbounded statement, so the single `Mutex<Connection>` is never held for
/// longer than one chunk at a time and concurrent ingest/goal/webhook/rebuild
/// requests can interleave between chunks.
const RETENTION_CHUNK: i64 = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub raw_events_deleted: usize,
    pub sessions_deleted: usize,
    pub visitor_daily_deleted: usize,
    pub rollup_daily_deleted: usize,
    pub rollup_dimension_daily_deleted: usize,
    pub rollup_hourly_deleted: usize,
    pub rollup_dimension_hourly_deleted: usize,
}

impl DuckDbBackend {
    /// Deletes everything past its retention horizon, one bounded chunk (and
    /// one committed transaction) at a time per table.
    pub async fn run_retention(&self, config: &Config, now_ms: i64) -> anyhow::Result<RetentionReport> {
        let raw_event_horizon_ms = now_ms - config.raw_event_retention_days as i64 * 86_400_000;
        let raw_event_horizon_str = timestamp_string(raw_event_horizon_ms);
        let daily_horizon = day_string(now_ms - config.rollup_daily_retention_days as i64 * 86_400_000);
        let hourly_horizon = day_string(now_ms - config.rollup_hourly_retention_days as i64 * 86_400_000);

        let raw_events_deleted = self
            .delete_chunked(
                "DELETE FROM raw_events WHERE id IN \
                 (SELECT id FROM raw_events WHERE created_at < ?1 LIMIT ?2)",
                raw_event_horizon_str,
            )
            .await?;
        let sessions_deleted = self
            .delete_chunked(
                "DELETE FROM sessions WHERE (site_id, session_id, visitor_id) IN \
                 (SELECT site_id, session_id, visitor_id FROM sessions \
                  WHERE last_timestamp_ms < ?1 LIMIT ?2)",
                raw_event_horizon_ms,
            )
            .await?;

        let visitor_daily_deleted = self
            .delete_chunked(
                "DELETE FROM visitor_daily WHERE (site_id, date, visitor_id) IN \
                 (SELECT site_id, date, visitor_id FROM visitor_daily WHERE date < ?1 LIMIT ?2)",
                daily_horizon.clone(),
            )
            .await?;
        let rollup_daily_deleted = self
            .delete_chunked(
                "DELETE FROM rollup_daily WHERE (site_id, date) IN \
                 (SELECT site_id, date FROM rollup_daily WHERE date < ?1 LIMIT ?2)",
                daily_horizon.clone(),
            )
            .await?;
        let rollup_dimension_daily_deleted = self
            .delete_chunked(
                "DELETE FROM rollup_dimension_daily WHERE (site_id, date, dimension, value) IN \
                 (SELECT site_id, date, dimension, value FROM rollup_dimension_daily \
                  WHERE date < ?1 LIMIT ?2)",
                daily_horizon,
            )
            .await?;

        let rollup_hourly_deleted = self
            .delete_chunked(
                "DELETE FROM rollup_hourly WHERE (site_id, date, hour) IN \
                 (SELECT site_id, date, hour FROM rollup_hourly WHERE date < ?1 LIMIT ?2)",
                hourly_horizon.clone(),
            )
            .await?;
        let rollup_dimension_hourly_deleted = self
            .delete_chunked(
                "DELETE FROM rollup_dimension_hourly WHERE (site_id, date, hour, dimension, value) IN \
                 (SELECT site_id, date, hour, dimension, value FROM rollup_dimension_hourly \
                  WHERE date < ?1 LIMIT ?2)",
                hourly_horizon,
            )
            .await?;

        Ok(RetentionReport {
            raw_events_deleted,
            sessions_deleted,
            visitor_daily_deleted,
            rollup_daily_deleted,
            rollup_dimension_daily_deleted,
            rollup_hourly_deleted,
            rollup_dimension_hourly_deleted,
        })
    }

    /// Runs `sql` (an `id-in-subquery` delete ending `LIMIT ?2`, `?1` bound to
    /// `horizon`) repeatedly, each iteration its own transaction, until a
    /// round deletes fewer than `RETENTION_CHUNK` rows. Re-acquiring the
    /// connection lock between iterations lets other requests interleave
    /// instead of holding it for the whole backlog.
    async fn delete_chunked<P: duckdb::ToSql>(&self, sql: &str, horizon: P) -> anyhow::Result<usize> {
        let mut total = 0usize;
        loop {
            let affected = {
                let conn = self.conn.lock().await;
                let tx = conn.transaction()?;
                let affected = tx.execute(sql, duckdb::params![horizon, RETENTION_CHUNK])?;
                tx.commit()?;
                affected
            };
            total += affected;
            if (affected as i64) < RETENTION_CHUNK {
                break;
            }
        }
        Ok(total)
    }
}

fn timestamp_string(ts_ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ts_ms)
        .unwrap_or_else(chrono::Utc::now)
        .to_rfc3339()
}

fn day_string(ts_ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ts_ms)
        .unwrap_or_else(chrono::Utc::now)
        .date_naive()
        .to_string()
}

/// Background retention loop, spawned once at startup via `tokio::spawn`.
pub async fn run_retention_loop(backend: DuckDbBackend, config: Arc<Config>) {
    let mut interval = tokio::time::interval(config.cleanup_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(interval_ms = config.cleanup_interval_ms, "retention sweep scheduled");
    loop {
        interval.tick().await;
        if let Err(err) = run_guarded(&backend, &config).await {
            error!(error = %err, "retention sweep failed");
        }
    }
}

/// Runs a sweep unless one already ran within `config.cleanup_interval()`.
/// Shared by the background loop and the `/api/cron/retention` endpoint so
/// an operator-triggered run doesn't double up with the scheduled one.
pub async fn run_guarded(backend: &DuckDbBackend, config: &Config) -> anyhow::Result<RetentionReport> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let last = LAST_RUN_MS.load(Ordering::SeqCst);
    if now_ms - last < config.cleanup_interval_ms as i64 {
        return Ok(RetentionReport::default());
    }
    LAST_RUN_MS.store(now_ms, Ordering::SeqCst);

    let report = backend.run_retention(config, now_ms).await?;
    info!(
        raw_events = report.raw_events_deleted,
        sessions = report.sessions_deleted,
        rollup_daily = report.rollup_daily_deleted,
        rollup_hourly = report.rollup_hourly_deleted,
        "retention sweep completed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::model::{RawEvent, Site};

    fn test_config() -> Config {
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
            rate_limit_per_ip_per_min: 60,
            rate_limit_per_site_per_min: 300,
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

    #[tokio::test]
    async fn deletes_events_past_the_raw_event_horizon() {
        let backend = DuckDbBackend::open_in_memory().unwrap();
        let site = Site {
            id: "site1".to_string(),
            website_id: "w1".to_string(),
            api_key: "k1".to_string(),
            domain: "example.com".to_string(),
            timezone: "UTC".to_string(),
            revenue_provider: ingest_core::model::RevenueProvider::None,
            revenue_provider_key_enc: None,
        };
        backend.seed_site(&site).await.unwrap();

        let now_ms = 1_700_000_000_000_i64;
        let stale_ts = now_ms - 200 * 86_400_000;
        let event = RawEvent {
            id: "e1".to_string(),
            site_id: "site1".to_string(),
            event_id: None,
            event_type: ingest_core::model::EventType::Pageview,
            name: None,
            visitor_id: "v1".to_string(),
            session_id: None,
            timestamp_ms: stale_ts,
            metadata: Default::default(),
            normalized: Default::default(),
            created_at: chrono::DateTime::<chrono::Utc>::from_timestamp_millis(stale_ts).unwrap(),
        };
        {
            let conn = backend.conn.lock().await;
            let tx = conn.transaction().unwrap();
            crate::event_store::insert_event(&tx, &event).unwrap();
            tx.commit().unwrap();
        }

        let report = backend.run_retention(&test_config(), now_ms).await.unwrap();
        assert_eq!(report.raw_events_deleted, 1);
    }
}
