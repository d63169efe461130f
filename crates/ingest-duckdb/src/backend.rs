use std::sync::Arc;

use anyhow::Result;
use duckdb::Connection;
use tokio::sync::Mutex;
use tracing::info;

use crate::schema::{init_sql, MIGRATIONS_TABLE_SQL};

/// Embedded, single-writer store for the ingest pipeline.
///
/// DuckDB has no row-level locking; the `Arc<Mutex<Connection>>` is both the
/// concurrency guard *and*, for this crate's purposes, the stand-in for a
/// `SELECT ... FOR UPDATE` row lock — since only one write transaction can
/// be in flight at a time, the session row a request reads-then-writes
/// cannot be concurrently mutated out from under it.
#[derive(Clone)]
pub struct DuckDbBackend {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl DuckDbBackend {
    /// Open (or create) a DuckDB database file at `path`.
    pub fn open(path: &str, memory_limit: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(MIGRATIONS_TABLE_SQL)?;
        conn.execute_batch(&init_sql(memory_limit))?;
        info!(path, memory_limit, "duckdb opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database. Intended for tests: data is discarded on drop.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(MIGRATIONS_TABLE_SQL)?;
        conn.execute_batch(&init_sql("512MB"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// `SELECT 1` liveness check for `GET /health`.
    pub async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch("SELECT 1")?;
        Ok(())
    }

    /// Insert or replace a site row. Used by test fixtures and onboarding.
    pub async fn seed_site(&self, site: &ingest_core::model::Site) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT OR REPLACE INTO sites
                (id, website_id, api_key, domain, timezone, revenue_provider, revenue_provider_key_enc, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, CURRENT_TIMESTAMP)"#,
            duckdb::params![
                site.id,
                site.website_id,
                site.api_key,
                site.domain,
                site.timezone,
                revenue_provider_str(site.revenue_provider),
                site.revenue_provider_key_enc,
            ],
        )?;
        Ok(())
    }

    pub async fn find_site_by_website_id(&self, website_id: &str) -> Result<Option<ingest_core::model::Site>> {
        let conn = self.conn.lock().await;
        find_site_by(&conn, "website_id", website_id)
    }

    pub async fn find_site_by_api_key(&self, api_key: &str) -> Result<Option<ingest_core::model::Site>> {
        let conn = self.conn.lock().await;
        find_site_by(&conn, "api_key", api_key)
    }

    /// Daily visitor-id hashing salt. Generates and persists a fresh random
    /// salt on first use; callers are expected to call this once per
    /// request rather than cache it across the midnight UTC boundary.
    pub async fn daily_salt(&self) -> Result<String> {
        let today = chrono::Utc::now().date_naive().to_string();
        let conn = self.conn.lock().await;
        let key = "daily_salt";
        let stored: Option<(String, String)> = conn
            .query_row(
                "SELECT value, key FROM settings WHERE key = 'daily_salt_date'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();
        if let Some((date, _)) = &stored {
            if date == &today {
                let salt: String = conn.query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    duckdb::params![key],
                    |row| row.get(0),
                )?;
                return Ok(salt);
            }
        }
        // Rotate: move current salt to previous_salt, mint a new one.
        if let Ok(current) = conn.query_row(
            "SELECT value FROM settings WHERE key = 'daily_salt'",
            [],
            |row| row.get::<_, String>(0),
        ) {
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES ('previous_salt', ?1)",
                duckdb::params![current],
            )?;
        }
        let fresh = generate_salt();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES ('daily_salt', ?1)",
            duckdb::params![fresh],
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES ('daily_salt_date', ?1)",
            duckdb::params![today],
        )?;
        Ok(fresh)
    }
}

fn generate_salt() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub(crate) fn revenue_provider_str(p: ingest_core::model::RevenueProvider) -> &'static str {
    use ingest_core::model::RevenueProvider::*;
    match p {
        None => "none",
        Stripe => "stripe",
        Lemonsqueezy => "lemonsqueezy",
    }
}

pub(crate) fn parse_revenue_provider(raw: &str) -> ingest_core::model::RevenueProvider {
    use ingest_core::model::RevenueProvider::*;
    match raw {
        "stripe" => Stripe,
        "lemonsqueezy" => Lemonsqueezy,
        _ => None,
    }
}

fn find_site_by(
    conn: &Connection,
    column: &str,
    value: &str,
) -> Result<Option<ingest_core::model::Site>> {
    let sql = format!(
        "SELECT id, website_id, api_key, domain, timezone, revenue_provider, revenue_provider_key_enc
         FROM sites WHERE {column} = ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(duckdb::params![value])?;
    if let Some(row) = rows.next()? {
        Ok(Some(ingest_core::model::Site {
            id: row.get(0)?,
            website_id: row.get(1)?,
            api_key: row.get(2)?,
            domain: row.get(3)?,
            timezone: row.get(4)?,
            revenue_provider: parse_revenue_provider(&row.get::<_, String>(5)?),
            revenue_provider_key_enc: row.get(6)?,
        }))
    } else {
        Ok(None)
    }
}
