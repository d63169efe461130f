//! Rebuild: replays raw events through the same pure state machine the live
//! path uses (`ingest_core::session::apply_pageview`, `ingest_core::rollup`)
//! so rebuilt aggregates agree with the live path by construction, not by a
//! second hand-maintained implementation.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use duckdb::{params, Transaction};
use serde::Serialize;

use ingest_core::model::{
    Bucket, Dimension, DimensionDelta, EventType, MetricVector, MetricsDelta, PaymentEventType,
    RawEvent, Session, SessionContext,
};
use ingest_core::rollup as core_rollup;
use ingest_core::session::apply_pageview;

use crate::backend::DuckDbBackend;
use crate::rollup_store;

#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error("to must be after from")]
    InvalidRange,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<duckdb::Error> for RebuildError {
    fn from(e: duckdb::Error) -> Self {
        Self::Internal(e.into())
    }
}

#[derive(Debug, Clone)]
pub struct RebuildRequest {
    pub site_id: Option<String>,
    pub from_ms: i64,
    pub to_ms: i64,
    pub dry_run: bool,
    pub include_diff: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketDiff {
    pub site_id: String,
    pub date: NaiveDate,
    pub hour: Option<u32>,
    pub dimension: Option<(Dimension, String)>,
    pub existing: MetricVector,
    pub computed: MetricVector,
}

pub struct RebuildOutcome {
    pub buckets_written: usize,
    pub diff: Vec<BucketDiff>,
}

type SiteDate = (String, NaiveDate);
type SiteDateHour = (String, NaiveDate, u32);
type SiteDateDim = (String, NaiveDate, Dimension, String);
type SiteDateHourDim = (String, NaiveDate, u32, Dimension, String);

#[derive(Debug, Clone, Default)]
struct Accumulator {
    hourly: HashMap<SiteDateHour, MetricVector>,
    daily: HashMap<SiteDate, MetricVector>,
    dim_hourly: HashMap<SiteDateHourDim, MetricVector>,
    dim_daily: HashMap<SiteDateDim, MetricVector>,
}

impl Accumulator {
    fn add_metrics(&mut self, site_id: &str, delta: &MetricsDelta) {
        *self
            .hourly
            .entry((site_id.to_string(), delta.bucket.date, delta.bucket.hour))
            .or_default() += delta.metrics;
        *self
            .daily
            .entry((site_id.to_string(), delta.bucket.date))
            .or_default() += delta.metrics;
    }

    fn add_dimension(&mut self, site_id: &str, delta: &DimensionDelta) {
        *self
            .dim_hourly
            .entry((
                site_id.to_string(),
                delta.bucket.date,
                delta.bucket.hour,
                delta.dimension,
                delta.value.clone(),
            ))
            .or_default() += delta.metrics;
        *self
            .dim_daily
            .entry((site_id.to_string(), delta.bucket.date, delta.dimension, delta.value.clone()))
            .or_default() += delta.metrics;
    }
}

impl DuckDbBackend {
    /// Replays raw events over `[req.from_ms, req.to_ms)`, snapped to UTC day
    /// boundaries.
    pub async fn rebuild(&self, req: &RebuildRequest) -> Result<RebuildOutcome, RebuildError> {
        let from = day_start(req.from_ms);
        let to = day_start(req.to_ms);
        if to <= from {
            return Err(RebuildError::InvalidRange);
        }

        let conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let events = stream_events(&tx, req.site_id.as_deref(), from, to)?;

        let mut sessions: HashMap<(String, String, String), Session> = HashMap::new();
        let mut visitor_daily: HashSet<(String, NaiveDate, String)> = HashSet::new();
        let mut acc = Accumulator::default();
        for event in &events {
            replay_event(&mut sessions, &mut visitor_daily, &mut acc, event);
        }

        let diff = if req.include_diff {
            compute_diff(&tx, &acc)?
        } else {
            Vec::new()
        };

        let buckets_written = if req.dry_run {
            0
        } else {
            write_rollups(&tx, req.site_id.as_deref(), from, to, &acc)?
        };

        tx.commit()?;
        Ok(RebuildOutcome { buckets_written, diff })
    }
}

fn day_start(ts_ms: i64) -> DateTime<Utc> {
    let dt = DateTime::<Utc>::from_timestamp_millis(ts_ms).unwrap_or_else(Utc::now);
    dt.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc()
}

fn stream_events(
    tx: &Transaction<'_>,
    site_id: Option<&str>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<RawEvent>> {
    let from_s = from.to_rfc3339();
    let to_s = to.to_rfc3339();
    let cols = "id, site_id, event_id, event_type, name, visitor_id, session_id, \
                timestamp_ms, metadata_json, normalized_json, created_at";
    let mut out = Vec::new();

    if let Some(site) = site_id {
        let sql = format!(
            "SELECT {cols} FROM raw_events \
             WHERE site_id = ?1 AND created_at >= ?2 AND created_at < ?3 \
             ORDER BY created_at, id"
        );
        let mut stmt = tx.prepare(&sql)?;
        let mut rows = stmt.query(params![site, from_s, to_s])?;
        while let Some(row) = rows.next()? {
            out.push(crate::event_store::row_to_event(row)?);
        }
    } else {
        let sql = format!(
            "SELECT {cols} FROM raw_events \
             WHERE created_at >= ?1 AND created_at < ?2 \
             ORDER BY created_at, id"
        );
        let mut stmt = tx.prepare(&sql)?;
        let mut rows = stmt.query(params![from_s, to_s])?;
        while let Some(row) = rows.next()? {
            out.push(crate::event_store::row_to_event(row)?);
        }
    }
    Ok(out)
}

/// Folds one raw event into the in-memory replay state. Bot events are
/// filtered the same way the live path filters them: zero rollup deltas.
fn replay_event(
    sessions: &mut HashMap<(String, String, String), Session>,
    visitor_daily: &mut HashSet<(String, NaiveDate, String)>,
    acc: &mut Accumulator,
    event: &RawEvent,
) {
    if event.normalized.bot {
        return;
    }
    let site_id = event.site_id.clone();

    if matches!(event.event_type, EventType::Pageview) {
        let date = Bucket::from_timestamp_ms(event.timestamp_ms).date;
        if visitor_daily.insert((site_id.clone(), date, event.visitor_id.clone())) {
            acc.add_metrics(&site_id, &core_rollup::visitor_delta(event.timestamp_ms));
        }
    }

    match event.event_type {
        EventType::Pageview => {
            if let Some(session_id) = &event.session_id {
                let key = (site_id.clone(), session_id.clone(), event.visitor_id.clone());
                let ctx = SessionContext::from(&event.normalized);
                let outcome = apply_pageview(sessions.get(&key), event.timestamp_ms, &ctx);
                for delta in &outcome.metrics_deltas {
                    acc.add_metrics(&site_id, delta);
                }
                for delta in &outcome.context_deltas {
                    acc.add_dimension(&site_id, delta);
                }
                sessions.insert(key, outcome.session);
            }
            let (metrics, dims) = core_rollup::pageview_deltas(&event.normalized, event.timestamp_ms);
            acc.add_metrics(&site_id, &metrics);
            for dim in &dims {
                acc.add_dimension(&site_id, dim);
            }
        }
        EventType::Goal => {
            let name = event.name.as_deref().unwrap_or("unknown");
            let (metrics, dim) = core_rollup::goal_deltas(name, event.timestamp_ms);
            acc.add_metrics(&site_id, &metrics);
            acc.add_dimension(&site_id, &dim);
        }
        EventType::Payment => {
            // The webhook processor stamps amount/currency/event-type into
            // the payment raw event's own metadata precisely so replay never
            // needs to join the `payments` table to recover revenue deltas.
            if let (Some(amount), Some(type_raw)) = (
                event.metadata.get("amount_minor").and_then(|v| v.as_i64()),
                event.metadata.get("payment_event_type").and_then(|v| v.as_str()),
            ) {
                let payment_type = match type_raw {
                    "renewal" => PaymentEventType::Renewal,
                    "refund" => PaymentEventType::Refund,
                    _ => PaymentEventType::New,
                };
                let metrics = core_rollup::payment_deltas(amount, payment_type, event.timestamp_ms);
                acc.add_metrics(&site_id, &metrics);
            }
        }
        EventType::Heartbeat | EventType::Identify => {}
    }
}

fn compute_diff(tx: &Transaction<'_>, acc: &Accumulator) -> Result<Vec<BucketDiff>> {
    let mut diffs = Vec::new();

    for ((site, date, hour), computed) in &acc.hourly {
        let existing = fetch_metrics(tx, "rollup_hourly", site, *date, Some(*hour))?;
        if existing != *computed {
            diffs.push(BucketDiff {
                site_id: site.clone(),
                date: *date,
                hour: Some(*hour),
                dimension: None,
                existing,
                computed: *computed,
            });
        }
    }
    for ((site, date), computed) in &acc.daily {
        let existing = fetch_metrics(tx, "rollup_daily", site, *date, None)?;
        if existing != *computed {
            diffs.push(BucketDiff {
                site_id: site.clone(),
                date: *date,
                hour: None,
                dimension: None,
                existing,
                computed: *computed,
            });
        }
    }
    for ((site, date, hour, dim, value), computed) in &acc.dim_hourly {
        let existing = fetch_dimension_metrics(tx, "rollup_dimension_hourly", site, *date, Some(*hour), *dim, value)?;
        if existing != *computed {
            diffs.push(BucketDiff {
                site_id: site.clone(),
                date: *date,
                hour: Some(*hour),
                dimension: Some((*dim, value.clone())),
                existing,
                computed: *computed,
            });
        }
    }
    for ((site, date, dim, value), computed) in &acc.dim_daily {
        let existing = fetch_dimension_metrics(tx, "rollup_dimension_daily", site, *date, None, *dim, value)?;
        if existing != *computed {
            diffs.push(BucketDiff {
                site_id: site.clone(),
                date: *date,
                hour: None,
                dimension: Some((*dim, value.clone())),
                existing,
                computed: *computed,
            });
        }
    }

    Ok(diffs)
}

fn fetch_metrics(
    tx: &Transaction<'_>,
    table: &str,
    site_id: &str,
    date: NaiveDate,
    hour: Option<u32>,
) -> Result<MetricVector> {
    let cols = rollup_store::METRIC_COLUMNS;
    let sql = match hour {
        Some(_) => format!("SELECT {cols} FROM {table} WHERE site_id = ?1 AND date = ?2 AND hour = ?3"),
        None => format!("SELECT {cols} FROM {table} WHERE site_id = ?1 AND date = ?2"),
    };
    let mut stmt = tx.prepare(&sql)?;
    let mut rows = match hour {
        Some(h) => stmt.query(params![site_id, date.to_string(), h])?,
        None => stmt.query(params![site_id, date.to_string()])?,
    };
    match rows.next()? {
        Some(row) => rollup_store::metric_vector_from_row(row, 0),
        None => Ok(MetricVector::default()),
    }
}

fn fetch_dimension_metrics(
    tx: &Transaction<'_>,
    table: &str,
    site_id: &str,
    date: NaiveDate,
    hour: Option<u32>,
    dimension: Dimension,
    value: &str,
) -> Result<MetricVector> {
    let cols = rollup_store::METRIC_COLUMNS;
    let sql = match hour {
        Some(_) => format!(
            "SELECT {cols} FROM {table} WHERE site_id = ?1 AND date = ?2 AND hour = ?3 AND dimension = ?4 AND value = ?5"
        ),
        None => format!("SELECT {cols} FROM {table} WHERE site_id = ?1 AND date = ?2 AND dimension = ?3 AND value = ?4"),
    };
    let mut stmt = tx.prepare(&sql)?;
    let mut rows = match hour {
        Some(h) => stmt.query(params![site_id, date.to_string(), h, dimension.as_str(), value])?,
        None => stmt.query(params![site_id, date.to_string(), dimension.as_str(), value])?,
    };
    match rows.next()? {
        Some(row) => rollup_store::metric_vector_from_row(row, 0),
        None => Ok(MetricVector::default()),
    }
}

/// Deletes every rollup row in `[from, to)` for the scoped site(s), then
/// re-applies the accumulated deltas through the same upsert helpers the
/// live path uses — the `rollup_daily`/`rollup_dimension_daily` totals fall
/// out for free since `apply_metrics`/`apply_dimension` accumulate them
/// additively across every hourly call for that date.
fn write_rollups(
    tx: &Transaction<'_>,
    site_id: Option<&str>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    acc: &Accumulator,
) -> Result<usize> {
    let from_date = from.date_naive().to_string();
    let to_date = to.date_naive().to_string();

    for table in [
        "rollup_hourly",
        "rollup_daily",
        "rollup_dimension_hourly",
        "rollup_dimension_daily",
    ] {
        match site_id {
            Some(s) => {
                tx.execute(
                    &format!("DELETE FROM {table} WHERE site_id = ?1 AND date >= ?2 AND date < ?3"),
                    params![s, from_date, to_date],
                )?;
            }
            None => {
                tx.execute(
                    &format!("DELETE FROM {table} WHERE date >= ?1 AND date < ?2"),
                    params![from_date, to_date],
                )?;
            }
        }
    }

    let mut written = 0usize;
    let hourly_entries: Vec<_> = acc.hourly.iter().collect();
    for chunk in hourly_entries.chunks(500) {
        for ((site, date, hour), metrics) in chunk {
            let delta = MetricsDelta {
                bucket: Bucket { date: *date, hour: *hour },
                metrics: **metrics,
            };
            rollup_store::apply_metrics(tx, site, &delta)?;
            written += 1;
        }
    }

    let dim_entries: Vec<_> = acc.dim_hourly.iter().collect();
    for chunk in dim_entries.chunks(500) {
        for ((site, date, hour, dim, value), metrics) in chunk {
            let delta = DimensionDelta::new(
                Bucket { date: *date, hour: *hour },
                *dim,
                value.clone(),
                **metrics,
            );
            rollup_store::apply_dimension(tx, site, &delta)?;
            written += 1;
        }
    }

    Ok(written)
}
