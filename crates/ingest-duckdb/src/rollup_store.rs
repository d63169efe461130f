use anyhow::Result;
use duckdb::{params, Row, Transaction};
use ingest_core::model::{Dimension, DimensionDelta, MetricVector, MetricsDelta};

pub(crate) const METRIC_COLUMNS: &str = "visitors, sessions, bounced_sessions, avg_session_duration_ms, \
     pageviews, goals, revenue, revenue_new, revenue_renewal, revenue_refund";

/// Reads the 10 metric columns starting at `offset` into a [`MetricVector`].
/// Shared by the live rollup reads (none currently) and the rebuilder's
/// existing-vs-computed diff.
pub(crate) fn metric_vector_from_row(row: &Row<'_>, offset: usize) -> Result<MetricVector> {
    Ok(MetricVector {
        visitors: row.get(offset)?,
        sessions: row.get(offset + 1)?,
        bounced_sessions: row.get(offset + 2)?,
        avg_session_duration_ms: row.get(offset + 3)?,
        pageviews: row.get(offset + 4)?,
        goals: row.get(offset + 5)?,
        revenue: row.get(offset + 6)?,
        revenue_new: row.get(offset + 7)?,
        revenue_renewal: row.get(offset + 8)?,
        revenue_refund: row.get(offset + 9)?,
    })
}

fn metric_values(m: &MetricVector) -> [i64; 10] {
    [
        m.visitors,
        m.sessions,
        m.bounced_sessions,
        m.avg_session_duration_ms,
        m.pageviews,
        m.goals,
        m.revenue,
        m.revenue_new,
        m.revenue_renewal,
        m.revenue_refund,
    ]
}

/// Applies one `MetricsDelta` to `rollup_hourly` and `rollup_daily` for
/// `site_id`, additively.
pub fn apply_metrics(tx: &Transaction<'_>, site_id: &str, delta: &MetricsDelta) -> Result<()> {
    let values = metric_values(&delta.metrics);
    let date = delta.bucket.date.to_string();

    tx.execute(
        &format!(
            "INSERT INTO rollup_hourly (site_id, date, hour, {METRIC_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT (site_id, date, hour) DO UPDATE SET
                visitors = rollup_hourly.visitors + excluded.visitors,
                sessions = rollup_hourly.sessions + excluded.sessions,
                bounced_sessions = rollup_hourly.bounced_sessions + excluded.bounced_sessions,
                avg_session_duration_ms = rollup_hourly.avg_session_duration_ms + excluded.avg_session_duration_ms,
                pageviews = rollup_hourly.pageviews + excluded.pageviews,
                goals = rollup_hourly.goals + excluded.goals,
                revenue = rollup_hourly.revenue + excluded.revenue,
                revenue_new = rollup_hourly.revenue_new + excluded.revenue_new,
                revenue_renewal = rollup_hourly.revenue_renewal + excluded.revenue_renewal,
                revenue_refund = rollup_hourly.revenue_refund + excluded.revenue_refund"
        ),
        params![
            site_id,
            date,
            delta.bucket.hour,
            values[0],
            values[1],
            values[2],
            values[3],
            values[4],
            values[5],
            values[6],
            values[7],
            values[8],
            values[9],
        ],
    )?;

    tx.execute(
        &format!(
            "INSERT INTO rollup_daily (site_id, date, {METRIC_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT (site_id, date) DO UPDATE SET
                visitors = rollup_daily.visitors + excluded.visitors,
                sessions = rollup_daily.sessions + excluded.sessions,
                bounced_sessions = rollup_daily.bounced_sessions + excluded.bounced_sessions,
                avg_session_duration_ms = rollup_daily.avg_session_duration_ms + excluded.avg_session_duration_ms,
                pageviews = rollup_daily.pageviews + excluded.pageviews,
                goals = rollup_daily.goals + excluded.goals,
                revenue = rollup_daily.revenue + excluded.revenue,
                revenue_new = rollup_daily.revenue_new + excluded.revenue_new,
                revenue_renewal = rollup_daily.revenue_renewal + excluded.revenue_renewal,
                revenue_refund = rollup_daily.revenue_refund + excluded.revenue_refund"
        ),
        params![
            site_id, date, values[0], values[1], values[2], values[3], values[4], values[5],
            values[6], values[7], values[8], values[9],
        ],
    )?;

    Ok(())
}

/// Applies one `DimensionDelta` to `rollup_dimension_hourly` and
/// `rollup_dimension_daily`.
pub fn apply_dimension(tx: &Transaction<'_>, site_id: &str, delta: &DimensionDelta) -> Result<()> {
    let values = metric_values(&delta.metrics);
    let date = delta.bucket.date.to_string();
    let dimension = delta.dimension.as_str();

    tx.execute(
        &format!(
            "INSERT INTO rollup_dimension_hourly (site_id, date, hour, dimension, value, {METRIC_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT (site_id, date, hour, dimension, value) DO UPDATE SET
                visitors = rollup_dimension_hourly.visitors + excluded.visitors,
                sessions = rollup_dimension_hourly.sessions + excluded.sessions,
                bounced_sessions = rollup_dimension_hourly.bounced_sessions + excluded.bounced_sessions,
                avg_session_duration_ms = rollup_dimension_hourly.avg_session_duration_ms + excluded.avg_session_duration_ms,
                pageviews = rollup_dimension_hourly.pageviews + excluded.pageviews,
                goals = rollup_dimension_hourly.goals + excluded.goals,
                revenue = rollup_dimension_hourly.revenue + excluded.revenue,
                revenue_new = rollup_dimension_hourly.revenue_new + excluded.revenue_new,
                revenue_renewal = rollup_dimension_hourly.revenue_renewal + excluded.revenue_renewal,
                revenue_refund = rollup_dimension_hourly.revenue_refund + excluded.revenue_refund"
        ),
        params![
            site_id, date, delta.bucket.hour, dimension, delta.value,
            values[0], values[1], values[2], values[3], values[4], values[5],
            values[6], values[7], values[8], values[9],
        ],
    )?;

    tx.execute(
        &format!(
            "INSERT INTO rollup_dimension_daily (site_id, date, dimension, value, {METRIC_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT (site_id, date, dimension, value) DO UPDATE SET
                visitors = rollup_dimension_daily.visitors + excluded.visitors,
                sessions = rollup_dimension_daily.sessions + excluded.sessions,
                bounced_sessions = rollup_dimension_daily.bounced_sessions + excluded.bounced_sessions,
                avg_session_duration_ms = rollup_dimension_daily.avg_session_duration_ms + excluded.avg_session_duration_ms,
                pageviews = rollup_dimension_daily.pageviews + excluded.pageviews,
                goals = rollup_dimension_daily.goals + excluded.goals,
                revenue = rollup_dimension_daily.revenue + excluded.revenue,
                revenue_new = rollup_dimension_daily.revenue_new + excluded.revenue_new,
                revenue_renewal = rollup_dimension_daily.revenue_renewal + excluded.revenue_renewal,
                revenue_refund = rollup_dimension_daily.revenue_refund + excluded.revenue_refund"
        ),
        params![
            site_id, date, dimension, delta.value,
            values[0], values[1], values[2], values[3], values[4], values[5],
            values[6], values[7], values[8], values[9],
        ],
    )?;

    Ok(())
}

/// Attempts to claim `(site_id, date, visitor_id)`. Returns `true` if this
/// call inserted the row (i.e. the visitor had not been seen on this date
/// before), gating the caller's `visitors += 1` delta.
pub fn claim_visitor_daily(
    tx: &Transaction<'_>,
    site_id: &str,
    date: chrono::NaiveDate,
    visitor_id: &str,
) -> Result<bool> {
    let changed = tx.execute(
        "INSERT INTO visitor_daily (site_id, date, visitor_id) VALUES (?1, ?2, ?3)
         ON CONFLICT (site_id, date, visitor_id) DO NOTHING",
        params![site_id, date.to_string(), visitor_id],
    )?;
    Ok(changed > 0)
}

pub fn dimension_from_str(raw: &str) -> Option<Dimension> {
    Some(match raw {
        "page" => Dimension::Page,
        "referrer_domain" => Dimension::ReferrerDomain,
        "utm_source" => Dimension::UtmSource,
        "utm_campaign" => Dimension::UtmCampaign,
        "country" => Dimension::Country,
        "region" => Dimension::Region,
        "city" => Dimension::City,
        "device" => Dimension::Device,
        "browser" => Dimension::Browser,
        "goal" => Dimension::Goal,
        _ => return None,
    })
}
