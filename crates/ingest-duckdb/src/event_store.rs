use anyhow::Result;
use duckdb::{params, Transaction};
use ingest_core::model::{EventType, NormalizedContext, RawEvent};

/// Inserts `event`. On a `(site_id, event_id)` conflict this is a no-op and
/// `Ok(true)` ("deduped") is returned — the caller must not apply any
/// further session/rollup deltas in that case.
pub fn insert_event(tx: &Transaction<'_>, event: &RawEvent) -> Result<bool> {
    let metadata_json = serde_json::to_string(&event.metadata)?;
    let normalized_json = serde_json::to_string(&event.normalized)?;

    let changed = tx.execute(
        "INSERT INTO raw_events
            (id, site_id, event_id, event_type, name, visitor_id, session_id,
             timestamp_ms, metadata_json, normalized_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT DO NOTHING",
        params![
            event.id,
            event.site_id,
            event.event_id,
            event.event_type.as_str(),
            event.name,
            event.visitor_id,
            event.session_id,
            event.timestamp_ms,
            metadata_json,
            normalized_json,
            event.created_at.to_rfc3339(),
        ],
    );

    match changed {
        Ok(n) => Ok(n == 0 && event.event_id.is_some()),
        Err(duckdb::Error::DuckDBFailure(_, Some(ref msg))) if msg.contains("constraint") => {
            // Conflict without a matching unique index expression (DuckDB
            // surfaces a constraint error rather than silently ignoring it
            // on unindexed conflicts) — already deduped.
            Ok(true)
        }
        Err(e) => Err(e.into()),
    }
}

/// Most recent `pageview` raw event for `(site_id, visitor_id)`, used for
/// goal-endpoint attribution (409 when absent) and webhook attribution
/// snapshots.
pub fn find_latest_pageview(
    tx: &Transaction<'_>,
    site_id: &str,
    visitor_id: &str,
) -> Result<Option<RawEvent>> {
    let mut stmt = tx.prepare(
        "SELECT id, site_id, event_id, event_type, name, visitor_id, session_id,
                timestamp_ms, metadata_json, normalized_json, created_at
         FROM raw_events
         WHERE site_id = ?1 AND visitor_id = ?2 AND event_type = 'pageview'
         ORDER BY created_at DESC, id DESC
         LIMIT 1",
    )?;
    let mut rows = stmt.query(params![site_id, visitor_id])?;
    if let Some(row) = rows.next()? {
        Ok(Some(row_to_event(row)?))
    } else {
        Ok(None)
    }
}

pub(crate) fn row_to_event(row: &duckdb::Row<'_>) -> Result<RawEvent> {
    let event_type_raw: String = row.get(3)?;
    let metadata_json: String = row.get(8)?;
    let normalized_json: String = row.get(9)?;
    let created_at_raw: String = row.get(10)?;
    Ok(RawEvent {
        id: row.get(0)?,
        site_id: row.get(1)?,
        event_id: row.get(2)?,
        event_type: EventType::parse(&event_type_raw).unwrap_or(EventType::Pageview),
        name: row.get(4)?,
        visitor_id: row.get(5)?,
        session_id: row.get(6)?,
        timestamp_ms: row.get(7)?,
        metadata: serde_json::from_str(&metadata_json)?,
        normalized: serde_json::from_str::<NormalizedContext>(&normalized_json)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at_raw)?.with_timezone(&chrono::Utc),
    })
}
