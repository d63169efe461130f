use anyhow::Result;
use duckdb::{params, Transaction};
use ingest_core::model::{Session, SessionContext};
use ingest_core::session::{apply_pageview, PageviewOutcome};

/// Reads the session row for `(site_id, session_id, visitor_id)` (if any),
/// folds `event_timestamp_ms` into it via the pure session state machine, and
/// writes the result back. Returns the emitted deltas for the caller to
/// apply through `rollup_store`.
///
/// Because only one write transaction is ever in flight against this
/// DuckDB connection (see `DuckDbBackend`), the read-then-write here is
/// equivalent to a `SELECT ... FOR UPDATE` row lock.
pub fn fold_pageview(
    tx: &Transaction<'_>,
    site_id: &str,
    session_id: &str,
    visitor_id: &str,
    event_timestamp_ms: i64,
    ctx: &SessionContext,
) -> Result<PageviewOutcome> {
    let existing = read_session(tx, site_id, session_id, visitor_id)?;
    let outcome = apply_pageview(existing.as_ref(), event_timestamp_ms, ctx);
    write_session(tx, site_id, session_id, visitor_id, &outcome.session)?;
    Ok(outcome)
}

fn read_session(
    tx: &Transaction<'_>,
    site_id: &str,
    session_id: &str,
    visitor_id: &str,
) -> Result<Option<Session>> {
    let mut stmt = tx.prepare(
        "SELECT first_timestamp_ms, last_timestamp_ms, pageviews, first_context_json
         FROM sessions WHERE site_id = ?1 AND session_id = ?2 AND visitor_id = ?3",
    )?;
    let mut rows = stmt.query(params![site_id, session_id, visitor_id])?;
    if let Some(row) = rows.next()? {
        let first_context_json: String = row.get(3)?;
        let first_context: SessionContext = serde_json::from_str(&first_context_json)?;
        Ok(Some(Session {
            first_timestamp_ms: row.get(0)?,
            last_timestamp_ms: row.get(1)?,
            pageviews: row.get(2)?,
            first_context,
        }))
    } else {
        Ok(None)
    }
}

fn write_session(
    tx: &Transaction<'_>,
    site_id: &str,
    session_id: &str,
    visitor_id: &str,
    session: &Session,
) -> Result<()> {
    let context_json = serde_json::to_string(&session.first_context)?;
    tx.execute(
        "INSERT INTO sessions
            (site_id, session_id, visitor_id, first_timestamp_ms, last_timestamp_ms, pageviews, first_context_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (site_id, session_id, visitor_id) DO UPDATE SET
            first_timestamp_ms = excluded.first_timestamp_ms,
            last_timestamp_ms = excluded.last_timestamp_ms,
            pageviews = excluded.pageviews,
            first_context_json = excluded.first_context_json",
        params![
            site_id,
            session_id,
            visitor_id,
            session.first_timestamp_ms,
            session.last_timestamp_ms,
            session.pageviews,
            context_json,
        ],
    )?;
    Ok(())
}
