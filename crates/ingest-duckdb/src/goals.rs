use anyhow::Result;
use ingest_core::model::{EventType, NormalizedContext, RawEvent, Site};
use ingest_core::rollup as core_rollup;

use crate::backend::DuckDbBackend;
use crate::event_store;

pub struct GoalRequest {
    pub visitor_id: String,
    pub name: String,
    pub metadata: ingest_core::model::Metadata,
    pub idempotency_key: Option<String>,
}

pub struct GoalOutcome {
    pub deduped: bool,
}

/// `POST /api/v1/goals`: requires a prior pageview from the same
/// visitor (409 otherwise), dedupes via `x-idempotency-key`.
impl DuckDbBackend {
    pub async fn record_goal(
        &self,
        site: &Site,
        req: &GoalRequest,
        now_ms: i64,
    ) -> Result<GoalOutcome, GoalError> {
        let conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let Some(latest) = event_store::find_latest_pageview(&tx, &site.id, &req.visitor_id)?
        else {
            return Err(GoalError::NoPriorPageview);
        };

        let event = RawEvent {
            id: uuid::Uuid::new_v4().to_string(),
            site_id: site.id.clone(),
            event_id: req.idempotency_key.clone(),
            event_type: EventType::Goal,
            name: Some(req.name.clone()),
            visitor_id: req.visitor_id.clone(),
            session_id: latest.session_id.clone(),
            timestamp_ms: now_ms,
            metadata: req.metadata.clone(),
            normalized: NormalizedContext {
                bot: latest.normalized.bot,
                ..latest.normalized.clone()
            },
            created_at: chrono::Utc::now(),
        };

        let deduped = event_store::insert_event(&tx, &event)?;
        if !deduped && !event.normalized.bot {
            let (metrics, dim) = core_rollup::goal_deltas(&req.name, now_ms);
            crate::rollup_store::apply_metrics(&tx, &site.id, &metrics)?;
            crate::rollup_store::apply_dimension(&tx, &site.id, &dim)?;
        }

        tx.commit()?;
        Ok(GoalOutcome { deduped })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GoalError {
    #[error("no prior pageview for this visitor")]
    NoPriorPageview,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<duckdb::Error> for GoalError {
    fn from(e: duckdb::Error) -> Self {
        Self::Internal(e.into())
    }
}
