use std::net::IpAddr;

use anyhow::Result;
use ingest_core::config::Config;
use ingest_core::model::{Bucket, EventType, RawEvent, SessionContext, Site};
use ingest_core::normalizer::{self, GeoResolver};
use ingest_core::rollup as core_rollup;
use ingest_core::validator::{self, Rejected, RequestHeaders};
use ingest_core::visitor::derive_visitor_id;

use crate::backend::DuckDbBackend;
use crate::{event_store, rollup_store, session_store};

/// Error surface for the live ingest path. `Rejected` carries a
/// validation/normalization rejection reason the server crate maps to a
/// 4xx; anything else is a 500.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Rejected(#[from] Rejected),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<duckdb::Error> for IngestError {
    fn from(e: duckdb::Error) -> Self {
        Self::Internal(e.into())
    }
}

pub struct IngestOutcome {
    pub deduped: bool,
    pub used_client_timestamp: bool,
    pub clock_skew_ms: i64,
}

impl DuckDbBackend {
    /// Validates and normalizes, then commits `insert_event →
    /// update_session → apply_rollups` as a single transaction for a single
    /// ingest request: all commit or all roll back together.
    #[allow(clippy::too_many_arguments)]
    pub async fn ingest(
        &self,
        config: &Config,
        site: &Site,
        body: &[u8],
        headers: &RequestHeaders<'_>,
        client_ip: Option<IpAddr>,
        user_agent: Option<&str>,
        now_ms: i64,
    ) -> Result<IngestOutcome, IngestError> {
        let accepted = validator::validate(body, headers, config, &site.domain, now_ms)?;

        let geo = GeoResolver::global(&config.geoip_path);
        let normalized = normalizer::normalize(
            &accepted,
            user_agent,
            client_ip,
            geo,
            config.max_client_ts_skew_ms,
            now_ms,
        );

        let visitor_id = match &accepted.visitor_id {
            Some(v) => v.clone(),
            None => {
                let salt = self.daily_salt().await?;
                derive_visitor_id(
                    &salt,
                    &site.id,
                    &client_ip.map(|ip| ip.to_string()).unwrap_or_default(),
                    user_agent.unwrap_or(""),
                )
            }
        };

        let clock_skew_ms = normalized.timestamp_ms - now_ms;
        let event = RawEvent {
            id: uuid::Uuid::new_v4().to_string(),
            site_id: site.id.clone(),
            event_id: accepted.event_id.clone(),
            event_type: accepted.event_type,
            name: accepted.name.clone(),
            visitor_id,
            session_id: accepted.session_id.clone(),
            timestamp_ms: normalized.timestamp_ms,
            metadata: accepted.metadata.clone(),
            normalized: normalized.context.clone(),
            created_at: chrono::Utc::now(),
        };

        let conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let deduped = event_store::insert_event(&tx, &event)?;
        if deduped {
            tx.commit()?;
            return Ok(IngestOutcome {
                deduped: true,
                used_client_timestamp: normalized.used_client_timestamp,
                clock_skew_ms,
            });
        }

        if !event.normalized.bot {
            apply_rollup_effects(&tx, &event)?;
        }

        tx.commit()?;
        Ok(IngestOutcome {
            deduped: false,
            used_client_timestamp: normalized.used_client_timestamp,
            clock_skew_ms,
        })
    }
}

/// Folds one already-persisted, non-bot event into the session/rollup
/// state. Bot events are filtered out by the caller — they must contribute
/// zero rollup deltas.
pub(crate) fn apply_rollup_effects(tx: &duckdb::Transaction<'_>, event: &RawEvent) -> Result<()> {
    let site_id = &event.site_id;

    if matches!(event.event_type, EventType::Pageview) {
        let date = Bucket::from_timestamp_ms(event.timestamp_ms).date;
        if rollup_store::claim_visitor_daily(tx, site_id, date, &event.visitor_id)? {
            rollup_store::apply_metrics(
                tx,
                site_id,
                &core_rollup::visitor_delta(event.timestamp_ms),
            )?;
        }
    }

    match event.event_type {
        EventType::Pageview => {
            if let Some(session_id) = &event.session_id {
                let ctx = SessionContext::from(&event.normalized);
                let outcome = session_store::fold_pageview(
                    tx,
                    site_id,
                    session_id,
                    &event.visitor_id,
                    event.timestamp_ms,
                    &ctx,
                )?;
                for delta in &outcome.metrics_deltas {
                    rollup_store::apply_metrics(tx, site_id, delta)?;
                }
                for delta in &outcome.context_deltas {
                    rollup_store::apply_dimension(tx, site_id, delta)?;
                }
            }
            let (metrics, dims) = core_rollup::pageview_deltas(&event.normalized, event.timestamp_ms);
            rollup_store::apply_metrics(tx, site_id, &metrics)?;
            for d in &dims {
                rollup_store::apply_dimension(tx, site_id, d)?;
            }
        }
        EventType::Goal => {
            let name = event.name.as_deref().unwrap_or("unknown");
            let (metrics, dim) = core_rollup::goal_deltas(name, event.timestamp_ms);
            rollup_store::apply_metrics(tx, site_id, &metrics)?;
            rollup_store::apply_dimension(tx, site_id, &dim)?;
        }
        EventType::Heartbeat | EventType::Identify | EventType::Payment => {
            // Raw event only. Heartbeats keep the client's local session
            // timer alive without mutating the stored session row;
            // identify/payment submitted through the public ingest
            // endpoint carry no metric-bearing fields (payments with
            // amounts arrive exclusively through the webhook path).
        }
    }
    Ok(())
}
