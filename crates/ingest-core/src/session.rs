//! Session state machine. Pure in-memory logic shared by
//! the live ingest path (`ingest-duckdb`, operating on a row-locked session)
//! and the rebuilder (replaying over an in-memory map) so the two are
//! guaranteed to agree by construction rather than by re-implementation.

use crate::model::{
    dimension_fallback, Bucket, Dimension, DimensionDelta, MetricVector, Session, SessionContext,
};

/// Outcome of folding one pageview into a session's state.
pub struct PageviewOutcome {
    pub session: Session,
    pub is_new_session: bool,
    /// Overall-rollup deltas (`sessions`, `bouncedSessions`, `avgSessionDurationMs`).
    pub metrics_deltas: Vec<crate::model::MetricsDelta>,
    /// Per-(dimension, value) mirrors of `metrics_deltas`, one set per
    /// session-context field (`device`, `browser`, `country`, `region`, `city`).
    pub context_deltas: Vec<DimensionDelta>,
}

fn session_context_dimensions(ctx: &SessionContext) -> Vec<(Dimension, String)> {
    vec![
        (
            Dimension::Device,
            dimension_fallback(Dimension::Device, Some(&ctx.device)),
        ),
        (
            Dimension::Browser,
            dimension_fallback(Dimension::Browser, Some(&ctx.browser)),
        ),
        (
            Dimension::Country,
            dimension_fallback(Dimension::Country, ctx.country.as_deref()),
        ),
        (
            Dimension::Region,
            dimension_fallback(Dimension::Region, ctx.region.as_deref()),
        ),
        (
            Dimension::City,
            dimension_fallback(Dimension::City, ctx.city.as_deref()),
        ),
    ]
}

fn mirror(bucket: Bucket, ctx: &SessionContext, metrics: MetricVector) -> Vec<DimensionDelta> {
    session_context_dimensions(ctx)
        .into_iter()
        .map(|(dim, value)| DimensionDelta::new(bucket, dim, value, metrics))
        .collect()
}

/// Folds one pageview timestamp+context into the session row that was (or
/// was not) found for `(siteId, sessionId, visitorId)`. `existing` is `None`
/// exactly when the caller's conflict-do-nothing insert created a fresh row.
pub fn apply_pageview(
    existing: Option<&Session>,
    event_timestamp_ms: i64,
    ctx: &SessionContext,
) -> PageviewOutcome {
    match existing {
        None => {
            let bucket = Bucket::from_timestamp_ms(event_timestamp_ms);
            let metrics = MetricVector {
                sessions: 1,
                bounced_sessions: 1,
                ..Default::default()
            };
            let session = Session {
                first_timestamp_ms: event_timestamp_ms,
                last_timestamp_ms: event_timestamp_ms,
                pageviews: 1,
                first_context: ctx.clone(),
            };
            PageviewOutcome {
                metrics_deltas: vec![crate::model::MetricsDelta { bucket, metrics }],
                context_deltas: mirror(bucket, ctx, metrics),
                session,
                is_new_session: true,
            }
        }
        Some(prev) => fold_existing(prev, event_timestamp_ms, ctx),
    }
}

fn fold_existing(
    prev: &Session,
    event_timestamp_ms: i64,
    ctx: &SessionContext,
) -> PageviewOutcome {
    let next_first = prev.first_timestamp_ms.min(event_timestamp_ms);
    let next_last = prev.last_timestamp_ms.max(event_timestamp_ms);
    let next_pageviews = prev.pageviews + 1;
    let event_is_new_first = event_timestamp_ms < prev.first_timestamp_ms;
    let next_context = if event_is_new_first {
        ctx.clone()
    } else {
        prev.first_context.clone()
    };

    let prev_bucket = Bucket::from_timestamp_ms(prev.first_timestamp_ms);
    let next_bucket = Bucket::from_timestamp_ms(next_first);

    let mut metrics_deltas = Vec::new();
    let mut context_deltas = Vec::new();

    if prev_bucket != next_bucket {
        let prev_duration = prev.last_timestamp_ms - prev.first_timestamp_ms;
        let next_duration = next_last - next_first;

        let mut prev_metrics = MetricVector {
            sessions: -1,
            ..Default::default()
        };
        if prev.pageviews == 1 {
            prev_metrics.bounced_sessions = -1;
        }
        if prev_duration > 0 {
            prev_metrics.avg_session_duration_ms = -prev_duration;
        }
        metrics_deltas.push(crate::model::MetricsDelta {
            bucket: prev_bucket,
            metrics: prev_metrics,
        });
        context_deltas.extend(mirror(prev_bucket, &prev.first_context, prev_metrics));

        let mut next_metrics = MetricVector {
            sessions: 1,
            ..Default::default()
        };
        if next_pageviews == 1 {
            next_metrics.bounced_sessions = 1;
        }
        if next_duration > 0 {
            next_metrics.avg_session_duration_ms = next_duration;
        }
        metrics_deltas.push(crate::model::MetricsDelta {
            bucket: next_bucket,
            metrics: next_metrics,
        });
        context_deltas.extend(mirror(next_bucket, &next_context, next_metrics));
    } else {
        let prev_duration = prev.last_timestamp_ms - prev.first_timestamp_ms;
        let next_duration = next_last - next_first;
        let mut metrics = MetricVector::default();
        if prev.pageviews == 1 {
            metrics.bounced_sessions = -1;
        }
        metrics.avg_session_duration_ms = next_duration - prev_duration;
        if metrics.bounced_sessions != 0 || metrics.avg_session_duration_ms != 0 {
            metrics_deltas.push(crate::model::MetricsDelta {
                bucket: next_bucket,
                metrics,
            });
            context_deltas.extend(mirror(next_bucket, &prev.first_context, metrics));
        }

        if next_context != prev.first_context {
            let remove = MetricVector {
                sessions: -1,
                ..Default::default()
            };
            let add = MetricVector {
                sessions: 1,
                ..Default::default()
            };
            context_deltas.extend(mirror(next_bucket, &prev.first_context, remove));
            context_deltas.extend(mirror(next_bucket, &next_context, add));
        }
    }

    let session = Session {
        first_timestamp_ms: next_first,
        last_timestamp_ms: next_last,
        pageviews: next_pageviews,
        first_context: next_context,
    };

    PageviewOutcome {
        session,
        is_new_session: false,
        metrics_deltas,
        context_deltas,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(device: &str, country: Option<&str>) -> SessionContext {
        SessionContext {
            country: country.map(str::to_string),
            region: None,
            city: None,
            device: device.to_string(),
            browser: "chrome".to_string(),
        }
    }

    #[test]
    fn s1_single_pageview_creates_session() {
        let ts = 1_735_732_800_000; // 2025-01-01T10:00:00Z
        let outcome = apply_pageview(None, ts, &ctx("desktop", Some("US")));
        assert!(outcome.is_new_session);
        assert_eq!(outcome.session.pageviews, 1);
        assert_eq!(outcome.metrics_deltas.len(), 1);
        assert_eq!(outcome.metrics_deltas[0].metrics.sessions, 1);
        assert_eq!(outcome.metrics_deltas[0].metrics.bounced_sessions, 1);
        assert_eq!(outcome.context_deltas.len(), 5);
        assert!(outcome
            .context_deltas
            .iter()
            .any(|d| d.dimension == Dimension::Device && d.value == "desktop"));
        assert!(outcome
            .context_deltas
            .iter()
            .any(|d| d.dimension == Dimension::Country && d.value == "US"));
    }

    #[test]
    fn s2_second_pageview_same_hour_extends_duration() {
        let first_ts = 1_735_732_800_000; // 10:00:00
        let created = apply_pageview(None, first_ts, &ctx("desktop", Some("US"))).session;
        let second_ts = first_ts + 600_000; // +10 min
        let outcome = apply_pageview(Some(&created), second_ts, &ctx("desktop", Some("US")));
        assert_eq!(outcome.session.pageviews, 2);
        assert_eq!(outcome.session.first_timestamp_ms, first_ts);
        assert_eq!(outcome.session.last_timestamp_ms, second_ts);
        assert_eq!(outcome.metrics_deltas.len(), 1);
        assert_eq!(outcome.metrics_deltas[0].metrics.bounced_sessions, -1);
        assert_eq!(outcome.metrics_deltas[0].metrics.avg_session_duration_ms, 600_000);
        assert_eq!(outcome.metrics_deltas[0].metrics.sessions, 0);
    }

    #[test]
    fn s3_out_of_order_earlier_pageview_migrates_bucket() {
        let first_ts = 1_735_732_800_000; // 2025-01-01T10:00:00Z
        let second_ts = first_ts + 600_000; // 10:10:00
        let after_second = apply_pageview(None, first_ts, &ctx("desktop", Some("US"))).session;
        let after_second = apply_pageview(Some(&after_second), second_ts, &ctx("desktop", Some("US"))).session;

        let earlier_ts = 1_735_687_800_000; // 2024-12-31T23:30:00Z
        let outcome = apply_pageview(Some(&after_second), earlier_ts, &ctx("desktop", Some("US")));

        assert_eq!(outcome.session.first_timestamp_ms, earlier_ts);
        assert_eq!(outcome.session.last_timestamp_ms, second_ts);
        assert_eq!(outcome.session.pageviews, 3);
        assert_eq!(outcome.metrics_deltas.len(), 2);

        let prev_bucket = Bucket::from_timestamp_ms(first_ts);
        let next_bucket = Bucket::from_timestamp_ms(earlier_ts);
        assert_ne!(prev_bucket, next_bucket);

        let removed = outcome
            .metrics_deltas
            .iter()
            .find(|d| d.bucket == prev_bucket)
            .unwrap();
        assert_eq!(removed.metrics.sessions, -1);
        assert_eq!(removed.metrics.bounced_sessions, 0);
        assert_eq!(removed.metrics.avg_session_duration_ms, -600_000);

        let added = outcome
            .metrics_deltas
            .iter()
            .find(|d| d.bucket == next_bucket)
            .unwrap();
        assert_eq!(added.metrics.sessions, 1);
        assert_eq!(added.metrics.bounced_sessions, 0);
        assert_eq!(added.metrics.avg_session_duration_ms, second_ts - earlier_ts);
    }

    #[test]
    fn earlier_event_within_same_bucket_swaps_context_dimensions() {
        let later_ts = 1_735_732_800_000 + 40 * 60 * 1000; // 10:40:00
        let created = apply_pageview(None, later_ts, &ctx("desktop", Some("US"))).session;
        let earlier_ts = 1_735_732_800_000 + 10 * 60 * 1000; // 10:10:00, same UTC hour
        let outcome = apply_pageview(Some(&created), earlier_ts, &ctx("mobile", Some("CA")));

        assert_eq!(
            Bucket::from_timestamp_ms(later_ts),
            Bucket::from_timestamp_ms(earlier_ts)
        );
        assert_eq!(outcome.session.first_context.device, "mobile");
        assert!(outcome
            .context_deltas
            .iter()
            .any(|d| d.dimension == Dimension::Device && d.value == "desktop" && d.metrics.sessions == -1));
        assert!(outcome
            .context_deltas
            .iter()
            .any(|d| d.dimension == Dimension::Device && d.value == "mobile" && d.metrics.sessions == 1));
    }
}
