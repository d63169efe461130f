//! Pure delta construction for the metrics the rollup engine applies that are
//! *not* part of the session state machine: per-pageview attribution dimensions
//! (`page`, `referrer_domain`, `utm_source`, `utm_campaign`), goal
//! attribution, and the visitor-dedup counter. Kept separate from
//! `session.rs` because these deltas are derived from the triggering
//! event's own context, not from the session's first-pageview snapshot.

use crate::model::{dimension_fallback, Bucket, Dimension, DimensionDelta, MetricVector, MetricsDelta, NormalizedContext};

/// `pageviews += 1` at the event's own bucket, mirrored into the
/// per-pageview attribution dimensions using the event's own normalized
/// context (as opposed to the session's first context).
pub fn pageview_deltas(ctx: &NormalizedContext, event_timestamp_ms: i64) -> (MetricsDelta, Vec<DimensionDelta>) {
    let bucket = Bucket::from_timestamp_ms(event_timestamp_ms);
    let metrics = MetricVector {
        pageviews: 1,
        ..Default::default()
    };
    let referrer_host = referrer_host(&ctx.referrer);
    let dims = vec![
        DimensionDelta::new(
            bucket,
            Dimension::Page,
            dimension_fallback(Dimension::Page, Some(&ctx.path)),
            metrics,
        ),
        DimensionDelta::new(
            bucket,
            Dimension::ReferrerDomain,
            dimension_fallback(Dimension::ReferrerDomain, Some(&referrer_host)),
            metrics,
        ),
        DimensionDelta::new(
            bucket,
            Dimension::UtmSource,
            dimension_fallback(Dimension::UtmSource, ctx.utm_source.as_deref()),
            metrics,
        ),
        DimensionDelta::new(
            bucket,
            Dimension::UtmCampaign,
            dimension_fallback(Dimension::UtmCampaign, ctx.utm_campaign.as_deref()),
            metrics,
        ),
    ];
    (MetricsDelta { bucket, metrics }, dims)
}

/// Extracts the bare host from a `NormalizedContext::referrer` (which carries
/// the full `origin + pathname`, not just a host) for `referrer_domain`
/// attribution.
fn referrer_host(referrer: &str) -> String {
    if referrer.is_empty() {
        return String::new();
    }
    url::Url::parse(referrer)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// `goals += 1` at the event's own bucket, attributed to the goal's `name`.
pub fn goal_deltas(name: &str, event_timestamp_ms: i64) -> (MetricsDelta, DimensionDelta) {
    let bucket = Bucket::from_timestamp_ms(event_timestamp_ms);
    let metrics = MetricVector {
        goals: 1,
        ..Default::default()
    };
    let dim = DimensionDelta::new(
        bucket,
        Dimension::Goal,
        dimension_fallback(Dimension::Goal, Some(name)),
        metrics,
    );
    (MetricsDelta { bucket, metrics }, dim)
}

/// `visitors += 1` at the event's own bucket — only emitted by the caller
/// once per `(siteId, date, visitorId)`, gated on a conflict-do-nothing
/// insert into `visitor_daily`.
pub fn visitor_delta(event_timestamp_ms: i64) -> MetricsDelta {
    MetricsDelta {
        bucket: Bucket::from_timestamp_ms(event_timestamp_ms),
        metrics: MetricVector {
            visitors: 1,
            ..Default::default()
        },
    }
}

/// Revenue deltas from a processed payment.
pub fn payment_deltas(amount_minor: i64, event_type: crate::model::PaymentEventType, event_timestamp_ms: i64) -> MetricsDelta {
    use crate::model::PaymentEventType::*;
    let mut metrics = MetricVector {
        revenue: amount_minor,
        ..Default::default()
    };
    match event_type {
        New => metrics.revenue_new = amount_minor,
        Renewal => metrics.revenue_renewal = amount_minor,
        Refund => metrics.revenue_refund = amount_minor,
    }
    MetricsDelta {
        bucket: Bucket::from_timestamp_ms(event_timestamp_ms),
        metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NormalizedContext;

    fn ctx() -> NormalizedContext {
        NormalizedContext {
            path: "/pricing".to_string(),
            referrer: "https://google.com/search".to_string(),
            utm_source: Some("newsletter".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn pageview_deltas_cover_four_dimensions() {
        let (metrics, dims) = pageview_deltas(&ctx(), 1_700_000_000_000);
        assert_eq!(metrics.metrics.pageviews, 1);
        assert_eq!(dims.len(), 4);
        assert!(dims.iter().any(|d| d.dimension == Dimension::Page && d.value == "/pricing"));
        assert!(dims
            .iter()
            .any(|d| d.dimension == Dimension::ReferrerDomain && d.value == "google.com"));
        assert!(dims
            .iter()
            .any(|d| d.dimension == Dimension::UtmSource && d.value == "newsletter"));
        assert!(dims
            .iter()
            .any(|d| d.dimension == Dimension::UtmCampaign && d.value == "not set"));
    }

    #[test]
    fn goal_deltas_attribute_to_name() {
        let (metrics, dim) = goal_deltas("signup", 1_700_000_000_000);
        assert_eq!(metrics.metrics.goals, 1);
        assert_eq!(dim.value, "signup");
    }

    #[test]
    fn payment_deltas_set_type_specific_field() {
        let d = payment_deltas(1999, crate::model::PaymentEventType::New, 1_700_000_000_000);
        assert_eq!(d.metrics.revenue, 1999);
        assert_eq!(d.metrics.revenue_new, 1999);
        assert_eq!(d.metrics.revenue_renewal, 0);
    }
}
