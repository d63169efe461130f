use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tenant. `website_id` and `api_key` are globally unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub website_id: String,
    pub api_key: String,
    pub domain: String,
    pub timezone: String,
    pub revenue_provider: RevenueProvider,
    /// Encrypted at rest; `None` when `revenue_provider` is `None`.
    pub revenue_provider_key_enc: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevenueProvider {
    None,
    Stripe,
    Lemonsqueezy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Pageview,
    Heartbeat,
    Goal,
    Identify,
    Payment,
}

impl EventType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pageview" => Some(Self::Pageview),
            "heartbeat" => Some(Self::Heartbeat),
            "goal" => Some(Self::Goal),
            "identify" => Some(Self::Identify),
            "payment" => Some(Self::Payment),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pageview => "pageview",
            Self::Heartbeat => "heartbeat",
            Self::Goal => "goal",
            Self::Identify => "identify",
            Self::Payment => "payment",
        }
    }
}

/// Bounded heterogeneous map: string | number | bool | null, post-sanitization.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Canonicalized request context produced by the normalizer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizedContext {
    pub path: String,
    pub referrer: String,
    pub device: String,
    pub browser: String,
    pub os: String,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_term: Option<String>,
    pub utm_content: Option<String>,
    pub source: Option<String>,
    pub via: Option<String>,
    pub referrer_ref: Option<String>,
    pub bot: bool,
}

/// Immutable record of one accepted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: String,
    pub site_id: String,
    pub event_id: Option<String>,
    pub event_type: EventType,
    pub name: Option<String>,
    pub visitor_id: String,
    pub session_id: Option<String>,
    pub timestamp_ms: i64,
    pub metadata: Metadata,
    pub normalized: NormalizedContext,
    pub created_at: DateTime<Utc>,
}

/// One row per `(site_id, session_id, visitor_id)`.
#[derive(Debug, Clone)]
pub struct Session {
    pub first_timestamp_ms: i64,
    pub last_timestamp_ms: i64,
    pub pageviews: i64,
    pub first_context: SessionContext,
}

/// The slice of `NormalizedContext` session dimensions are attributed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub device: String,
    pub browser: String,
}

impl From<&NormalizedContext> for SessionContext {
    fn from(ctx: &NormalizedContext) -> Self {
        Self {
            country: ctx.country.clone(),
            region: ctx.region.clone(),
            city: ctx.city.clone(),
            device: ctx.device.clone(),
            browser: ctx.browser.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentEventType {
    New,
    Renewal,
    Refund,
}

/// One row per `(site_id, transaction_id)`.
#[derive(Debug, Clone)]
pub struct Payment {
    pub site_id: String,
    pub transaction_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub provider: RevenueProvider,
    pub event_type: PaymentEventType,
    pub visitor_id: Option<String>,
    pub customer_id: Option<String>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The metric vector `M` shared by hourly/daily, overall/dimensional cubes.
///
/// `visitors`, `pageviews`, `goals`, and the `revenue*` fields are monotonic
/// non-negative counters. `sessions`, `bounced_sessions`, and
/// `avg_session_duration_ms` are signed accumulators: every `-1` applied
/// during a bucket migration is matched by a prior `+1`,
/// so the steady-state value is never negative, but a single delta may be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricVector {
    pub visitors: i64,
    pub sessions: i64,
    pub bounced_sessions: i64,
    pub avg_session_duration_ms: i64,
    pub pageviews: i64,
    pub goals: i64,
    pub revenue: i64,
    pub revenue_new: i64,
    pub revenue_renewal: i64,
    pub revenue_refund: i64,
}

impl std::ops::Add for MetricVector {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self {
            visitors: self.visitors + rhs.visitors,
            sessions: self.sessions + rhs.sessions,
            bounced_sessions: self.bounced_sessions + rhs.bounced_sessions,
            avg_session_duration_ms: self.avg_session_duration_ms + rhs.avg_session_duration_ms,
            pageviews: self.pageviews + rhs.pageviews,
            goals: self.goals + rhs.goals,
            revenue: self.revenue + rhs.revenue,
            revenue_new: self.revenue_new + rhs.revenue_new,
            revenue_renewal: self.revenue_renewal + rhs.revenue_renewal,
            revenue_refund: self.revenue_refund + rhs.revenue_refund,
        }
    }
}

impl std::ops::AddAssign for MetricVector {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Page,
    ReferrerDomain,
    UtmSource,
    UtmCampaign,
    Country,
    Region,
    City,
    Device,
    Browser,
    Goal,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::ReferrerDomain => "referrer_domain",
            Self::UtmSource => "utm_source",
            Self::UtmCampaign => "utm_campaign",
            Self::Country => "country",
            Self::Region => "region",
            Self::City => "city",
            Self::Device => "device",
            Self::Browser => "browser",
            Self::Goal => "goal",
        }
    }
}

/// `(date[, hour])` under which metrics accumulate. `hour = None` means the
/// delta only touches the daily cube (not used currently — every live delta
/// carries an hour; kept for rebuild bucket symmetry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bucket {
    pub date: NaiveDate,
    pub hour: u32,
}

impl Bucket {
    pub fn from_timestamp_ms(ts_ms: i64) -> Self {
        let dt = DateTime::<Utc>::from_timestamp_millis(ts_ms).unwrap_or_else(Utc::now);
        Self {
            date: dt.date_naive(),
            hour: dt.format("%H").to_string().parse().unwrap_or(0),
        }
    }
}

/// A signed change to a bucket's metric vector, emitted by the session engine
/// and applied by the rollup engine.
#[derive(Debug, Clone, Copy)]
pub struct MetricsDelta {
    pub bucket: Bucket,
    pub metrics: MetricVector,
}

/// A signed change to one `(dimension, value)` pair's metric vector. Unlike
/// the overall `MetricsDelta`, only the fields relevant to how that
/// dimension is attributed are ever non-zero (e.g. the `goal` dimension only
/// ever carries `goals`, never `pageviews` or `sessions`).
#[derive(Debug, Clone)]
pub struct DimensionDelta {
    pub bucket: Bucket,
    pub dimension: Dimension,
    pub value: String,
    pub metrics: MetricVector,
}

impl DimensionDelta {
    pub fn new(bucket: Bucket, dimension: Dimension, value: String, metrics: MetricVector) -> Self {
        Self {
            bucket,
            dimension,
            value,
            metrics,
        }
    }
}

/// Per-bucket metric vector keyed `(site_id, date[, hour])`.
#[derive(Debug, Clone, Default)]
pub struct RollupRow {
    pub site_id: String,
    pub date: NaiveDate,
    pub hour: Option<u32>,
    pub metrics: MetricVector,
}

/// Per-bucket metric vector keyed `(site_id, date[, hour], dimension, value)`.
#[derive(Debug, Clone)]
pub struct RollupDimensionRow {
    pub site_id: String,
    pub date: NaiveDate,
    pub hour: Option<u32>,
    pub dimension: Dimension,
    pub value: String,
    pub metrics: MetricVector,
}

pub fn dimension_fallback(dimension: Dimension, raw: Option<&str>) -> String {
    let trimmed = raw.map(str::trim).filter(|s| !s.is_empty());
    match (dimension, trimmed) {
        (_, Some(v)) => v.to_string(),
        (Dimension::Page, None) => "/".to_string(),
        (Dimension::ReferrerDomain, None) => "direct".to_string(),
        (Dimension::UtmSource | Dimension::UtmCampaign, None) => "not set".to_string(),
        (
            Dimension::Country | Dimension::Region | Dimension::City | Dimension::Device
            | Dimension::Browser | Dimension::Goal,
            None,
        ) => "unknown".to_string(),
    }
}
