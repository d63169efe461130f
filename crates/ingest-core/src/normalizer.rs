//! Context normalization.
//!
//! Turns an `Accepted` payload plus request-level signals (User-Agent,
//! client IP) into a `NormalizedContext` and a reconciled event timestamp.

use std::net::IpAddr;
use std::sync::OnceLock;

use crate::bot::is_bot_user_agent;
use crate::model::NormalizedContext;
use crate::validator::Accepted;

/// Lazily-opened MaxMind City database, memory-mapped and safe to share
/// across requests once opened.
pub struct GeoResolver {
    reader: Option<maxminddb::Reader<Vec<u8>>>,
}

static GEO: OnceLock<GeoResolver> = OnceLock::new();

impl GeoResolver {
    pub fn open(path: &str) -> Self {
        let reader = maxminddb::Reader::open_readfile(path).ok();
        if reader.is_none() {
            tracing::warn!(path, "geoip database not found, geo fields will be empty");
        }
        Self { reader }
    }

    /// Returns the process-wide resolver, opening it from `path` on first use.
    pub fn global(path: &str) -> &'static Self {
        GEO.get_or_init(|| Self::open(path))
    }

    pub fn lookup(&self, ip: IpAddr) -> GeoFields {
        let Some(reader) = &self.reader else {
            return GeoFields::default();
        };
        let Ok(city) = reader.lookup::<maxminddb::geoip2::City>(ip) else {
            return GeoFields::default();
        };
        let Some(city) = city else {
            return GeoFields::default();
        };
        GeoFields {
            country: city
                .country
                .as_ref()
                .and_then(|c| c.iso_code)
                .map(str::to_string),
            region: city
                .subdivisions
                .as_ref()
                .and_then(|s| s.first())
                .and_then(|s| s.names.as_ref())
                .and_then(|n| n.get("en"))
                .map(|s| s.to_string()),
            city: city
                .city
                .as_ref()
                .and_then(|c| c.names.as_ref())
                .and_then(|n| n.get("en"))
                .map(|s| s.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GeoFields {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

/// Result of normalizing one accepted payload.
pub struct Normalized {
    pub context: NormalizedContext,
    pub timestamp_ms: i64,
    pub used_client_timestamp: bool,
}

pub fn normalize(
    accepted: &Accepted,
    user_agent: Option<&str>,
    client_ip: Option<IpAddr>,
    geo: &GeoResolver,
    max_client_ts_skew_ms: i64,
    now_ms: i64,
) -> Normalized {
    let path = canonical_path(&accepted.path);
    let referrer = canonical_referrer(accepted.referrer.as_deref());

    let ua = user_agent.unwrap_or("");
    let (device, browser, os) = parse_user_agent(ua);
    let bot = accepted.bot || is_bot_user_agent(ua);

    let geo_fields = client_ip
        .map(|ip| geo.lookup(ip))
        .unwrap_or_default();

    let (timestamp_ms, used_client_timestamp) =
        reconcile_timestamp(accepted.client_ts_ms, max_client_ts_skew_ms, now_ms);

    let context = NormalizedContext {
        path,
        referrer,
        device,
        browser,
        os,
        country: geo_fields.country,
        region: geo_fields.region,
        city: geo_fields.city,
        utm_source: lower(&accepted.utm_source),
        utm_medium: lower(&accepted.utm_medium),
        utm_campaign: lower(&accepted.utm_campaign),
        utm_term: lower(&accepted.utm_term),
        utm_content: lower(&accepted.utm_content),
        source: lower(&accepted.source),
        via: lower(&accepted.via),
        referrer_ref: lower(&accepted.referrer_ref),
        bot,
    };

    Normalized {
        context,
        timestamp_ms,
        used_client_timestamp,
    }
}

fn lower(value: &Option<String>) -> Option<String> {
    value.as_ref().map(|s| s.to_ascii_lowercase())
}

/// Strips query/fragment, guarantees a leading slash, clamps to 1024 bytes.
fn canonical_path(raw: &str) -> String {
    let without_query = raw.split(['?', '#']).next().unwrap_or("");
    let mut path = if without_query.starts_with('/') {
        without_query.to_string()
    } else {
        format!("/{without_query}")
    };
    if path.len() > 1024 {
        path.truncate(1024);
    }
    path
}

/// Resolves the referrer to `origin + pathname` for http(s) URLs (stripping
/// a leading `www.` from the host, so `www.google.com` and `google.com`
/// referrers collapse to the same value), or the raw href for any other
/// scheme. Empty string if absent. Parsed through `url::Url` so
/// internationalized hosts and ports are handled correctly instead of via ad
/// hoc string trimming.
fn canonical_referrer(referrer: Option<&str>) -> String {
    let Some(raw) = referrer else {
        return String::new();
    };
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    let Ok(parsed) = url::Url::parse(&with_scheme) else {
        return String::new();
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return parsed.as_str().to_string();
    }
    let Some(host) = parsed.host_str() else {
        return String::new();
    };
    let host = host.strip_prefix("www.").unwrap_or(host).to_ascii_lowercase();
    format!("{}://{host}{}", parsed.scheme(), parsed.path())
}

fn parse_user_agent(ua: &str) -> (String, String, String) {
    if ua.is_empty() {
        return ("unknown".to_string(), "unknown".to_string(), "unknown".to_string());
    }
    let parser = woothee::parser::Parser::new();
    match parser.parse(ua) {
        Some(result) => {
            let device = match result.category {
                "smartphone" | "mobilephone" => "mobile",
                "tablet" => "tablet",
                "pc" => "desktop",
                "crawler" | "appliance" | "misc" => "other",
                _ => "unknown",
            };
            (
                device.to_string(),
                result.name.to_ascii_lowercase(),
                result.os.to_ascii_lowercase(),
            )
        }
        None => ("unknown".to_string(), "unknown".to_string(), "unknown".to_string()),
    }
}

/// Reconciles the client-asserted timestamp against the server clock.
/// The candidate has already been bounds-checked by the validator; here we
/// only decide whether to trust it or clamp forward skew to `now_ms`.
fn reconcile_timestamp(
    client_ts_ms: Option<i64>,
    max_client_ts_skew_ms: i64,
    now_ms: i64,
) -> (i64, bool) {
    let Some(candidate) = client_ts_ms else {
        return (now_ms, false);
    };
    let skew = candidate - now_ms;
    if skew > 0 && skew <= max_client_ts_skew_ms {
        (now_ms, false)
    } else {
        (candidate, true)
    }
}
