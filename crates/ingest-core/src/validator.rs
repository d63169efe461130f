//! Payload validation.
//!
//! `validate` is a pure function: JSON bytes + request headers in, an
//! `Accepted` payload or a `Rejected` reason out. No I/O.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::Config;
use crate::error::ValidationError;
use crate::model::{EventType, Metadata};

const ALLOWED_KEYS: &[&str] = &[
    "v",
    "type",
    "name",
    "websiteId",
    "domain",
    "path",
    "referrer",
    "ts",
    "timestamp",
    "visitorId",
    "session_id",
    "sessionId",
    "eventId",
    "bot",
    "metadata",
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "source",
    "via",
    "ref",
];

const MAX_METADATA_KEYS: usize = 12;
const MAX_METADATA_KEY_LEN: usize = 64;
const MAX_METADATA_VALUE_LEN: usize = 255;

/// Outcome of a successful validation pass.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub event_type: EventType,
    pub name: Option<String>,
    pub website_id: String,
    pub domain: Option<String>,
    pub path: String,
    pub referrer: Option<String>,
    /// Client-asserted (or absent) timestamp, already bounds-checked but
    /// *not yet* reconciled against the server clock — that is the
    /// normalizer's job.
    pub client_ts_ms: Option<i64>,
    pub visitor_id: Option<String>,
    pub session_id: Option<String>,
    pub event_id: Option<String>,
    pub bot: bool,
    pub metadata: Metadata,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_term: Option<String>,
    pub utm_content: Option<String>,
    pub source: Option<String>,
    pub via: Option<String>,
    pub referrer_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
    #[error("payload exceeds maximum size")]
    TooLarge,
    #[error("payload is not a JSON object")]
    NotObject,
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Minimal view of the headers the validator needs. Kept free of any HTTP
/// framework type so this crate stays pure.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders<'a> {
    pub user_agent: Option<&'a str>,
    pub origin: Option<&'a str>,
    pub referer: Option<&'a str>,
    pub server_key_provided: bool,
}

/// `now_ms` is injected rather than read from the clock so the bounds check
/// is deterministic in tests.
pub fn validate(
    body: &[u8],
    headers: &RequestHeaders,
    config: &Config,
    site_domain: &str,
    now_ms: i64,
) -> Result<Accepted, Rejected> {
    if body.len() > config.max_payload_bytes {
        return Err(Rejected::TooLarge);
    }

    let value: Value = serde_json::from_slice(body).map_err(|_| Rejected::NotObject)?;
    let obj = value.as_object().ok_or(Rejected::NotObject)?;

    for key in obj.keys() {
        if !ALLOWED_KEYS.contains(&key.as_str()) {
            return Err(Rejected::Validation(ValidationError::UnknownField(
                key.clone(),
            )));
        }
    }

    let event_type_raw = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ValidationError::MissingField("type"))?;
    let event_type =
        EventType::parse(event_type_raw).ok_or(ValidationError::InvalidField("type"))?;

    let name = opt_string(obj, "name", 255)?;
    if matches!(event_type, EventType::Goal) && name.is_none() {
        return Err(Rejected::Validation(ValidationError::MissingField("name")));
    }

    let website_id = required_trimmed_string(obj, "websiteId", 1, 128)?;
    let domain = opt_string(obj, "domain", 255)?;
    let path = required_trimmed_string(obj, "path", 1, 1024)?;
    let referrer = opt_string(obj, "referrer", 2048)?;

    let visitor_id = opt_trimmed_string(obj, "visitorId", 1, 128)?;
    let session_id_camel = opt_trimmed_string(obj, "sessionId", 1, 128)?;
    let session_id_snake = opt_trimmed_string(obj, "session_id", 1, 128)?;
    let session_id = match (&session_id_camel, &session_id_snake) {
        (Some(a), Some(b)) if a != b => return Err(Rejected::Validation(ValidationError::SessionIdMismatch)),
        (Some(a), _) => Some(a.clone()),
        (None, b) => b.clone(),
    };
    let event_id = opt_trimmed_string(obj, "eventId", 1, 128)?;

    let bot = obj.get("bot").and_then(Value::as_bool).unwrap_or(false);
    if bot && !headers.server_key_provided {
        return Err(Rejected::Validation(ValidationError::BotRequiresServerKey));
    }

    let metadata = parse_metadata(obj)?;
    if matches!(event_type, EventType::Identify) {
        let user_id_non_empty = metadata
            .get("user_id")
            .and_then(Value::as_str)
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        if !user_id_non_empty {
            return Err(Rejected::Validation(ValidationError::MissingField(
                "metadata.user_id",
            )));
        }
    }

    let utm_source = opt_string(obj, "utm_source", 255)?;
    let utm_medium = opt_string(obj, "utm_medium", 255)?;
    let utm_campaign = opt_string(obj, "utm_campaign", 255)?;
    let utm_term = opt_string(obj, "utm_term", 255)?;
    let utm_content = opt_string(obj, "utm_content", 255)?;
    let source = opt_string(obj, "source", 255)?;
    let via = opt_string(obj, "via", 255)?;
    let referrer_ref = opt_string(obj, "ref", 255)?;

    let client_ts_ms = parse_timestamp(obj)?;
    if let Some(ts) = client_ts_ms {
        let skew = ts - now_ms;
        if skew < -config.max_backfill_ms {
            return Err(Rejected::Validation(ValidationError::TimestampPast));
        }
        if skew > config.max_client_ts_skew_ms {
            return Err(Rejected::Validation(ValidationError::TimestampFuture));
        }
    }

    if !headers.server_key_provided && !origin_matches(headers, site_domain) {
        return Err(Rejected::Validation(ValidationError::OriginMismatch));
    }

    Ok(Accepted {
        event_type,
        name,
        website_id,
        domain,
        path,
        referrer,
        client_ts_ms,
        visitor_id,
        session_id,
        event_id,
        bot,
        metadata,
        utm_source,
        utm_medium,
        utm_campaign,
        utm_term,
        utm_content,
        source,
        via,
        referrer_ref,
    })
}

fn parse_timestamp(obj: &serde_json::Map<String, Value>) -> Result<Option<i64>, Rejected> {
    let raw = obj.get("ts").or_else(|| obj.get("timestamp"));
    let Some(raw) = raw else {
        return Ok(None);
    };
    let parsed = match raw {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed
        .map(Some)
        .ok_or_else(|| Rejected::Validation(ValidationError::InvalidField("ts")))
}

fn required_trimmed_string(
    obj: &serde_json::Map<String, Value>,
    key: &'static str,
    min: usize,
    max: usize,
) -> Result<String, Rejected> {
    let raw = obj
        .get(key)
        .and_then(Value::as_str)
        .ok_or(ValidationError::MissingField(key))?;
    let trimmed = raw.trim();
    if trimmed.len() < min || trimmed.len() > max {
        return Err(Rejected::Validation(ValidationError::InvalidField(key)));
    }
    Ok(trimmed.to_string())
}

fn opt_trimmed_string(
    obj: &serde_json::Map<String, Value>,
    key: &'static str,
    min: usize,
    max: usize,
) -> Result<Option<String>, Rejected> {
    let Some(raw) = obj.get(key).and_then(Value::as_str) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.len() < min || trimmed.len() > max {
        return Err(Rejected::Validation(ValidationError::InvalidField(key)));
    }
    Ok(Some(trimmed.to_string()))
}

fn opt_string(
    obj: &serde_json::Map<String, Value>,
    key: &'static str,
    max: usize,
) -> Result<Option<String>, Rejected> {
    let Some(raw) = obj.get(key).and_then(Value::as_str) else {
        return Ok(None);
    };
    if raw.len() > max {
        return Err(Rejected::Validation(ValidationError::TooLong(key)));
    }
    Ok(Some(raw.to_string()))
}

fn parse_metadata(obj: &serde_json::Map<String, Value>) -> Result<Metadata, Rejected> {
    let mut out: Metadata = BTreeMap::new();
    let Some(raw) = obj.get("metadata") else {
        return Ok(out);
    };
    let Some(map) = raw.as_object() else {
        return Err(Rejected::Validation(ValidationError::InvalidField(
            "metadata",
        )));
    };
    if map.len() > MAX_METADATA_KEYS {
        return Err(Rejected::Validation(ValidationError::TooManyMetadataKeys));
    }
    for (raw_key, raw_value) in map {
        let key = raw_key.trim().to_lowercase();
        if key.is_empty()
            || key.len() > MAX_METADATA_KEY_LEN
            || !key
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(Rejected::Validation(ValidationError::InvalidField(
                "metadata key",
            )));
        }
        let sanitized = match raw_value {
            Value::String(s) => {
                let cleaned = collapse_whitespace(&strip_html(s)).trim().to_string();
                if cleaned.is_empty() {
                    continue;
                }
                if cleaned.len() > MAX_METADATA_VALUE_LEN {
                    return Err(Rejected::Validation(ValidationError::TooLong(
                        "metadata value",
                    )));
                }
                Value::String(cleaned)
            }
            Value::Number(_) | Value::Bool(_) | Value::Null => raw_value.clone(),
            Value::Array(_) | Value::Object(_) => {
                return Err(Rejected::Validation(ValidationError::InvalidField(
                    "metadata value",
                )))
            }
        };
        out.insert(key, sanitized);
    }
    Ok(out)
}

fn strip_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn collapse_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_space = false;
    for c in input.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

fn host_matches_or_is_subdomain(host: &str, site_domain: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let site_domain = site_domain.trim_end_matches('.').to_ascii_lowercase();
    host == site_domain || host.ends_with(&format!(".{site_domain}"))
}

fn origin_matches(headers: &RequestHeaders, site_domain: &str) -> bool {
    for candidate in [headers.origin, headers.referer].into_iter().flatten() {
        if let Some(host) = extract_host(candidate) {
            if host_matches_or_is_subdomain(&host, site_domain) {
                return true;
            }
        }
    }
    false
}

fn extract_host(raw: &str) -> Option<String> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    url::Url::parse(&with_scheme)
        .ok()
        .map(|u| u.host_str().unwrap_or("").to_string())
        .filter(|h| !h.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            port: 3000,
            data_dir: "./data".into(),
            geoip_path: "./geo.mmdb".into(),
            duckdb_memory_limit: "1GB".into(),
            database_url: "./data/ingest.db".into(),
            max_payload_bytes: 32 * 1024,
            max_backfill_ms: 24 * 60 * 60 * 1000,
            max_client_ts_skew_ms: 5 * 60 * 1000,
            server_key: None,
            rate_limit_per_ip_per_min: 60,
            rate_limit_per_site_per_min: 300,
            raw_event_retention_days: 90,
            rollup_daily_retention_days: 1095,
            rollup_hourly_retention_days: 30,
            cleanup_interval_ms: 6 * 60 * 60 * 1000,
            revenue_provider_key_secret: "x".repeat(32),
            stripe_webhook_secret: None,
            lemonsqueezy_webhook_secret: None,
            cron_secret: None,
        }
    }

    fn headers<'a>() -> RequestHeaders<'a> {
        RequestHeaders {
            user_agent: Some("Mozilla/5.0"),
            origin: Some("https://example.com"),
            referer: None,
            server_key_provided: false,
        }
    }

    #[test]
    fn accepts_minimal_pageview() {
        let body = br#"{"type":"pageview","websiteId":"site_1","path":"/"}"#;
        let result = validate(body, &headers(), &config(), "example.com", 1_700_000_000_000);
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_unknown_field() {
        let body = br#"{"type":"pageview","websiteId":"site_1","path":"/","nope":1}"#;
        let err = validate(body, &headers(), &config(), "example.com", 1_700_000_000_000)
            .unwrap_err();
        assert!(matches!(
            err,
            Rejected::Validation(ValidationError::UnknownField(_))
        ));
    }

    #[test]
    fn rejects_mismatched_session_ids() {
        let body = br#"{"type":"pageview","websiteId":"site_1","path":"/","sessionId":"a","session_id":"b"}"#;
        let err = validate(body, &headers(), &config(), "example.com", 1_700_000_000_000)
            .unwrap_err();
        assert_eq!(
            err,
            Rejected::Validation(ValidationError::SessionIdMismatch)
        );
    }

    #[test]
    fn goal_requires_name() {
        let body = br#"{"type":"goal","websiteId":"site_1","path":"/"}"#;
        let err = validate(body, &headers(), &config(), "example.com", 1_700_000_000_000)
            .unwrap_err();
        assert_eq!(
            err,
            Rejected::Validation(ValidationError::MissingField("name"))
        );
    }

    #[test]
    fn identify_requires_user_id_metadata() {
        let body = br#"{"type":"identify","websiteId":"site_1","path":"/"}"#;
        let err = validate(body, &headers(), &config(), "example.com", 1_700_000_000_000)
            .unwrap_err();
        assert_eq!(
            err,
            Rejected::Validation(ValidationError::MissingField("metadata.user_id"))
        );
    }

    #[test]
    fn bot_flag_requires_server_key() {
        let body = br#"{"type":"pageview","websiteId":"site_1","path":"/","bot":true}"#;
        let err = validate(body, &headers(), &config(), "example.com", 1_700_000_000_000)
            .unwrap_err();
        assert_eq!(
            err,
            Rejected::Validation(ValidationError::BotRequiresServerKey)
        );
    }

    #[test]
    fn bot_flag_allowed_with_server_key() {
        let mut h = headers();
        h.server_key_provided = true;
        let body = br#"{"type":"pageview","websiteId":"site_1","path":"/","bot":true}"#;
        let accepted = validate(body, &h, &config(), "example.com", 1_700_000_000_000).unwrap();
        assert!(accepted.bot);
    }

    #[test]
    fn rejects_future_timestamp() {
        let now = 1_700_000_000_000_i64;
        let body = format!(
            r#"{{"type":"pageview","websiteId":"site_1","path":"/","ts":{}}}"#,
            now + 6 * 60 * 1000
        );
        let err = validate(body.as_bytes(), &headers(), &config(), "example.com", now)
            .unwrap_err();
        assert_eq!(err, Rejected::Validation(ValidationError::TimestampFuture));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let now = 1_700_000_000_000_i64;
        let body = format!(
            r#"{{"type":"pageview","websiteId":"site_1","path":"/","ts":{}}}"#,
            now - 25 * 60 * 60 * 1000
        );
        let err = validate(body.as_bytes(), &headers(), &config(), "example.com", now)
            .unwrap_err();
        assert_eq!(err, Rejected::Validation(ValidationError::TimestampPast));
    }

    #[test]
    fn rejects_origin_mismatch_without_server_key() {
        let mut h = headers();
        h.origin = Some("https://evil.example");
        let body = br#"{"type":"pageview","websiteId":"site_1","path":"/"}"#;
        let err = validate(body, &h, &config(), "example.com", 1_700_000_000_000).unwrap_err();
        assert_eq!(err, Rejected::Validation(ValidationError::OriginMismatch));
    }

    #[test]
    fn accepts_subdomain_origin() {
        let mut h = headers();
        h.origin = Some("https://app.example.com");
        let body = br#"{"type":"pageview","websiteId":"site_1","path":"/"}"#;
        assert!(validate(body, &h, &config(), "example.com", 1_700_000_000_000).is_ok());
    }

    #[test]
    fn rejects_oversized_body() {
        let mut cfg = config();
        cfg.max_payload_bytes = 8;
        let body = br#"{"type":"pageview"}"#;
        let err = validate(body, &headers(), &cfg, "example.com", 1_700_000_000_000)
            .unwrap_err();
        assert_eq!(err, Rejected::TooLarge);
    }
}
