use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};

use axum::{
    extract::{ConnectInfo, FromRequestParts, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use ingest_core::validator::RequestHeaders;

use crate::auth::rate_limit::Scope;
use crate::error::AppError;
use crate::state::AppState;

/// Socket peer address, when available. `axum::serve` attaches one via
/// `into_make_service_with_connect_info`; a bare `ConnectInfo<SocketAddr>`
/// extractor would reject requests driven directly through the `Router`
/// (as integration tests do), so this tolerates its absence instead.
#[derive(Debug)]
pub struct MaybeConnectInfo(pub Option<SocketAddr>);

impl<S> FromRequestParts<S> for MaybeConnectInfo
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0),
        ))
    }
}

/// `POST /api/v1/ingest`: validates, normalizes, and transactionally
/// persists one event (event storage, session update, and rollup application
/// in a single DB transaction).
#[tracing::instrument(skip(state, headers, body))]
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    connect_info: MaybeConnectInfo,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, AppError> {
    let client_ip = extract_client_ip(&headers, connect_info.0);
    let ip_limit = state.rate_limiter.check(Scope::Ip, &client_ip.to_string());

    let website_id = peek_website_id(&body)?;
    let site = state
        .db
        .find_site_by_website_id(&website_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let site_limit = state.rate_limiter.check(Scope::Site, &site.id);

    // Both scopes are checked even when one already failed, so a caller
    // hammering both its IP and its site bucket at once is told to wait out
    // whichever window is longer rather than whichever scope happened to be
    // checked first.
    let retry_after = match (ip_limit, site_limit) {
        (Err(ip), Err(site)) => Some(ip.max(site)),
        (Err(ip), Ok(())) => Some(ip),
        (Ok(()), Err(site)) => Some(site),
        (Ok(()), Ok(())) => None,
    };
    if let Some(retry_after) = retry_after {
        return Err(AppError::RateLimited {
            retry_after_seconds: retry_after.as_secs().max(1),
        });
    }

    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok());
    let origin = headers
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    let referer = headers
        .get(axum::http::header::REFERER)
        .and_then(|v| v.to_str().ok());
    let server_key_provided = crate::auth::api_key::bearer_token(&headers)
        .zip(state.config.server_key.as_deref())
        .map(|(given, configured)| given == configured)
        .unwrap_or(false);

    let request_headers = RequestHeaders {
        user_agent,
        origin,
        referer,
        server_key_provided,
    };

    let now_ms = chrono::Utc::now().timestamp_millis();
    let outcome = state
        .db
        .ingest(
            &state.config,
            &site,
            &body,
            &request_headers,
            Some(client_ip),
            user_agent,
            now_ms,
        )
        .await?;

    Ok(Json(json!({
        "ok": true,
        "deduped": outcome.deduped,
        "debug": {
            "usedClientTimestamp": outcome.used_client_timestamp,
            "clockSkewMs": outcome.clock_skew_ms,
        }
    })))
}

fn peek_website_id(body: &[u8]) -> Result<String, AppError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| AppError::NotObject)?;
    value
        .get("websiteId")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or(AppError::NotFound)
}

/// Prefers the direct socket peer; `X-Forwarded-For` is only trusted from a
/// configured set of proxy CIDRs. Falls back to `UNSPECIFIED` when the peer
/// address isn't available at all (only possible outside real network I/O).
fn extract_client_ip(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> IpAddr {
    let remote_ip = remote_addr.map(|a| a.ip());
    if let Some(remote_ip) = remote_ip {
        if trusted_proxy_cidrs().iter().any(|c| c.contains(&remote_ip)) {
            if let Some(forwarded) = parse_forwarded_ip(headers) {
                return forwarded;
            }
        }
    }
    remote_ip.unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))
}

fn parse_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
}

fn trusted_proxy_cidrs() -> &'static Vec<ipnet::IpNet> {
    static TRUSTED: OnceLock<Vec<ipnet::IpNet>> = OnceLock::new();
    TRUSTED.get_or_init(|| {
        std::env::var("INGEST_TRUSTED_PROXIES")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .filter_map(|entry| entry.trim().parse::<ipnet::IpNet>().ok())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    })
}
