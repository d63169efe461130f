//! Bearer-token lookup for endpoints that require one (goals, cron). Sites
//! are looked up by the bearer token directly against `sites.api_key`, which
//! is stored and compared in plaintext (see DESIGN.md) rather than a
//! hash-and-compare scheme — this key only gates a server-to-server ingest
//! write, scoped to one site, not a multi-tenant dashboard login.

use axum::http::HeaderMap;

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    raw.strip_prefix("Bearer ").map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer abc123".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), Some("abc123"));
    }

    #[test]
    fn rejects_non_bearer_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Basic abc123".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), None);
    }
}
