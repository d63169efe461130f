use axum::{
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
};

const SCRIPT: &str = include_str!("../../static/script.js");

/// `GET /js/script.js` — the tracking snippet embedded on tenant sites.
/// `cache-control: public, max-age=3600, immutable`: the content
/// only changes on deploy, never per request.
pub async fn script() -> impl IntoResponse {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/javascript")),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("public, max-age=3600, immutable"),
            ),
        ],
        SCRIPT,
    )
}
