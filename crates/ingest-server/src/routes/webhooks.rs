use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use ingest_core::model::RevenueProvider;

use crate::error::AppError;
use crate::state::AppState;

/// `POST /api/webhooks/{provider}/{websiteId}`: verifies the
/// provider's signature against the raw body before anything else is
/// trusted about the request.
pub async fn webhook(
    State(state): State<Arc<AppState>>,
    Path((provider, website_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, AppError> {
    let (provider, signature_header_name) = match provider.as_str() {
        "stripe" => (RevenueProvider::Stripe, "stripe-signature"),
        "lemonsqueezy" => (RevenueProvider::Lemonsqueezy, "x-signature"),
        _ => return Err(AppError::NotFound),
    };

    let site = state
        .db
        .find_site_by_website_id(&website_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let signature_header = headers
        .get(signature_header_name)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::BadSignature)?;

    let now_ms = chrono::Utc::now().timestamp_millis();
    let outcome = state
        .db
        .process_webhook(
            &state.config,
            &site,
            provider,
            signature_header,
            &body,
            now_ms,
        )
        .await?;

    Ok(Json(json!({ "ok": true, "deduped": outcome.deduped })))
}
