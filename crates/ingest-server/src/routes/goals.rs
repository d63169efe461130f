use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;

use ingest_duckdb::goals::GoalRequest;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GoalPayload {
    #[serde(rename = "datafast_visitor_id")]
    visitor_id: String,
    name: String,
    #[serde(default)]
    metadata: ingest_core::model::Metadata,
}

/// `POST /api/v1/goals`: requires a bearer API key identifying the
/// site, and a prior pageview from the same visitor (409 otherwise).
/// Deduped via the `x-idempotency-key` header.
pub async fn record_goal(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<GoalPayload>,
) -> Result<impl IntoResponse, AppError> {
    let api_key = crate::auth::api_key::bearer_token(&headers).ok_or(AppError::Unauthorized)?;
    let site = state
        .db
        .find_site_by_api_key(api_key)
        .await?
        .ok_or(AppError::Unauthorized)?;

    let idempotency_key = headers
        .get("x-idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let now_ms = chrono::Utc::now().timestamp_millis();
    let outcome = state
        .db
        .record_goal(
            &site,
            &GoalRequest {
                visitor_id: payload.visitor_id,
                name: payload.name,
                metadata: payload.metadata,
                idempotency_key,
            },
            now_ms,
        )
        .await?;

    Ok(Json(json!({ "ok": true, "deduped": outcome.deduped })))
}
