use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use ingest_duckdb::rebuild::RebuildRequest;

use crate::error::AppError;
use crate::state::AppState;

fn authorize(state: &AppState, headers: &HeaderMap, secret_param: Option<&str>) -> Result<(), AppError> {
    let Some(configured) = state.config.cron_secret.as_deref() else {
        return Err(AppError::Unauthorized);
    };
    let bearer = crate::auth::api_key::bearer_token(headers);
    let header_secret = headers
        .get("x-cron-secret")
        .and_then(|v| v.to_str().ok());
    let provided = bearer.or(header_secret).or(secret_param);
    if provided == Some(configured) {
        Ok(())
    } else {
        Err(AppError::Unauthorized)
    }
}

#[derive(Debug, Deserialize)]
pub struct RetentionParams {
    secret: Option<String>,
}

/// `GET`/`POST /api/cron/retention` — operator-triggered retention sweep,
/// sharing the re-entry guard with the background loop.
pub async fn retention(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<RetentionParams>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &headers, params.secret.as_deref())?;
    let report = ingest_duckdb::retention::run_guarded(&state.db, &state.config).await?;
    Ok(Json(json!({
        "ok": true,
        "rawEventsDeleted": report.raw_events_deleted,
        "sessionsDeleted": report.sessions_deleted,
        "visitorDailyDeleted": report.visitor_daily_deleted,
        "rollupDailyDeleted": report.rollup_daily_deleted,
        "rollupDimensionDailyDeleted": report.rollup_dimension_daily_deleted,
        "rollupHourlyDeleted": report.rollup_hourly_deleted,
        "rollupDimensionHourlyDeleted": report.rollup_dimension_hourly_deleted,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RebuildParams {
    secret: Option<String>,
    #[serde(alias = "siteId")]
    site_id: Option<String>,
    from: i64,
    to: i64,
    #[serde(alias = "dryRun", default)]
    dry_run: bool,
    #[serde(alias = "includeDiff", default)]
    include_diff: bool,
}

/// `GET`/`POST /api/cron/rollup-rebuild` — operator-triggered rebuild.
pub async fn rebuild(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<RebuildParams>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &headers, params.secret.as_deref())?;

    let outcome = state
        .db
        .rebuild(&RebuildRequest {
            site_id: params.site_id,
            from_ms: params.from,
            to_ms: params.to,
            dry_run: params.dry_run,
            include_diff: params.include_diff,
        })
        .await?;

    let mut body = json!({
        "ok": true,
        "bucketsWritten": outcome.buckets_written,
        "diffCount": outcome.diff.len(),
    });
    if params.include_diff {
        body["diff"] = serde_json::to_value(&outcome.diff).map_err(anyhow::Error::from)?;
    }
    Ok(Json(body))
}
