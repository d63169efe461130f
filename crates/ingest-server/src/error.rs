use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use ingest_core::error::ValidationError;
use ingest_core::validator::Rejected;
use ingest_duckdb::goals::GoalError;
use ingest_duckdb::ingest::IngestError;
use ingest_duckdb::rebuild::RebuildError;
use ingest_duckdb::webhook::WebhookError;

/// Application-level errors that map directly to HTTP responses.
///
/// Every variant implements [`IntoResponse`] so handlers can return
/// `Result<impl IntoResponse, AppError>` directly.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("payload exceeds maximum size")]
    PayloadTooLarge,

    #[error("payload is not a JSON object")]
    NotObject,

    #[error("unauthorized")]
    Unauthorized,

    #[error("site not found")]
    NotFound,

    #[error("no prior pageview for this visitor")]
    NoPriorPageview,

    #[error("rate limit exceeded")]
    RateLimited { retry_after_seconds: u64 },

    #[error("webhook signature invalid")]
    BadSignature,

    #[error("webhook site not configured for this provider")]
    ProviderNotConfigured,

    #[error("upstream malformed payload")]
    Upstream(String),

    #[error("invalid range: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<Rejected> for AppError {
    fn from(e: Rejected) -> Self {
        match e {
            Rejected::TooLarge => Self::PayloadTooLarge,
            Rejected::NotObject => Self::NotObject,
            Rejected::Validation(v) => Self::Validation(v),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Rejected(r) => r.into(),
            IngestError::Internal(err) => Self::Internal(err),
        }
    }
}

impl From<GoalError> for AppError {
    fn from(e: GoalError) -> Self {
        match e {
            GoalError::NoPriorPageview => Self::NoPriorPageview,
            GoalError::Internal(err) => Self::Internal(err),
        }
    }
}

impl From<WebhookError> for AppError {
    fn from(e: WebhookError) -> Self {
        match e {
            WebhookError::BadSignature
            | WebhookError::SignatureMismatch
            | WebhookError::TimestampOutOfRange => Self::BadSignature,
            WebhookError::ProviderNotConfigured => Self::ProviderNotConfigured,
            WebhookError::MalformedPayload
            | WebhookError::MissingVisitorAttribution
            | WebhookError::UnsupportedEventType => Self::Upstream(e.to_string()),
            WebhookError::Internal(err) => Self::Internal(err),
        }
    }
}

impl From<RebuildError> for AppError {
    fn from(e: RebuildError) -> Self {
        match e {
            RebuildError::InvalidRange => Self::BadRequest("to must be after from".to_string()),
            RebuildError::Internal(err) => Self::Internal(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, field, retry_after_seconds) = match &self {
            AppError::Validation(v) => (
                StatusCode::BAD_REQUEST,
                v.code(),
                v.to_string(),
                validation_field(v),
                None,
            ),
            AppError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                self.to_string(),
                None,
                None,
            ),
            AppError::NotObject => (
                StatusCode::BAD_REQUEST,
                "not_object",
                self.to_string(),
                None,
                None,
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                self.to_string(),
                None,
                None,
            ),
            AppError::NotFound => (
                StatusCode::NOT_FOUND,
                "not_found",
                self.to_string(),
                None,
                None,
            ),
            AppError::NoPriorPageview => (
                StatusCode::CONFLICT,
                "no_prior_pageview",
                self.to_string(),
                None,
                None,
            ),
            AppError::RateLimited {
                retry_after_seconds,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                self.to_string(),
                None,
                Some(*retry_after_seconds),
            ),
            AppError::BadSignature => (
                StatusCode::UNAUTHORIZED,
                "bad_signature",
                self.to_string(),
                None,
                None,
            ),
            AppError::ProviderNotConfigured => (
                StatusCode::NOT_FOUND,
                "provider_not_configured",
                self.to_string(),
                None,
                None,
            ),
            AppError::Upstream(msg) => (
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                msg.clone(),
                None,
                None,
            ),
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
                None,
                None,
            ),
            AppError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_string(),
                    None,
                    None,
                )
            }
        };

        let mut response = (
            status,
            Json(json!({
                "error": {
                    "code": code,
                    "message": message,
                    "field": field,
                }
            })),
        )
            .into_response();

        if let Some(secs) = retry_after_seconds {
            if let Ok(value) = secs.to_string().parse() {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
        }

        response
    }
}

fn validation_field(e: &ValidationError) -> Option<&'static str> {
    match e {
        ValidationError::MissingField(f)
        | ValidationError::InvalidField(f)
        | ValidationError::TooLong(f) => Some(f),
        _ => None,
    }
}
