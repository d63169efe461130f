use thiserror::Error;

/// Reasons validation/normalization can reject a payload. Carried up to the server crate, which
/// maps every variant to a `400` with `{code, message, field}`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    #[error("field too long: {0}")]
    TooLong(&'static str),

    #[error("session_id and sessionId must match")]
    SessionIdMismatch,

    #[error("bot flag requires server key")]
    BotRequiresServerKey,

    #[error("timestamp too far in the past")]
    TimestampPast,

    #[error("timestamp too far in the future")]
    TimestampFuture,

    #[error("request origin does not match site domain")]
    OriginMismatch,

    #[error("too many metadata keys")]
    TooManyMetadataKeys,
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownField(_) => "unknown_field",
            Self::MissingField(_) => "missing_field",
            Self::InvalidField(_) => "invalid_field",
            Self::TooLong(_) => "too_long",
            Self::SessionIdMismatch => "session_id_mismatch",
            Self::BotRequiresServerKey => "bot_requires_server_key",
            Self::TimestampPast => "timestamp_past",
            Self::TimestampFuture => "timestamp_future",
            Self::OriginMismatch => "origin_mismatch",
            Self::TooManyMetadataKeys => "too_many_metadata_keys",
        }
    }
}
