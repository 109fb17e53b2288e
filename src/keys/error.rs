//! Key errors and their HTTP mapping
//!
//! Every failure the gate or the lifecycle manager reports is a `KeyError`.
//! Handlers return it directly; actix turns it into a JSON body of the form
//! `{"error": <kind>, "message": <text>}` with the matching status code.

use actix_web::{
    http::{header, StatusCode},
    HttpResponse, ResponseError,
};
use chrono::{Duration, Utc};
use thiserror::Error;

use super::record::KeyId;
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("API key required. Provide via X-API-Key header or Authorization: Bearer <key>")]
    MissingCredential,

    #[error("Invalid API key")]
    InvalidCredential,

    #[error("API key has been revoked")]
    RevokedCredential,

    #[error("API key has expired")]
    ExpiredCredential,

    #[error("This operation requires the master key")]
    Forbidden,

    #[error("Daily quota of {quota} requests exceeded")]
    QuotaExceeded { quota: u32 },

    #[error("API key {0} not found")]
    NotFound(KeyId),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("Generated key collides with an active key")]
    Collision,

    #[error("Key registry is temporarily unavailable")]
    StoreUnavailable,
}

impl KeyError {
    /// Stable machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            KeyError::MissingCredential => "missing_credential",
            KeyError::InvalidCredential => "invalid_credential",
            KeyError::RevokedCredential => "revoked_credential",
            KeyError::ExpiredCredential => "expired_credential",
            KeyError::Forbidden => "forbidden",
            KeyError::QuotaExceeded { .. } => "quota_exceeded",
            KeyError::NotFound(_) => "not_found",
            KeyError::InvalidArgument(_) => "invalid_argument",
            KeyError::Collision => "collision",
            KeyError::StoreUnavailable => "store_unavailable",
        }
    }

    /// Only a store outage is worth retrying, and only by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(self, KeyError::StoreUnavailable)
    }
}

impl From<StoreError> for KeyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Collision => KeyError::Collision,
            _ => KeyError::StoreUnavailable,
        }
    }
}

/// Seconds until the next UTC midnight, when a fresh quota slot opens
fn seconds_until_reset() -> i64 {
    let now = Utc::now();
    let tomorrow = now.date_naive() + Duration::days(1);
    tomorrow
        .and_hms_opt(0, 0, 0)
        .map(|midnight| (midnight.and_utc() - now).num_seconds().max(1))
        .unwrap_or(1)
}

impl ResponseError for KeyError {
    fn status_code(&self) -> StatusCode {
        match self {
            KeyError::MissingCredential => StatusCode::UNAUTHORIZED,
            KeyError::InvalidCredential
            | KeyError::RevokedCredential
            | KeyError::ExpiredCredential
            | KeyError::Forbidden => StatusCode::FORBIDDEN,
            KeyError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            KeyError::NotFound(_) => StatusCode::NOT_FOUND,
            KeyError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            KeyError::Collision => StatusCode::CONFLICT,
            KeyError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut response = HttpResponse::build(self.status_code());
        if let KeyError::QuotaExceeded { quota } = self {
            response
                .insert_header((super::QUOTA_LIMIT, quota.to_string()))
                .insert_header((super::QUOTA_REMAINING, "0"))
                .insert_header((header::RETRY_AFTER, seconds_until_reset().to_string()));
        }
        response.json(serde_json::json!({
            "error": self.kind(),
            "message": self.to_string()
        }))
    }
}
