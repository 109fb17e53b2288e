//! API Key Authentication
//!
//! Reads the credential from the X-API-Key header or Authorization: Bearer token.
//! The validated key is stored in request extensions for downstream handlers.

use actix_web::{
    dev::ServiceRequest,
    http::header::{HeaderMap, AUTHORIZATION},
    HttpMessage,
};

pub use crate::keys::AuthenticatedKey;
use crate::keys::KeyError;

/// Header name for API key
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Extract API key from request headers
pub fn extract_api_key(req: &ServiceRequest) -> Option<String> {
    api_key_from_headers(req.headers())
}

fn api_key_from_headers(headers: &HeaderMap) -> Option<String> {
    // First try X-API-Key header
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        if !key.trim().is_empty() {
            return Some(key.trim().to_string());
        }
    }

    // Then try Authorization: Bearer <key>
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
}

/// Access to the authenticated key from request extensions
pub trait ApiKeyExt {
    fn api_key(&self) -> Option<AuthenticatedKey>;

    /// The authenticated key, or `MissingCredential` when the request did not
    /// pass through the auth middleware
    fn require_api_key(&self) -> Result<AuthenticatedKey, KeyError> {
        self.api_key().ok_or(KeyError::MissingCredential)
    }
}

impl<T: HttpMessage> ApiKeyExt for T {
    fn api_key(&self) -> Option<AuthenticatedKey> {
        self.extensions().get::<AuthenticatedKey>().cloned()
    }
}
