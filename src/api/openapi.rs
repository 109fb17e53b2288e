//! OpenAPI 3.0 specification definition

use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::api::handlers::{
    health::HealthResponse,
    keys::{
        CreateKeyRequest, DailyUsageInfo, ErrorResponse, IssuedKeyResponse, KeyActionResponse,
        KeyInfo, ListKeysResponse, MyKeyResponse, UpdateQuotaRequest,
    },
    predict::PredictResponse,
    usage::UsageSummaryResponse,
};

/// Registers the `X-API-Key` header scheme referenced by secured paths
struct ApiKeySecurity;

impl Modify for ApiKeySecurity {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "api_key",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("X-API-Key"))),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Keygate API",
        version = "1.0.0",
        description = "API key issuance, validation and daily quota enforcement in front of a prediction service",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "/", description = "Current server")
    ),
    tags(
        (name = "system", description = "System health and status endpoints"),
        (name = "predict", description = "Prediction endpoint"),
        (name = "keys", description = "API key management endpoints"),
        (name = "usage", description = "Request usage statistics")
    ),
    paths(
        crate::api::handlers::health::health_check,
        crate::api::handlers::predict::predict,
        crate::api::handlers::keys::create_api_key,
        crate::api::handlers::keys::list_keys,
        crate::api::handlers::keys::get_my_key,
        crate::api::handlers::keys::get_key_by_id,
        crate::api::handlers::keys::revoke_key,
        crate::api::handlers::keys::update_quota,
        crate::api::handlers::keys::regenerate_key,
        crate::api::handlers::keys::delete_key,
        crate::api::handlers::usage::get_usage_summary,
    ),
    components(
        schemas(
            // Health schemas
            HealthResponse,
            // Predict schemas
            PredictResponse,
            // Key schemas
            CreateKeyRequest,
            UpdateQuotaRequest,
            DailyUsageInfo,
            KeyInfo,
            IssuedKeyResponse,
            ListKeysResponse,
            MyKeyResponse,
            KeyActionResponse,
            ErrorResponse,
            // Usage schemas
            UsageSummaryResponse,
        )
    ),
    modifiers(&ApiKeySecurity)
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_lists_key_routes() {
        let spec = ApiDoc::openapi();
        assert!(spec.paths.paths.contains_key("/api/v1/keys/{id}/regenerate"));
        assert!(spec.paths.paths.contains_key("/health"));
        assert!(spec.paths.paths.contains_key("/api/v1/usage"));
        let components = spec.components.unwrap();
        assert!(components.security_schemes.contains_key("api_key"));
    }
}
