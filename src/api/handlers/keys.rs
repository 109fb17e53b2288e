//! API Key Management Handlers
//!
//! Endpoints for issuing, listing and managing API keys.
//! Everything except `/keys/me` requires the master key.

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

use crate::api::middleware::{ApiKeyExt, AuthenticatedKey, UsageInfo};
use crate::keys::{IssuedKey, KeyError, KeyId, KeyRecord, NewKey};
use crate::AppState;

/// Request to create a new API key
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateKeyRequest {
    pub owner_name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Defaults to the configured daily quota
    #[serde(default)]
    pub quota_per_day: Option<u32>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Request to change a key's daily quota
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateQuotaRequest {
    pub quota_per_day: u32,
}

/// Counter for one UTC day
#[derive(Debug, Serialize, ToSchema)]
pub struct DailyUsageInfo {
    pub count: u32,
    pub last_used: Option<DateTime<Utc>>,
}

/// API key info (without the fingerprint)
#[derive(Debug, Serialize, ToSchema)]
pub struct KeyInfo {
    pub id: String,
    pub owner_name: String,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub permissions: Vec<String>,
    pub quota_per_day: u32,
    /// Usage per UTC day, keyed `YYYY-MM-DD`
    pub daily_usage: BTreeMap<String, DailyUsageInfo>,
    /// Stored verbatim
    pub expires_at: Option<String>,
}

impl From<KeyRecord> for KeyInfo {
    fn from(record: KeyRecord) -> Self {
        Self {
            id: record.id.to_string(),
            owner_name: record.owner_name,
            created_at: record.created_at,
            revoked: record.revoked,
            revoked_at: record.revoked_at,
            last_used_at: record.last_used_at,
            permissions: record.permissions,
            quota_per_day: record.quota_per_day,
            daily_usage: record
                .daily_usage
                .into_iter()
                .map(|(day, usage)| {
                    (
                        day.format("%Y-%m-%d").to_string(),
                        DailyUsageInfo {
                            count: usage.count,
                            last_used: usage.last_used,
                        },
                    )
                })
                .collect(),
            expires_at: record.expires_at.map(|e| e.as_str().to_string()),
        }
    }
}

/// Response after issuing or regenerating a key
#[derive(Debug, Serialize, ToSchema)]
pub struct IssuedKeyResponse {
    #[serde(flatten)]
    pub key: KeyInfo,
    /// Raw credential, shown only in this response
    pub api_key: String,
    pub message: String,
}

impl IssuedKeyResponse {
    fn new(issued: IssuedKey, message: &str) -> Self {
        Self {
            key: issued.record.into(),
            api_key: issued.raw_key,
            message: message.to_string(),
        }
    }
}

/// List of API keys response
#[derive(Debug, Serialize, ToSchema)]
pub struct ListKeysResponse {
    pub keys: Vec<KeyInfo>,
    pub count: usize,
}

/// Caller's own key with today's usage; the usage fields are omitted for
/// the master key
#[derive(Debug, Serialize, ToSchema)]
pub struct MyKeyResponse {
    #[serde(flatten)]
    pub key: KeyInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_today: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_today: Option<u32>,
}

/// Result of revoke and delete
#[derive(Debug, Serialize, ToSchema)]
pub struct KeyActionResponse {
    pub success: bool,
    pub key_id: String,
}

/// Error body shared by all endpoints
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Stable error kind, e.g. `quota_exceeded`
    pub error: String,
    pub message: String,
}

/// Only the master key may manage keys
pub(crate) fn require_admin(req: &HttpRequest) -> Result<AuthenticatedKey, KeyError> {
    let auth = req.require_api_key()?;
    if !auth.privileged {
        tracing::warn!(key_id = %auth.record.id, path = %req.path(), "Admin endpoint refused");
        return Err(KeyError::Forbidden);
    }
    Ok(auth)
}

/// POST /api/v1/keys - Issue a new API key
#[utoipa::path(
    post,
    path = "/api/v1/keys",
    tag = "keys",
    request_body = CreateKeyRequest,
    responses(
        (status = 201, description = "Key issued", body = IssuedKeyResponse),
        (status = 400, description = "Invalid owner or quota", body = ErrorResponse),
        (status = 403, description = "Master key required", body = ErrorResponse),
        (status = 503, description = "Registry unavailable", body = ErrorResponse)
    ),
    security(("api_key" = []))
)]
pub async fn create_api_key(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateKeyRequest>,
) -> Result<HttpResponse, KeyError> {
    require_admin(&req)?;
    let body = body.into_inner();

    let issued = state
        .keys
        .create(NewKey {
            owner_name: body.owner_name,
            permissions: body.permissions,
            quota_per_day: body.quota_per_day,
            expires_at: body.expires_at,
        })
        .await?;

    Ok(HttpResponse::Created().json(IssuedKeyResponse::new(
        issued,
        "API key created successfully. Save the api_key value - it won't be shown again!",
    )))
}

/// GET /api/v1/keys - List all API keys
#[utoipa::path(
    get,
    path = "/api/v1/keys",
    tag = "keys",
    responses(
        (status = 200, description = "All keys in creation order", body = ListKeysResponse),
        (status = 403, description = "Master key required", body = ErrorResponse)
    ),
    security(("api_key" = []))
)]
pub async fn list_keys(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, KeyError> {
    require_admin(&req)?;
    let keys: Vec<KeyInfo> = state.keys.list().await?.into_iter().map(KeyInfo::from).collect();
    let count = keys.len();
    Ok(HttpResponse::Ok().json(ListKeysResponse { keys, count }))
}

/// GET /api/v1/keys/me - Current API key info
#[utoipa::path(
    get,
    path = "/api/v1/keys/me",
    tag = "keys",
    responses(
        (status = 200, description = "The caller's key", body = MyKeyResponse),
        (status = 401, description = "No API key", body = ErrorResponse)
    ),
    security(("api_key" = []))
)]
pub async fn get_my_key(req: HttpRequest) -> Result<HttpResponse, KeyError> {
    let auth = req.require_api_key()?;
    let usage = UsageInfo::for_key(&auth, Utc::now());

    Ok(HttpResponse::Ok().json(MyKeyResponse {
        used_today: usage.as_ref().map(|u| u.used_today),
        remaining_today: usage.as_ref().map(|u| u.remaining_today),
        key: auth.record.into(),
    }))
}

/// GET /api/v1/keys/{id} - Get API key by ID
#[utoipa::path(
    get,
    path = "/api/v1/keys/{id}",
    tag = "keys",
    params(("id" = String, Path, description = "Key id")),
    responses(
        (status = 200, description = "Key found", body = KeyInfo),
        (status = 404, description = "Key not found", body = ErrorResponse)
    ),
    security(("api_key" = []))
)]
pub async fn get_key_by_id(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, KeyError> {
    require_admin(&req)?;
    let id = KeyId::from(path.into_inner());
    let record = state.keys.get(&id).await?;
    Ok(HttpResponse::Ok().json(KeyInfo::from(record)))
}

/// POST /api/v1/keys/{id}/revoke - Revoke an API key
#[utoipa::path(
    post,
    path = "/api/v1/keys/{id}/revoke",
    tag = "keys",
    params(("id" = String, Path, description = "Key id")),
    responses(
        (status = 200, description = "Key revoked (idempotent)", body = KeyActionResponse),
        (status = 404, description = "Key not found", body = ErrorResponse)
    ),
    security(("api_key" = []))
)]
pub async fn revoke_key(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, KeyError> {
    require_admin(&req)?;
    let id = KeyId::from(path.into_inner());
    let record = state.keys.revoke(&id).await?;
    Ok(HttpResponse::Ok().json(KeyActionResponse {
        success: record.revoked,
        key_id: record.id.to_string(),
    }))
}

/// PATCH /api/v1/keys/{id}/quota - Change the daily quota
#[utoipa::path(
    patch,
    path = "/api/v1/keys/{id}/quota",
    tag = "keys",
    params(("id" = String, Path, description = "Key id")),
    request_body = UpdateQuotaRequest,
    responses(
        (status = 200, description = "Quota updated", body = KeyInfo),
        (status = 400, description = "Quota must be at least 1", body = ErrorResponse),
        (status = 404, description = "Key not found", body = ErrorResponse)
    ),
    security(("api_key" = []))
)]
pub async fn update_quota(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<UpdateQuotaRequest>,
) -> Result<HttpResponse, KeyError> {
    require_admin(&req)?;
    let id = KeyId::from(path.into_inner());
    let record = state.keys.update_quota(&id, body.quota_per_day).await?;
    Ok(HttpResponse::Ok().json(KeyInfo::from(record)))
}

/// POST /api/v1/keys/{id}/regenerate - Issue a new credential for a key
#[utoipa::path(
    post,
    path = "/api/v1/keys/{id}/regenerate",
    tag = "keys",
    params(("id" = String, Path, description = "Key id")),
    responses(
        (status = 200, description = "New credential issued", body = IssuedKeyResponse),
        (status = 400, description = "Key is revoked", body = ErrorResponse),
        (status = 404, description = "Key not found", body = ErrorResponse)
    ),
    security(("api_key" = []))
)]
pub async fn regenerate_key(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, KeyError> {
    require_admin(&req)?;
    let id = KeyId::from(path.into_inner());
    let issued = state.keys.regenerate(&id).await?;
    Ok(HttpResponse::Ok().json(IssuedKeyResponse::new(
        issued,
        "API key regenerated. The previous key no longer works.",
    )))
}

/// DELETE /api/v1/keys/{id} - Permanently delete an API key
#[utoipa::path(
    delete,
    path = "/api/v1/keys/{id}",
    tag = "keys",
    params(("id" = String, Path, description = "Key id")),
    responses(
        (status = 200, description = "Key deleted", body = KeyActionResponse),
        (status = 404, description = "Key not found", body = ErrorResponse)
    ),
    security(("api_key" = []))
)]
pub async fn delete_key(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, KeyError> {
    require_admin(&req)?;
    let id = KeyId::from(path.into_inner());
    state.keys.delete(&id).await?;
    Ok(HttpResponse::Ok().json(KeyActionResponse {
        success: true,
        key_id: id.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::{app, app_state, call_json};
    use actix_web::{http::StatusCode, test};

    #[actix_web::test]
    async fn test_admin_key_management_flow() {
        let state = app_state();
        let app = test::init_service(app(state.clone())).await;

        let (status, created) = call_json!(
            &app,
            test::TestRequest::post()
                .uri("/api/v1/keys")
                .insert_header(("X-API-Key", "master-secret"))
                .set_json(serde_json::json!({"owner_name": "AcmeCo", "quota_per_day": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["owner_name"], "AcmeCo");
        assert_eq!(created["quota_per_day"], 2);
        assert!(created.get("fingerprint").is_none());
        let raw = created["api_key"].as_str().unwrap().to_string();
        let id = created["id"].as_str().unwrap().to_string();

        let (status, me) = call_json!(
            &app,
            test::TestRequest::get()
                .uri("/api/v1/keys/me")
                .insert_header(("X-API-Key", raw.clone())),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["used_today"], 1);
        assert_eq!(me["remaining_today"], 1);

        let (status, listed) = call_json!(
            &app,
            test::TestRequest::get()
                .uri("/api/v1/keys")
                .insert_header(("X-API-Key", "master-secret")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["count"], 1);

        let (status, patched) = call_json!(
            &app,
            test::TestRequest::patch()
                .uri(&format!("/api/v1/keys/{}/quota", id))
                .insert_header(("X-API-Key", "master-secret"))
                .set_json(serde_json::json!({"quota_per_day": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(patched["error"], "invalid_argument");

        let (status, revoked) = call_json!(
            &app,
            test::TestRequest::post()
                .uri(&format!("/api/v1/keys/{}/revoke", id))
                .insert_header(("X-API-Key", "master-secret")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(revoked["success"], true);

        let (status, rejected) = call_json!(
            &app,
            test::TestRequest::get()
                .uri("/api/v1/keys/me")
                .insert_header(("X-API-Key", raw)),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(rejected["error"], "revoked_credential");

        let (status, _) = call_json!(
            &app,
            test::TestRequest::delete()
                .uri(&format!("/api/v1/keys/{}", id))
                .insert_header(("X-API-Key", "master-secret")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, missing) = call_json!(
            &app,
            test::TestRequest::get()
                .uri(&format!("/api/v1/keys/{}", id))
                .insert_header(("X-API-Key", "master-secret")),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(missing["error"], "not_found");
    }

    #[actix_web::test]
    async fn test_malformed_bodies_are_invalid_arguments() {
        let state = app_state();
        let app = test::init_service(app(state.clone())).await;

        let bodies = [
            serde_json::json!({"owner_name": "AcmeCo", "quota_per_day": -1}),
            serde_json::json!({"quota_per_day": 5}),
            serde_json::json!({"owner_name": "AcmeCo", "expires_at": "next tuesday"}),
        ];
        for body in bodies {
            let (status, json) = call_json!(
                &app,
                test::TestRequest::post()
                    .uri("/api/v1/keys")
                    .insert_header(("X-API-Key", "master-secret"))
                    .set_json(body.clone()),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
            assert_eq!(json["error"], "invalid_argument", "{}", body);
            assert!(json["message"].is_string());
        }

        let issued = state
            .keys
            .create(NewKey {
                owner_name: "AcmeCo".to_string(),
                permissions: vec![],
                quota_per_day: None,
                expires_at: None,
            })
            .await
            .unwrap();
        let (status, json) = call_json!(
            &app,
            test::TestRequest::patch()
                .uri(&format!("/api/v1/keys/{}/quota", issued.record.id))
                .insert_header(("X-API-Key", "master-secret"))
                .set_json(serde_json::json!({"quota_per_day": -1})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid_argument");
        assert_eq!(state.keys.get(&issued.record.id).await.unwrap().quota_per_day, 50);
    }

    #[actix_web::test]
    async fn test_master_key_me_has_no_usage() {
        let app = test::init_service(app(app_state())).await;
        let (status, me) = call_json!(
            &app,
            test::TestRequest::get()
                .uri("/api/v1/keys/me")
                .insert_header(("X-API-Key", "master-secret")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["owner_name"], "admin");
        assert!(me.get("used_today").is_none());
        assert!(me.get("remaining_today").is_none());
    }

    #[actix_web::test]
    async fn test_regular_keys_cannot_manage_keys() {
        let state = app_state();
        let issued = state
            .keys
            .create(NewKey {
                owner_name: "AcmeCo".to_string(),
                permissions: vec![],
                quota_per_day: None,
                expires_at: None,
            })
            .await
            .unwrap();
        let app = test::init_service(app(state)).await;

        let (status, body) = call_json!(
            &app,
            test::TestRequest::get()
                .uri("/api/v1/keys")
                .insert_header(("X-API-Key", issued.raw_key.clone())),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "forbidden");

        let (status, _) = call_json!(
            &app,
            test::TestRequest::post()
                .uri(&format!("/api/v1/keys/{}/regenerate", issued.record.id))
                .insert_header(("X-API-Key", issued.raw_key)),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn test_regenerate_returns_new_credential() {
        let state = app_state();
        let issued = state
            .keys
            .create(NewKey {
                owner_name: "AcmeCo".to_string(),
                permissions: vec![],
                quota_per_day: None,
                expires_at: None,
            })
            .await
            .unwrap();
        let app = test::init_service(app(state)).await;

        let (status, body) = call_json!(
            &app,
            test::TestRequest::post()
                .uri(&format!("/api/v1/keys/{}/regenerate", issued.record.id))
                .insert_header(("X-API-Key", "master-secret")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let fresh = body["api_key"].as_str().unwrap().to_string();
        assert_ne!(fresh, issued.raw_key);

        let (status, _) = call_json!(
            &app,
            test::TestRequest::get()
                .uri("/api/v1/keys/me")
                .insert_header(("X-API-Key", issued.raw_key)),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call_json!(
            &app,
            test::TestRequest::get()
                .uri("/api/v1/keys/me")
                .insert_header(("X-API-Key", fresh)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
}
