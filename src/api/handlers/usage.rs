//! Usage Statistics Handlers
//!
//! Master-only summary of every authenticated request attempt.

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use utoipa::ToSchema;

use super::keys::{require_admin, ErrorResponse};
use crate::keys::lifecycle::store_failure;
use crate::keys::KeyError;
use crate::storage::{bounded, UsageSummary};
use crate::AppState;

/// Usage summary response
#[derive(Debug, Serialize, ToSchema)]
pub struct UsageSummaryResponse {
    pub total_requests: u64,
    /// Attempts on the current UTC day
    pub today_requests: u64,
    pub accepted_requests: u64,
    pub rejected_requests: u64,
    /// Attempts per key owner; `unknown` for credentials that never resolved
    pub by_owner: BTreeMap<String, u64>,
    pub by_endpoint: BTreeMap<String, u64>,
    /// `accepted` or the rejection's error kind
    pub by_outcome: BTreeMap<String, u64>,
}

impl From<UsageSummary> for UsageSummaryResponse {
    fn from(summary: UsageSummary) -> Self {
        Self {
            total_requests: summary.total_requests,
            today_requests: summary.today_requests,
            accepted_requests: summary.accepted_requests,
            rejected_requests: summary.rejected_requests,
            by_owner: summary.by_owner,
            by_endpoint: summary.by_endpoint,
            by_outcome: summary.by_outcome,
        }
    }
}

/// GET /api/v1/usage - Usage summary
#[utoipa::path(
    get,
    path = "/api/v1/usage",
    tag = "usage",
    responses(
        (status = 200, description = "Usage across all keys", body = UsageSummaryResponse),
        (status = 403, description = "Master key required", body = ErrorResponse),
        (status = 503, description = "Usage log unavailable", body = ErrorResponse)
    ),
    security(("api_key" = []))
)]
pub async fn get_usage_summary(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, KeyError> {
    require_admin(&req)?;

    let today = Utc::now().date_naive();
    let summary = bounded(state.settings.registry.timeout(), state.usage.summary(today))
        .await
        .map_err(|e| store_failure("usage_summary", e))?;

    Ok(HttpResponse::Ok().json(UsageSummaryResponse::from(summary)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::{app, app_state, call_json};
    use crate::keys::NewKey;
    use actix_web::{http::StatusCode, test};
    use std::time::Duration;

    #[actix_web::test]
    async fn test_usage_summary_is_master_only() {
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
                .uri("/api/v1/usage")
                .insert_header(("X-API-Key", issued.raw_key)),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "forbidden");
    }

    #[actix_web::test]
    async fn test_usage_summary_counts_attempts() {
        let state = app_state();
        let app = test::init_service(app(state.clone())).await;

        let (status, _) = call_json!(
            &app,
            test::TestRequest::get()
                .uri("/api/v1/keys/me")
                .insert_header(("X-API-Key", "not-a-key")),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // the middleware logs from a spawned task
        let mut logged = 0;
        for _ in 0..100 {
            logged = state.usage.summary(Utc::now().date_naive()).await.unwrap().total_requests;
            if logged >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(logged, 1);

        let (status, body) = call_json!(
            &app,
            test::TestRequest::get()
                .uri("/api/v1/usage")
                .insert_header(("X-API-Key", "master-secret")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rejected_requests"], 1);
        assert_eq!(body["by_outcome"]["invalid_credential"], 1);
        assert_eq!(body["by_owner"]["unknown"], 1);
    }
}
