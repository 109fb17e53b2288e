//! Health check endpoint

use actix_web::{web, HttpResponse};
use serde::Serialize;
use tracing::warn;
use utoipa::ToSchema;

use crate::storage::bounded;
use crate::AppState;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    /// `healthy`, or `degraded` when the registry cannot be reached
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    /// `blob` or `document`
    pub store_strategy: &'static str,
    pub store_reachable: bool,
    pub quota_consistency: &'static str,
}

/// GET /health - Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Key registry unreachable", body = HealthResponse)
    )
)]
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let store = state.keys.store();
    let strategy = store.strategy();

    let store_reachable = match bounded(state.settings.registry.timeout(), store.ping()).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Health check could not reach key registry");
            false
        }
    };

    let response = HealthResponse {
        status: if store_reachable { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        store_strategy: strategy.as_str(),
        store_reachable,
        quota_consistency: strategy.consistency(),
    };

    if store_reachable {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::ServiceUnavailable().json(response)
    }
}
