//! API Middleware Service
//!
//! Actix-web middleware that validates the API key, charges the daily quota
//! and reports usage headers, wrapped around every non-public route. Every
//! attempt, accepted or rejected, is appended to the usage log.

use actix_web::{
    body::{BoxBody, EitherBody},
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage, ResponseError,
};
use chrono::Utc;
use futures::future::{ok, LocalBoxFuture, Ready};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use super::auth::extract_api_key;
use super::usage::{extract_client_ip, extract_user_agent, UsageInfo};
use crate::keys::AuthGate;
use crate::storage::{UsageLog, UsageLogEntry, OUTCOME_ACCEPTED};

/// Middleware factory for API authentication and quota enforcement
pub struct ApiMiddleware {
    gate: Arc<AuthGate>,
    usage: Arc<dyn UsageLog>,
    /// Paths that don't require authentication
    public_paths: Vec<String>,
}

impl ApiMiddleware {
    pub fn new(gate: Arc<AuthGate>, usage: Arc<dyn UsageLog>) -> Self {
        Self {
            gate,
            usage,
            public_paths: vec![
                "/health".to_string(),
                "/swagger-ui".to_string(),
                "/api-docs".to_string(),
            ],
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for ApiMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B, BoxBody>>;
    type Error = Error;
    type Transform = ApiMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(ApiMiddlewareService {
            service: Rc::new(service),
            gate: self.gate.clone(),
            usage: self.usage.clone(),
            public_paths: self.public_paths.clone(),
        })
    }
}

/// The actual middleware service
pub struct ApiMiddlewareService<S> {
    service: Rc<S>,
    gate: Arc<AuthGate>,
    usage: Arc<dyn UsageLog>,
    public_paths: Vec<String>,
}

impl<S> ApiMiddlewareService<S> {
    fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| path.starts_with(p))
    }
}

/// Append an attempt to the usage log without holding up the response
fn record_usage(usage: Arc<dyn UsageLog>, entry: UsageLogEntry) {
    tokio::spawn(async move {
        let endpoint = entry.endpoint.clone();
        if let Err(e) = usage.record(entry).await {
            warn!(error = %e, endpoint = %endpoint, "Failed to log usage");
        }
    });
}

impl<S, B> Service<ServiceRequest> for ApiMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B, BoxBody>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, ctx: &mut core::task::Context<'_>) -> core::task::Poll<Result<(), Self::Error>> {
        self.service.poll_ready(ctx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let gate = self.gate.clone();
        let usage = self.usage.clone();
        let path = req.path().to_string();
        let method = req.method().to_string();
        let is_public = self.is_public_path(&path);

        Box::pin(async move {
            let start = Instant::now();

            // Skip auth for public paths
            if is_public {
                let res = service.call(req).await?;
                return Ok(res.map_into_left_body());
            }

            let ip_address = extract_client_ip(&req).map(|ip| ip.to_string());
            let user_agent = extract_user_agent(&req);
            let mut entry = UsageLogEntry {
                key_id: None,
                owner_name: None,
                endpoint: path.clone(),
                method: method.clone(),
                status_code: 0,
                outcome: OUTCOME_ACCEPTED.to_string(),
                response_time_ms: 0,
                ip_address,
                user_agent,
                timestamp: Utc::now(),
            };

            let api_key = extract_api_key(&req);
            let auth = match gate.validate_with_context(api_key.as_deref()).await {
                Ok(auth) => auth,
                Err(rejection) => {
                    let e = rejection.error;
                    info!(
                        method = %method,
                        path = %path,
                        status = e.status_code().as_u16(),
                        error = e.kind(),
                        retryable = e.is_retryable(),
                        "Request rejected"
                    );
                    let response = e.error_response();
                    entry.key_id = rejection.key_id;
                    entry.owner_name = rejection.owner_name;
                    entry.status_code = response.status().as_u16();
                    entry.outcome = e.kind().to_string();
                    entry.response_time_ms = start.elapsed().as_millis() as u64;
                    record_usage(usage, entry);
                    return Ok(req.into_response(response).map_into_right_body());
                }
            };

            let usage_info = UsageInfo::for_key(&auth, Utc::now());
            let key_id = auth.record.id.clone();
            let owner = auth.record.owner_name.clone();
            entry.key_id = Some(key_id.clone());
            entry.owner_name = Some(owner.clone());

            // Store auth info in request extensions
            req.extensions_mut().insert(auth);

            // Call the actual service
            let res = service.call(req).await?;

            entry.status_code = res.status().as_u16();
            entry.response_time_ms = start.elapsed().as_millis() as u64;
            info!(
                key_id = %key_id,
                owner = %owner,
                method = %method,
                path = %path,
                status = entry.status_code,
                response_time_ms = entry.response_time_ms,
                ip = entry.ip_address.as_deref().unwrap_or("-"),
                user_agent = entry.user_agent.as_deref().unwrap_or("-"),
                "Request served"
            );
            record_usage(usage, entry);

            // Add quota headers to response
            let mut res = res.map_into_left_body();
            if let Some(usage_info) = usage_info {
                usage_info.apply(res.headers_mut());
            }

            Ok(res)
        })
    }
}
