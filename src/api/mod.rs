//! API module - HTTP routes and handlers

pub mod handlers;
pub mod middleware;
pub mod openapi;

use actix_web::web;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::openapi::ApiDoc;
use crate::keys::KeyError;

/// Malformed or out-of-range JSON bodies get the same error shape as every
/// other failure
fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .error_handler(|err, _req| KeyError::InvalidArgument(err.to_string()).into())
}

/// Configure all API routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config());
    cfg.service(
        web::scope("/api/v1")
            .route("/predict", web::post().to(handlers::predict::predict))
            .route("/usage", web::get().to(handlers::usage::get_usage_summary))
            // API key management endpoints
            .service(
                web::scope("/keys")
                    // More specific routes first
                    .route("/me", web::get().to(handlers::keys::get_my_key))
                    .route("", web::post().to(handlers::keys::create_api_key))
                    .route("", web::get().to(handlers::keys::list_keys))
                    .route("/{id}", web::get().to(handlers::keys::get_key_by_id))
                    .route("/{id}", web::delete().to(handlers::keys::delete_key))
                    .route("/{id}/revoke", web::post().to(handlers::keys::revoke_key))
                    .route("/{id}/quota", web::patch().to(handlers::keys::update_quota))
                    .route("/{id}/regenerate", web::post().to(handlers::keys::regenerate_key))
            )
    )
    .route("/health", web::get().to(handlers::health::health_check))
    // Swagger UI and OpenAPI spec
    .service(
        SwaggerUi::new("/swagger-ui/{_:.*}")
            .url("/api-docs/openapi.json", ApiDoc::openapi())
    );
}

#[cfg(test)]
pub(crate) mod test_support {
    use actix_web::{
        body::MessageBody,
        dev::{ServiceFactory, ServiceRequest, ServiceResponse},
        http::StatusCode,
        web, App, Error,
    };
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::middleware::ApiMiddleware;
    use crate::config::Settings;
    use crate::keys::{AuthGate, KeyLifecycleManager};
    use crate::storage::{KeyRegistryStore, MemoryDocumentStore, MemoryUsageLog};
    use crate::AppState;

    /// State over an in-memory document store with a master key and no
    /// inference service
    pub fn app_state() -> web::Data<AppState> {
        let settings = Settings::default();
        let store: Arc<dyn KeyRegistryStore> = Arc::new(MemoryDocumentStore::new());
        let timeout = Duration::from_secs(5);

        web::Data::new(AppState {
            keys: Arc::new(KeyLifecycleManager::new(store.clone(), None, 50, timeout)),
            gate: Arc::new(AuthGate::new(store, None, Some("master-secret".to_string()), timeout)),
            usage: Arc::new(MemoryUsageLog::new()),
            inference: None,
            started_at: Instant::now(),
            settings,
        })
    }

    pub fn app(
        state: web::Data<AppState>,
    ) -> App<
        impl ServiceFactory<
            ServiceRequest,
            Config = (),
            Response = ServiceResponse<impl MessageBody>,
            Error = Error,
            InitError = (),
        >,
    > {
        App::new()
            .app_data(state.clone())
            .wrap(ApiMiddleware::new(state.gate.clone(), state.usage.clone()))
            .configure(super::configure_routes)
    }

    pub async fn into_json<B: MessageBody>(res: ServiceResponse<B>) -> (StatusCode, serde_json::Value) {
        let status = res.status();
        let body = actix_web::test::read_body(res).await;
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    /// Send a `TestRequest` and decode the JSON response
    macro_rules! call_json {
        ($app:expr, $req:expr $(,)?) => {
            $crate::api::test_support::into_json(
                actix_web::test::call_service($app, $req.to_request()).await,
            )
        };
    }
    pub(crate) use call_json;
}
