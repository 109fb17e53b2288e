//! Keygate
//!
//! API key issuance, validation and daily quota enforcement in front of a
//! prediction service, using Rust + Actix-Web.

use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_actix_web::TracingLogger;

mod api;
mod config;
mod db;
mod inference;
mod keys;
mod storage;

use crate::api::middleware::ApiMiddleware;
use crate::config::{RegistryBackend, Settings};
use crate::db::{DbPool, PostgresRegistryStore};
use crate::inference::InferenceClient;
use crate::keys::{AuthGate, KeyCache, KeyLifecycleManager};
use crate::db::PostgresUsageLog;
use crate::storage::{
    BlobRegistryStore, KeyRegistryStore, MemoryDocumentStore, MemoryUsageLog, R2Client,
    R2Settings, UsageLog,
};

/// Application state shared across all handlers
pub struct AppState {
    pub settings: Settings,
    pub keys: Arc<KeyLifecycleManager>,
    pub gate: Arc<AuthGate>,
    pub usage: Arc<dyn UsageLog>,
    pub inference: Option<InferenceClient>,
    pub started_at: Instant,
}

/// Build the key registry selected in configuration, with its usage log
async fn build_registry(
    settings: &Settings,
) -> anyhow::Result<(Arc<dyn KeyRegistryStore>, Arc<dyn UsageLog>)> {
    let (store, usage): (Arc<dyn KeyRegistryStore>, Arc<dyn UsageLog>) = match settings.registry.backend {
        RegistryBackend::Blob => {
            let r2 = R2Settings::from_url(&settings.r2.url).context("Invalid r2.url")?;
            let client = R2Client::new(&r2);
            info!(bucket = %client.bucket(), object_key = %settings.registry.object_key, "Using R2 key registry");
            info!("Usage log kept in process memory");
            (
                Arc::new(BlobRegistryStore::new(client, settings.registry.object_key.clone())),
                Arc::new(MemoryUsageLog::new()),
            )
        }
        RegistryBackend::Document => {
            let pool = DbPool::new(&settings.database.url, settings.database.max_connections)
                .context("Failed to create database pool")?;
            pool.ensure_schema()
                .await
                .context("Failed to prepare key registry schema")?;
            (
                Arc::new(PostgresRegistryStore::new(pool.clone())),
                Arc::new(PostgresUsageLog::new(pool)),
            )
        }
        RegistryBackend::Memory => {
            warn!("Using in-memory key registry; keys are lost on restart");
            (Arc::new(MemoryDocumentStore::new()), Arc::new(MemoryUsageLog::new()))
        }
    };

    let strategy = store.strategy();
    info!(
        strategy = strategy.as_str(),
        consistency = strategy.consistency(),
        "Key registry ready"
    );
    Ok((store, usage))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing subscriber for structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("keygate=info,actix_web=info")),
        )
        .json()
        .init();

    // Load configuration
    let settings = Settings::load().context("Failed to load configuration")?;
    let bind_addr = format!("{}:{}", settings.server.host, settings.server.port);

    info!(
        "Starting Keygate v{} on {}",
        env!("CARGO_PKG_VERSION"),
        bind_addr
    );

    let (store, usage) = build_registry(&settings).await?;
    let timeout = settings.registry.timeout();
    let cache = KeyCache::from_ttl_secs(settings.auth.cache_ttl_secs, settings.auth.cache_max_entries);
    if cache.is_none() {
        info!("Key cache disabled");
    }

    let master_key = settings.auth.master_key();
    if master_key.is_none() {
        warn!("No master key configured; admin endpoints are unreachable");
    }

    let keys = Arc::new(KeyLifecycleManager::new(
        store.clone(),
        cache.clone(),
        settings.auth.default_quota_per_day,
        timeout,
    ));
    let gate = Arc::new(AuthGate::new(store, cache, master_key, timeout));

    let inference = if settings.inference.url.trim().is_empty() {
        info!("No inference URL configured, /api/v1/predict will return 503");
        None
    } else {
        let client = InferenceClient::new(
            &settings.inference.url,
            Duration::from_secs(settings.inference.timeout_secs),
        )
        .context("Invalid inference configuration")?;
        info!(url = %client.predict_url(), "Inference client configured");
        Some(client)
    };

    let workers = settings.server.workers.unwrap_or_else(|| num_cpus::get() * 2);

    // Create shared application state
    let app_state = web::Data::new(AppState {
        settings,
        keys,
        gate: gate.clone(),
        usage: usage.clone(),
        inference,
        started_at: Instant::now(),
    });

    // Configure and start HTTP server
    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            // API middleware for auth and daily quotas
            .wrap(ApiMiddleware::new(gate.clone(), usage.clone()))
            // Middleware (order matters - these wrap around ApiMiddleware)
            .wrap(TracingLogger::default())
            .wrap(middleware::Compress::default())
            .wrap(
                middleware::DefaultHeaders::new()
                    .add(("X-Service", "keygate"))
                    .add(("X-Version", env!("CARGO_PKG_VERSION")))
            )
            // Routes
            .configure(api::configure_routes)
    })
    .workers(workers) // 2 workers per CPU for async I/O by default
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {}", bind_addr))?
    .run()
    .await
    .context("HTTP server failed")
}
