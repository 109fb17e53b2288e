//! API Middleware Module
//!
//! Provides API key authentication, daily quota enforcement and usage
//! headers for the keygate API.

pub mod auth;
pub mod service;
pub mod usage;

pub use auth::{ApiKeyExt, AuthenticatedKey};
pub use service::ApiMiddleware;
pub use usage::UsageInfo;
