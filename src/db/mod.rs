//! Database module for PostgreSQL connectivity
//!
//! Provides connection pool management, the per-document key registry and
//! the request usage log.

pub mod api_keys;
pub mod pool;
pub mod usage;

pub use api_keys::PostgresRegistryStore;
pub use pool::DbPool;
pub use usage::PostgresUsageLog;
