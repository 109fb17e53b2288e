//! API key lifecycle and daily quota engine
//!
//! - [`codec`]: credential generation and fingerprints
//! - [`record`]: the registry record and its serialized layout
//! - [`quota`]: per-day quota decisions on a record
//! - [`lifecycle`]: administrative operations
//! - [`gate`]: request-time validation

pub mod cache;
pub mod codec;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod quota;
pub mod record;

pub use cache::KeyCache;
pub use error::KeyError;
pub use gate::{AuthGate, AuthenticatedKey};
pub use lifecycle::{IssuedKey, KeyLifecycleManager, NewKey};
pub use quota::QuotaTracker;
pub use record::{KeyId, KeyRecord};

/// Response headers describing the caller's daily quota
pub const QUOTA_LIMIT: &str = "X-Quota-Limit";
pub const QUOTA_USED: &str = "X-Quota-Used";
pub const QUOTA_REMAINING: &str = "X-Quota-Remaining";
