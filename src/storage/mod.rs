//! Key registry storage
//!
//! Every backing strategy implements [`KeyRegistryStore`]:
//!
//! - **blob**: the whole registry is one JSON array in an object store (R2/S3).
//!   Mutations are load-modify-save with no locking, so concurrent writers
//!   can lose updates (last writer wins).
//! - **document**: one document per key with atomic single-document updates
//!   and server-side conditional counters (PostgreSQL, or in memory for
//!   development). Daily quotas hold exactly under concurrency.

mod blob;
mod memory;
mod r2;
mod usage;

pub use blob::{BlobRegistryStore, BlobStore, DEFAULT_OBJECT_KEY};
#[cfg(test)]
pub use memory::MemoryBlobStore;
pub use memory::MemoryDocumentStore;
pub use r2::{R2Client, R2Settings};
pub use usage::{
    MemoryUsageLog, UsageLog, UsageLogEntry, UsageSummary, OUTCOME_ACCEPTED, UNKNOWN_OWNER,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::keys::record::{KeyId, KeyRecord};

/// Errors raised by registry stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Registry store unavailable: {0}")]
    Unavailable(String),

    #[error("Registry store timed out after {0:?}")]
    Timeout(Duration),

    #[error("Registry document is corrupt: {0}")]
    Corrupt(String),

    #[error("Fingerprint already belongs to an active key")]
    Collision,

    #[error("Store configuration error: {0}")]
    Config(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Backing strategy of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStrategy {
    Blob,
    Document,
}

impl StoreStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreStrategy::Blob => "blob",
            StoreStrategy::Document => "document",
        }
    }

    /// Consistency guarantee of daily quota counters under this strategy
    pub fn consistency(&self) -> &'static str {
        match self {
            StoreStrategy::Blob => {
                "last-writer-wins: concurrent requests on one key may lose usage updates and over-admit"
            }
            StoreStrategy::Document => {
                "atomic per-key counters: daily quotas are exact under concurrency"
            }
        }
    }
}

/// Single-record mutation applied by admin operations
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPatch {
    /// Revoke the key; a key that is already revoked keeps its `revoked_at`
    Revoke { at: DateTime<Utc> },
    SetQuota(u32),
    SetFingerprint(String),
}

impl KeyPatch {
    pub fn apply(&self, record: &mut KeyRecord) {
        match self {
            KeyPatch::Revoke { at } => record.revoke(*at),
            KeyPatch::SetQuota(quota) => record.quota_per_day = *quota,
            KeyPatch::SetFingerprint(fingerprint) => record.fingerprint = fingerprint.clone(),
        }
    }

    /// Whether applying this patch to `target` would give an active
    /// fingerprint to two records
    pub(crate) fn collides(&self, target: &KeyRecord, records: &[KeyRecord]) -> bool {
        match self {
            KeyPatch::SetFingerprint(fingerprint) if !target.revoked => records
                .iter()
                .any(|r| r.id != target.id && !r.revoked && &r.fingerprint == fingerprint),
            _ => false,
        }
    }
}

/// A record before and after a patch
#[derive(Debug, Clone)]
pub struct PatchedKey {
    pub before: KeyRecord,
    pub after: KeyRecord,
}

/// Result of charging one request against a key's daily quota
#[derive(Debug, Clone)]
pub enum UsageOutcome {
    /// Request admitted; the record reflects the incremented counter
    Recorded(KeyRecord),
    /// Today's quota is used up; nothing was written
    Exhausted(KeyRecord),
    /// The key was revoked by the time usage was charged
    Revoked(KeyRecord),
    /// No record with that id exists any more
    Missing,
}

/// Storage contract for the key registry
#[async_trait]
pub trait KeyRegistryStore: Send + Sync {
    /// Backing strategy, and with it the consistency guarantee
    fn strategy(&self) -> StoreStrategy;

    /// Every record, in creation order
    async fn load_all(&self) -> StoreResult<Vec<KeyRecord>>;

    /// Record for a fingerprint: the first active match, else the first revoked one
    async fn find_by_fingerprint(&self, fingerprint: &str) -> StoreResult<Option<KeyRecord>>;

    async fn find_by_id(&self, id: &KeyId) -> StoreResult<Option<KeyRecord>>;

    /// Add a record. Fails with `Collision` when an active record already
    /// holds its fingerprint.
    async fn insert(&self, record: KeyRecord) -> StoreResult<()>;

    /// Apply a patch to one record; `None` when it does not exist
    async fn update(&self, id: &KeyId, patch: KeyPatch) -> StoreResult<Option<PatchedKey>>;

    /// Charge one request to the key's quota slot for `now`'s UTC day
    async fn consume_quota(&self, id: &KeyId, now: DateTime<Utc>) -> StoreResult<UsageOutcome>;

    /// Remove a record permanently
    async fn delete(&self, id: &KeyId) -> StoreResult<bool>;

    /// Cheap reachability check
    async fn ping(&self) -> StoreResult<()>;
}

/// Run a store call with an upper bound on its duration
pub async fn bounded<T, F>(limit: Duration, call: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
