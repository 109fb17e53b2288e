//! Short-TTL read-through cache for fingerprint lookups
//!
//! Only the resolve step reads from it; quota consumption always goes to the
//! store. Revoked records are never cached, and admin mutations invalidate
//! the affected fingerprint.

use moka::future::Cache;
use std::time::Duration;
use tracing::trace;

use super::record::KeyRecord;

/// Records keyed by fingerprint
#[derive(Clone)]
pub struct KeyCache {
    records: Cache<String, KeyRecord>,
}

impl KeyCache {
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        Self {
            records: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Cache from settings; `None` when the TTL is zero
    pub fn from_ttl_secs(ttl_secs: u64, max_entries: u64) -> Option<Self> {
        (ttl_secs > 0).then(|| Self::new(Duration::from_secs(ttl_secs), max_entries))
    }

    pub async fn get(&self, fingerprint: &str) -> Option<KeyRecord> {
        let hit = self.records.get(fingerprint).await;
        trace!(hit = hit.is_some(), "Key cache lookup");
        hit
    }

    pub async fn insert(&self, record: &KeyRecord) {
        if record.revoked {
            self.records.invalidate(&record.fingerprint).await;
            return;
        }
        self.records
            .insert(record.fingerprint.clone(), record.clone())
            .await;
    }

    pub async fn invalidate(&self, fingerprint: &str) {
        self.records.invalidate(fingerprint).await;
    }
}
