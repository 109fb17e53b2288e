//! In-process stores for development and tests
//!
//! - `MemoryBlobStore` (tests only): a blob store backed by a map, with
//!   optional simulated latency and outage so the blob strategy behaves like
//!   a remote object store.
//! - [`MemoryDocumentStore`]: the document strategy in memory. Each record
//!   is updated under its own map entry lock, which makes quota consumption
//!   atomic per key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::{
    KeyPatch, KeyRegistryStore, PatchedKey, StoreError, StoreResult, StoreStrategy,
    UsageOutcome,
};
use crate::keys::quota::QuotaTracker;
use crate::keys::record::{resolve_fingerprint, KeyId, KeyRecord};

async fn simulate_latency(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}


#[cfg(test)]
pub use blob_double::MemoryBlobStore;

struct Slot {
    seq: u64,
    record: KeyRecord,
}

/// Per-document registry held in process memory
#[derive(Default)]
pub struct MemoryDocumentStore {
    records: DashMap<KeyId, Slot>,
    next_seq: AtomicU64,
    // Serialises writes that must keep active fingerprints unique
    fingerprint_guard: Mutex<()>,
    latency: Duration,
    unavailable: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    #[cfg(test)]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    async fn enter(&self) -> StoreResult<()> {
        simulate_latency(self.latency).await;
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory document store offline".to_string()));
        }
        Ok(())
    }

    fn ordered(&self) -> Vec<KeyRecord> {
        let mut slots: Vec<(u64, KeyRecord)> = self
            .records
            .iter()
            .map(|entry| (entry.seq, entry.record.clone()))
            .collect();
        slots.sort_by_key(|(seq, _)| *seq);
        slots.into_iter().map(|(_, record)| record).collect()
    }

    fn fingerprint_taken(&self, fingerprint: &str, except: Option<&KeyId>) -> bool {
        self.records.iter().any(|entry| {
            let r = &entry.record;
            !r.revoked && r.fingerprint == fingerprint && Some(&r.id) != except
        })
    }
}

#[async_trait]
impl KeyRegistryStore for MemoryDocumentStore {
    fn strategy(&self) -> StoreStrategy {
        StoreStrategy::Document
    }

    async fn load_all(&self) -> StoreResult<Vec<KeyRecord>> {
        self.enter().await?;
        Ok(self.ordered())
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> StoreResult<Option<KeyRecord>> {
        self.enter().await?;
        let records = self.ordered();
        Ok(resolve_fingerprint(&records, fingerprint).cloned())
    }

    async fn find_by_id(&self, id: &KeyId) -> StoreResult<Option<KeyRecord>> {
        self.enter().await?;
        Ok(self.records.get(id).map(|slot| slot.record.clone()))
    }

    async fn insert(&self, record: KeyRecord) -> StoreResult<()> {
        self.enter().await?;
        let _guard = self.fingerprint_guard.lock();
        if self.fingerprint_taken(&record.fingerprint, None) {
            return Err(StoreError::Collision);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.records.insert(record.id.clone(), Slot { seq, record });
        Ok(())
    }

    async fn update(&self, id: &KeyId, patch: KeyPatch) -> StoreResult<Option<PatchedKey>> {
        self.enter().await?;
        let _guard = self.fingerprint_guard.lock();

        if let KeyPatch::SetFingerprint(fingerprint) = &patch {
            let target_active = self.records.get(id).map(|slot| !slot.record.revoked);
            if target_active == Some(true) && self.fingerprint_taken(fingerprint, Some(id)) {
                return Err(StoreError::Collision);
            }
        }

        let Some(mut slot) = self.records.get_mut(id) else {
            return Ok(None);
        };
        let before = slot.record.clone();
        patch.apply(&mut slot.record);
        Ok(Some(PatchedKey {
            before,
            after: slot.record.clone(),
        }))
    }

    async fn consume_quota(&self, id: &KeyId, now: DateTime<Utc>) -> StoreResult<UsageOutcome> {
        self.enter().await?;
        // The entry stays write-locked for the whole check-and-increment
        let Some(mut slot) = self.records.get_mut(id) else {
            return Ok(UsageOutcome::Missing);
        };

        let record = &mut slot.record;
        if record.revoked {
            return Ok(UsageOutcome::Revoked(record.clone()));
        }
        if QuotaTracker::check_and_consume(record, now) {
            Ok(UsageOutcome::Recorded(record.clone()))
        } else {
            Ok(UsageOutcome::Exhausted(record.clone()))
        }
    }

    async fn delete(&self, id: &KeyId) -> StoreResult<bool> {
        self.enter().await?;
        Ok(self.records.remove(id).is_some())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.enter().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BlobStore;

    fn record(fingerprint: &str, quota: u32) -> KeyRecord {
        KeyRecord::new("AcmeCo".to_string(), fingerprint.to_string(), vec![], quota, None, Utc::now())
    }

    #[tokio::test]
    async fn test_blob_clones_share_objects() {
        let a = MemoryBlobStore::new();
        let b = a.clone();
        a.put("k", b"v".to_vec()).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(b.exists("k").await.unwrap());
        assert_eq!(b.get("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_blob_outage() {
        let store = MemoryBlobStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));
        tokio_test::assert_err!(store.put("k", Vec::new()).await);
        store.set_unavailable(false);
        tokio_test::assert_ok!(store.put("k", Vec::new()).await);
        assert!(store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_document_load_all_keeps_insertion_order() {
        let store = MemoryDocumentStore::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            let r = record(&format!("fp-{}", i), 1);
            ids.push(r.id.clone());
            store.insert(r).await.unwrap();
        }

        let loaded: Vec<KeyId> = store.load_all().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(loaded, ids);
    }

    #[tokio::test]
    async fn test_document_fingerprint_uniqueness() {
        let store = MemoryDocumentStore::new();
        let a = record("a", 1);
        let b = record("b", 1);
        store.insert(a.clone()).await.unwrap();
        store.insert(b.clone()).await.unwrap();

        assert!(matches!(store.insert(record("a", 1)).await, Err(StoreError::Collision)));
        assert!(matches!(
            store.update(&b.id, KeyPatch::SetFingerprint("a".to_string())).await,
            Err(StoreError::Collision)
        ));

        let patched = store
            .update(&b.id, KeyPatch::SetFingerprint("c".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(patched.before.fingerprint, "b");
        assert_eq!(patched.after.fingerprint, "c");
        assert_eq!(store.find_by_fingerprint("c").await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn test_document_consume_and_missing() {
        let store = MemoryDocumentStore::new();
        let r = record("fp", 1);
        store.insert(r.clone()).await.unwrap();
        let now = Utc::now();

        assert!(matches!(store.consume_quota(&r.id, now).await.unwrap(), UsageOutcome::Recorded(_)));
        assert!(matches!(store.consume_quota(&r.id, now).await.unwrap(), UsageOutcome::Exhausted(_)));

        assert!(store.delete(&r.id).await.unwrap());
        assert!(matches!(store.consume_quota(&r.id, now).await.unwrap(), UsageOutcome::Missing));
        assert!(store.update(&r.id, KeyPatch::SetQuota(3)).await.unwrap().is_none());
    }
}
