//! Single-document registry strategy
//!
//! The registry is one JSON array of `KeyRecord`s under a single object key.
//! Every mutation downloads the array, changes it in memory and uploads it
//! again. There is no conditional write, so two concurrent mutations of the
//! same registry can overwrite each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::{
    KeyPatch, KeyRegistryStore, PatchedKey, StoreError, StoreResult, StoreStrategy, UsageOutcome,
};
use crate::keys::quota::QuotaTracker;
use crate::keys::record::{resolve_fingerprint, KeyId, KeyRecord};

/// Object key of the registry document
pub const DEFAULT_OBJECT_KEY: &str = "api-keys.json";

/// Minimal object storage contract
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Object bytes, or `None` when no object exists under `key`
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Create or overwrite an object
    async fn put(&self, key: &str, data: Vec<u8>) -> StoreResult<()>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;
}

/// Key registry kept as a single JSON document in a blob store
pub struct BlobRegistryStore<B> {
    blob: B,
    object_key: String,
}

impl<B: BlobStore> BlobRegistryStore<B> {
    pub fn new(blob: B, object_key: impl Into<String>) -> Self {
        Self {
            blob,
            object_key: object_key.into(),
        }
    }

    #[cfg(test)]
    pub fn blob(&self) -> &B {
        &self.blob
    }

    /// Download and parse the registry. A missing object is an empty registry.
    async fn load(&self) -> StoreResult<Vec<KeyRecord>> {
        let Some(bytes) = self.blob.get(&self.object_key).await? else {
            debug!(object_key = %self.object_key, "Registry object not found, starting empty");
            return Ok(Vec::new());
        };

        serde_json::from_slice(&bytes).map_err(|e| {
            warn!(object_key = %self.object_key, error = %e, "Registry document failed to parse");
            StoreError::Corrupt(format!("{}: {}", self.object_key, e))
        })
    }

    /// Replace the whole registry document
    async fn save(&self, records: &[KeyRecord]) -> StoreResult<()> {
        let data = serde_json::to_vec_pretty(records)
            .map_err(|e| StoreError::Corrupt(format!("Failed to serialize registry: {}", e)))?;
        self.blob.put(&self.object_key, data).await?;
        debug!(object_key = %self.object_key, records = records.len(), "Registry saved");
        Ok(())
    }
}

#[async_trait]
impl<B: BlobStore + 'static> KeyRegistryStore for BlobRegistryStore<B> {
    fn strategy(&self) -> StoreStrategy {
        StoreStrategy::Blob
    }

    #[instrument(skip(self))]
    async fn load_all(&self) -> StoreResult<Vec<KeyRecord>> {
        self.load().await
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> StoreResult<Option<KeyRecord>> {
        let records = self.load().await?;
        Ok(resolve_fingerprint(&records, fingerprint).cloned())
    }

    async fn find_by_id(&self, id: &KeyId) -> StoreResult<Option<KeyRecord>> {
        let records = self.load().await?;
        Ok(records.into_iter().find(|r| &r.id == id))
    }

    #[instrument(skip(self, record), fields(key_id = %record.id))]
    async fn insert(&self, record: KeyRecord) -> StoreResult<()> {
        let mut records = self.load().await?;
        if records
            .iter()
            .any(|r| !r.revoked && r.fingerprint == record.fingerprint)
        {
            return Err(StoreError::Collision);
        }

        records.push(record);
        self.save(&records).await?;
        info!(total = records.len(), "Key added to registry document");
        Ok(())
    }

    #[instrument(skip(self, patch))]
    async fn update(&self, id: &KeyId, patch: KeyPatch) -> StoreResult<Option<PatchedKey>> {
        let mut records = self.load().await?;
        let Some(index) = records.iter().position(|r| &r.id == id) else {
            return Ok(None);
        };

        if patch.collides(&records[index], &records) {
            return Err(StoreError::Collision);
        }

        let before = records[index].clone();
        patch.apply(&mut records[index]);
        let after = records[index].clone();

        if after != before {
            self.save(&records).await?;
        }
        Ok(Some(PatchedKey { before, after }))
    }

    async fn consume_quota(&self, id: &KeyId, now: DateTime<Utc>) -> StoreResult<UsageOutcome> {
        // The decision is made on a snapshot loaded just now; anything saved
        // between this load and the save below is overwritten.
        let mut records = self.load().await?;
        let Some(record) = records.iter_mut().find(|r| &r.id == id) else {
            return Ok(UsageOutcome::Missing);
        };

        if record.revoked {
            return Ok(UsageOutcome::Revoked(record.clone()));
        }
        if !QuotaTracker::check_and_consume(record, now) {
            return Ok(UsageOutcome::Exhausted(record.clone()));
        }

        let updated = record.clone();
        self.save(&records).await?;
        Ok(UsageOutcome::Recorded(updated))
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &KeyId) -> StoreResult<bool> {
        let mut records = self.load().await?;
        let before = records.len();
        records.retain(|r| &r.id != id);
        if records.len() == before {
            return Ok(false);
        }

        self.save(&records).await?;
        Ok(true)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.blob.exists(&self.object_key).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;

    fn record(fingerprint: &str) -> KeyRecord {
        KeyRecord::new("AcmeCo".to_string(), fingerprint.to_string(), vec![], 2, None, Utc::now())
    }

    fn store() -> BlobRegistryStore<MemoryBlobStore> {
        BlobRegistryStore::new(MemoryBlobStore::new(), DEFAULT_OBJECT_KEY)
    }

    #[tokio::test]
    async fn test_missing_object_is_empty_registry() {
        let store = store();
        assert!(store.load_all().await.unwrap().is_empty());
        assert!(store.find_by_fingerprint("fp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_persists_json_array() {
        let store = store();
        let r = record("fp");
        store.insert(r.clone()).await.unwrap();

        let raw = store.blob().get(DEFAULT_OBJECT_KEY).await.unwrap().unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert!(doc.is_array());
        assert_eq!(doc[0]["id"], r.id.as_str());
        assert_eq!(doc[0]["fingerprint"], "fp");

        assert_eq!(store.find_by_id(&r.id).await.unwrap().unwrap().id, r.id);
    }

    #[tokio::test]
    async fn test_insert_rejects_active_fingerprint_collision() {
        let store = store();
        store.insert(record("fp")).await.unwrap();
        assert!(matches!(store.insert(record("fp")).await, Err(StoreError::Collision)));

        let first = store.load_all().await.unwrap().remove(0);
        store
            .update(&first.id, KeyPatch::Revoke { at: Utc::now() })
            .await
            .unwrap();
        // a revoked holder no longer blocks the fingerprint
        store.insert(record("fp")).await.unwrap();
        assert_eq!(store.load_all().await.unwrap().len(), 2);
        assert!(!store.find_by_fingerprint("fp").await.unwrap().unwrap().revoked);
    }

    #[tokio::test]
    async fn test_consume_quota_outcomes() {
        let store = store();
        let r = record("fp");
        store.insert(r.clone()).await.unwrap();
        let now = Utc::now();

        assert!(matches!(store.consume_quota(&r.id, now).await.unwrap(), UsageOutcome::Recorded(_)));
        assert!(matches!(store.consume_quota(&r.id, now).await.unwrap(), UsageOutcome::Recorded(_)));
        match store.consume_quota(&r.id, now).await.unwrap() {
            UsageOutcome::Exhausted(rec) => {
                assert_eq!(QuotaTracker::used_on(&rec, now.date_naive()), 2)
            }
            other => panic!("expected exhausted, got {:?}", other),
        }

        store.update(&r.id, KeyPatch::Revoke { at: now }).await.unwrap();
        assert!(matches!(store.consume_quota(&r.id, now).await.unwrap(), UsageOutcome::Revoked(_)));
        assert!(matches!(
            store.consume_quota(&KeyId::from("nope"), now).await.unwrap(),
            UsageOutcome::Missing
        ));
    }

    #[tokio::test]
    async fn test_corrupt_document_is_not_overwritten() {
        let store = store();
        store
            .blob()
            .put(DEFAULT_OBJECT_KEY, b"{not json".to_vec())
            .await
            .unwrap();

        assert!(matches!(store.load_all().await, Err(StoreError::Corrupt(_))));
        assert!(matches!(store.insert(record("fp")).await, Err(StoreError::Corrupt(_))));

        let raw = store.blob().get(DEFAULT_OBJECT_KEY).await.unwrap().unwrap();
        assert_eq!(raw, b"{not json".to_vec());
    }

    #[tokio::test]
    async fn test_unavailable_blob_is_an_error_not_empty() {
        let store = store();
        store.blob().set_unavailable(true);
        assert!(matches!(store.load_all().await, Err(StoreError::Unavailable(_))));
        assert!(store.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = store();
        let r = record("fp");
        store.insert(r.clone()).await.unwrap();
        assert!(store.delete(&r.id).await.unwrap());
        assert!(!store.delete(&r.id).await.unwrap());
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
