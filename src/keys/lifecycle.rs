//! Administrative key operations
//!
//! Issues, lists, revokes, re-quotas, regenerates and deletes keys. Every
//! store call is bounded by the configured timeout, and every mutation that
//! changes what a fingerprint resolves to drops it from the cache.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use super::cache::KeyCache;
use super::codec::CredentialCodec;
use super::error::KeyError;
use super::record::{ExpiresAt, KeyId, KeyRecord};
use crate::storage::{bounded, KeyPatch, KeyRegistryStore, StoreError};

/// Fresh credentials generated before a collision is reported
pub const MAX_GENERATION_ATTEMPTS: usize = 3;

/// Request to issue a key
#[derive(Debug, Clone)]
pub struct NewKey {
    pub owner_name: String,
    pub permissions: Vec<String>,
    pub quota_per_day: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A key together with its raw credential, returned exactly once
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub record: KeyRecord,
    pub raw_key: String,
}

pub struct KeyLifecycleManager {
    store: Arc<dyn KeyRegistryStore>,
    cache: Option<KeyCache>,
    default_quota: u32,
    timeout: Duration,
}

/// Log a store failure with context and fold it into the client-facing error
pub(crate) fn store_failure(operation: &'static str, err: StoreError) -> KeyError {
    match &err {
        StoreError::Collision => warn!(operation, "Fingerprint collision"),
        _ => error!(operation, error = %err, "Key registry store failed"),
    }
    KeyError::from(err)
}

impl KeyLifecycleManager {
    pub fn new(
        store: Arc<dyn KeyRegistryStore>,
        cache: Option<KeyCache>,
        default_quota: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            default_quota,
            timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyRegistryStore> {
        &self.store
    }

    async fn invalidate(&self, fingerprint: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(fingerprint).await;
        }
    }

    /// Issue a new key
    #[instrument(skip(self, request), fields(owner = %request.owner_name))]
    pub async fn create(&self, request: NewKey) -> Result<IssuedKey, KeyError> {
        let owner_name = request.owner_name.trim().to_string();
        if owner_name.is_empty() {
            return Err(KeyError::InvalidArgument(
                "owner_name must not be blank".to_string(),
            ));
        }
        let quota = request.quota_per_day.unwrap_or(self.default_quota);
        if quota == 0 {
            return Err(KeyError::InvalidArgument(
                "quota_per_day must be at least 1".to_string(),
            ));
        }

        let now = Utc::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (raw_key, fingerprint) = CredentialCodec::generate();
            let record = KeyRecord::new(
                owner_name.clone(),
                fingerprint,
                request.permissions.clone(),
                quota,
                request.expires_at.map(ExpiresAt::from),
                now,
            );

            match bounded(self.timeout, self.store.insert(record.clone())).await {
                Ok(()) => {
                    info!(
                        key_id = %record.id,
                        fingerprint = %CredentialCodec::short(&record.fingerprint),
                        quota_per_day = quota,
                        "API key created"
                    );
                    return Ok(IssuedKey { record, raw_key });
                }
                Err(StoreError::Collision) if attempt < MAX_GENERATION_ATTEMPTS => {
                    warn!(attempt, "Generated key collided, retrying");
                }
                Err(e) => return Err(store_failure("create", e)),
            }
        }
    }

    /// All keys in creation order
    pub async fn list(&self) -> Result<Vec<KeyRecord>, KeyError> {
        bounded(self.timeout, self.store.load_all())
            .await
            .map_err(|e| store_failure("list", e))
    }

    pub async fn get(&self, id: &KeyId) -> Result<KeyRecord, KeyError> {
        bounded(self.timeout, self.store.find_by_id(id))
            .await
            .map_err(|e| store_failure("get", e))?
            .ok_or_else(|| KeyError::NotFound(id.clone()))
    }

    async fn patch(
        &self,
        operation: &'static str,
        id: &KeyId,
        patch: KeyPatch,
    ) -> Result<(KeyRecord, KeyRecord), KeyError> {
        let patched = bounded(self.timeout, self.store.update(id, patch))
            .await
            .map_err(|e| store_failure(operation, e))?
            .ok_or_else(|| KeyError::NotFound(id.clone()))?;

        self.invalidate(&patched.before.fingerprint).await;
        Ok((patched.before, patched.after))
    }

    /// Revoke a key. Revoking twice keeps the first `revoked_at`.
    #[instrument(skip(self))]
    pub async fn revoke(&self, id: &KeyId) -> Result<KeyRecord, KeyError> {
        let (before, after) = self
            .patch("revoke", id, KeyPatch::Revoke { at: Utc::now() })
            .await?;
        if before.revoked {
            info!(key_id = %id, "API key already revoked");
        } else {
            warn!(key_id = %id, owner = %after.owner_name, "API key revoked");
        }
        Ok(after)
    }

    #[instrument(skip(self))]
    pub async fn update_quota(&self, id: &KeyId, quota_per_day: u32) -> Result<KeyRecord, KeyError> {
        if quota_per_day == 0 {
            return Err(KeyError::InvalidArgument(
                "quota_per_day must be at least 1".to_string(),
            ));
        }
        let (before, after) = self
            .patch("update_quota", id, KeyPatch::SetQuota(quota_per_day))
            .await?;
        info!(
            key_id = %id,
            from = before.quota_per_day,
            to = after.quota_per_day,
            "API key quota updated"
        );
        Ok(after)
    }

    /// Replace a key's credential. Settings and usage history are kept.
    #[instrument(skip(self))]
    pub async fn regenerate(&self, id: &KeyId) -> Result<IssuedKey, KeyError> {
        let current = self.get(id).await?;
        if current.revoked {
            return Err(KeyError::InvalidArgument(
                "revoked keys cannot be regenerated".to_string(),
            ));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let (raw_key, fingerprint) = CredentialCodec::generate();
            match bounded(
                self.timeout,
                self.store.update(id, KeyPatch::SetFingerprint(fingerprint)),
            )
            .await
            {
                Ok(Some(patched)) => {
                    self.invalidate(&patched.before.fingerprint).await;
                    info!(
                        key_id = %id,
                        fingerprint = %CredentialCodec::short(&patched.after.fingerprint),
                        "API key regenerated"
                    );
                    return Ok(IssuedKey {
                        record: patched.after,
                        raw_key,
                    });
                }
                Ok(None) => return Err(KeyError::NotFound(id.clone())),
                Err(StoreError::Collision) if attempt < MAX_GENERATION_ATTEMPTS => {
                    warn!(attempt, "Regenerated key collided, retrying");
                }
                Err(e) => return Err(store_failure("regenerate", e)),
            }
        }
    }

    /// Remove a key permanently
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &KeyId) -> Result<(), KeyError> {
        let record = self.get(id).await?;
        let deleted = bounded(self.timeout, self.store.delete(id))
            .await
            .map_err(|e| store_failure("delete", e))?;
        self.invalidate(&record.fingerprint).await;

        if !deleted {
            return Err(KeyError::NotFound(id.clone()));
        }
        warn!(key_id = %id, owner = %record.owner_name, "API key deleted");
        Ok(())
    }
}
