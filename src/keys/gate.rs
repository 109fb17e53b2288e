//! Request-time key validation
//!
//! A presented credential is resolved to its record, checked for revocation
//! and expiry, and charged one request against today's quota. Any store
//! failure along the way rejects the request with `StoreUnavailable`.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::cache::KeyCache;
use super::codec::CredentialCodec;
use super::error::KeyError;
use super::lifecycle::store_failure;
use super::quota::QuotaTracker;
use super::record::{KeyId, KeyRecord};
use crate::storage::{bounded, KeyRegistryStore, UsageOutcome};

/// Outcome of a successful validation, stored in request extensions
#[derive(Debug, Clone)]
pub struct AuthenticatedKey {
    pub record: KeyRecord,
    /// Authenticated with the master key
    pub privileged: bool,
}

/// A failed validation with whatever key it had resolved to
#[derive(Debug)]
pub struct GateRejection {
    pub error: KeyError,
    pub key_id: Option<KeyId>,
    pub owner_name: Option<String>,
}

impl GateRejection {
    fn anonymous(error: KeyError) -> Self {
        Self {
            error,
            key_id: None,
            owner_name: None,
        }
    }

    fn for_key(error: KeyError, record: &KeyRecord) -> Self {
        Self {
            error,
            key_id: Some(record.id.clone()),
            owner_name: Some(record.owner_name.clone()),
        }
    }
}

pub struct AuthGate {
    store: Arc<dyn KeyRegistryStore>,
    cache: Option<KeyCache>,
    master_key: Option<String>,
    timeout: Duration,
}

impl AuthGate {
    pub fn new(
        store: Arc<dyn KeyRegistryStore>,
        cache: Option<KeyCache>,
        master_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            master_key: master_key.filter(|k| !k.trim().is_empty()),
            timeout,
        }
    }

    /// Validate a presented credential at the current time
    pub async fn validate(&self, presented: Option<&str>) -> Result<AuthenticatedKey, KeyError> {
        self.validate_at(presented, Utc::now()).await
    }

    /// Validate a presented credential as of `now`
    pub async fn validate_at(
        &self,
        presented: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AuthenticatedKey, KeyError> {
        self.evaluate(presented, now).await.map_err(|r| r.error)
    }

    /// Validate at the current time, reporting which key a rejection
    /// belonged to when it got that far
    pub async fn validate_with_context(
        &self,
        presented: Option<&str>,
    ) -> Result<AuthenticatedKey, GateRejection> {
        self.evaluate(presented, Utc::now()).await
    }

    async fn evaluate(
        &self,
        presented: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AuthenticatedKey, GateRejection> {
        let raw = match presented.map(str::trim) {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Err(GateRejection::anonymous(KeyError::MissingCredential)),
        };

        if let Some(master) = &self.master_key {
            if CredentialCodec::secrets_match(raw, master) {
                info!("Master key accepted");
                return Ok(AuthenticatedKey {
                    record: KeyRecord::master(now),
                    privileged: true,
                });
            }
        }

        let fingerprint = CredentialCodec::fingerprint(raw);
        let record = self
            .resolve(&fingerprint)
            .await
            .map_err(GateRejection::anonymous)?
            .ok_or_else(|| {
                warn!(
                    fingerprint = %CredentialCodec::short(&fingerprint),
                    "Rejected unknown API key"
                );
                GateRejection::anonymous(KeyError::InvalidCredential)
            })?;

        if record.revoked {
            warn!(key_id = %record.id, owner = %record.owner_name, "Rejected revoked API key");
            return Err(GateRejection::for_key(KeyError::RevokedCredential, &record));
        }

        match record.expiry() {
            Some(Ok(expires_at)) if expires_at <= now => {
                warn!(key_id = %record.id, %expires_at, "Rejected expired API key");
                return Err(GateRejection::for_key(KeyError::ExpiredCredential, &record));
            }
            Some(Err(e)) => {
                warn!(
                    key_id = %record.id,
                    expires_at = record.expires_at.as_ref().map(|raw| raw.as_str()).unwrap_or_default(),
                    error = %e,
                    "Unreadable expiry, treating key as non-expiring"
                );
            }
            _ => {}
        }

        let outcome = bounded(self.timeout, self.store.consume_quota(&record.id, now))
            .await
            .map_err(|e| GateRejection::for_key(store_failure("consume_quota", e), &record))?;

        match outcome {
            UsageOutcome::Recorded(updated) => {
                if let Some(cache) = &self.cache {
                    cache.insert(&updated).await;
                }
                info!(
                    key_id = %updated.id,
                    owner = %updated.owner_name,
                    used_today = QuotaTracker::used_on(&updated, now.date_naive()),
                    quota_per_day = updated.quota_per_day,
                    "API key accepted"
                );
                Ok(AuthenticatedKey {
                    record: updated,
                    privileged: false,
                })
            }
            UsageOutcome::Exhausted(current) => {
                warn!(
                    key_id = %current.id,
                    owner = %current.owner_name,
                    quota_per_day = current.quota_per_day,
                    "Rejected request over daily quota"
                );
                Err(GateRejection::for_key(
                    KeyError::QuotaExceeded {
                        quota: current.quota_per_day,
                    },
                    &current,
                ))
            }
            UsageOutcome::Revoked(current) => {
                self.forget(&fingerprint).await;
                warn!(key_id = %current.id, "Key revoked while validating");
                Err(GateRejection::for_key(KeyError::RevokedCredential, &current))
            }
            UsageOutcome::Missing => {
                self.forget(&fingerprint).await;
                warn!(key_id = %record.id, "Key deleted while validating");
                Err(GateRejection::for_key(KeyError::InvalidCredential, &record))
            }
        }
    }

    async fn resolve(&self, fingerprint: &str) -> Result<Option<KeyRecord>, KeyError> {
        if let Some(cache) = &self.cache {
            if let Some(record) = cache.get(fingerprint).await {
                return Ok(Some(record));
            }
        }

        let found = bounded(self.timeout, self.store.find_by_fingerprint(fingerprint))
            .await
            .map_err(|e| store_failure("find_by_fingerprint", e))?;

        if let (Some(cache), Some(record)) = (&self.cache, &found) {
            cache.insert(record).await;
        }
        Ok(found)
    }

    async fn forget(&self, fingerprint: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(fingerprint).await;
        }
    }
}
