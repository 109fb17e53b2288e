//! API key database operations
//!
//! PostgreSQL implementation of the per-document registry strategy. Each key
//! is one row in `api_keys`; each quota slot is one row in
//! `api_key_daily_usage`. Quota consumption is a single conditional upsert,
//! so concurrent requests can never push a day's count past the quota.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use tokio_postgres::Row;
use tracing::{info, instrument, warn};

use super::pool::{DbError, DbPool};
use crate::keys::record::{DailyUsage, ExpiresAt, KeyId, KeyRecord};
use crate::storage::{
    KeyPatch, KeyRegistryStore, PatchedKey, StoreError, StoreResult, StoreStrategy, UsageOutcome,
};

const SELECT_KEYS: &str = r#"
    SELECT
        k.id, k.owner_name, k.fingerprint, k.created_at, k.revoked, k.revoked_at,
        k.last_used_at, k.permissions, k.quota_per_day, k.expires_at,
        COALESCE(
            jsonb_object_agg(
                u.usage_date::text,
                jsonb_build_object('count', u.count, 'last_used', u.last_used)
            ) FILTER (WHERE u.usage_date IS NOT NULL),
            '{}'::jsonb
        ) AS daily_usage
    FROM api_keys k
    LEFT JOIN api_key_daily_usage u ON u.key_id = k.id
"#;

/// Admit one request for the day unless the slot is full. Returns no row when
/// the key is missing or revoked, or the quota is used up.
const CONSUME_QUOTA: &str = r#"
    INSERT INTO api_key_daily_usage (key_id, usage_date, count, last_used)
    SELECT k.id, $2::date, 1, $3::timestamptz
    FROM api_keys k
    WHERE k.id = $1 AND NOT k.revoked
    ON CONFLICT (key_id, usage_date) DO UPDATE
        SET count = api_key_daily_usage.count + 1,
            last_used = EXCLUDED.last_used
        WHERE api_key_daily_usage.count < (
            SELECT quota_per_day FROM api_keys WHERE id = $1
        )
    RETURNING count
"#;

fn to_db_int(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_db_int(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

/// Map a joined `api_keys` row to a record
fn record_from_row(row: &Row) -> StoreResult<KeyRecord> {
    let daily_usage_json: serde_json::Value = row.get("daily_usage");
    let daily_usage: BTreeMap<NaiveDate, DailyUsage> = serde_json::from_value(daily_usage_json)
        .map_err(|e| StoreError::Corrupt(format!("daily usage for key: {}", e)))?;

    let id: String = row.get("id");
    let expires_at: Option<String> = row.get("expires_at");

    Ok(KeyRecord {
        id: KeyId::from(id),
        owner_name: row.get("owner_name"),
        fingerprint: row.get("fingerprint"),
        created_at: row.get("created_at"),
        revoked: row.get("revoked"),
        revoked_at: row.get("revoked_at"),
        last_used_at: row.get("last_used_at"),
        permissions: row.get("permissions"),
        quota_per_day: from_db_int(row.get("quota_per_day")),
        daily_usage,
        expires_at: expires_at.map(ExpiresAt::from),
    })
}

/// Registry store over PostgreSQL
pub struct PostgresRegistryStore {
    pool: DbPool,
}

impl PostgresRegistryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn query_records(
        &self,
        filter: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> StoreResult<Vec<KeyRecord>> {
        let client = self.pool.get().await?;
        let sql = format!("{} {} GROUP BY k.id ORDER BY k.seq", SELECT_KEYS, filter);
        let rows = client.query(sql.as_str(), params).await.map_err(DbError::from)?;
        rows.iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl KeyRegistryStore for PostgresRegistryStore {
    fn strategy(&self) -> StoreStrategy {
        StoreStrategy::Document
    }

    async fn load_all(&self) -> StoreResult<Vec<KeyRecord>> {
        self.query_records("", &[]).await
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> StoreResult<Option<KeyRecord>> {
        let matches = self
            .query_records("WHERE k.fingerprint = $1", &[&fingerprint])
            .await?;
        // creation order; an active match wins over revoked ones
        let active = matches.iter().position(|r| !r.revoked);
        Ok(match active {
            Some(index) => matches.into_iter().nth(index),
            None => matches.into_iter().next(),
        })
    }

    async fn find_by_id(&self, id: &KeyId) -> StoreResult<Option<KeyRecord>> {
        let mut found = self.query_records("WHERE k.id = $1", &[&id.as_str()]).await?;
        Ok(found.pop())
    }

    #[instrument(skip(self, record), fields(key_id = %record.id))]
    async fn insert(&self, record: KeyRecord) -> StoreResult<()> {
        let client = self.pool.get().await?;
        let expires_at = record.expires_at.as_ref().map(|e| e.as_str().to_string());

        client
            .execute(
                r#"
                INSERT INTO api_keys (
                    id, owner_name, fingerprint, created_at, revoked, revoked_at,
                    last_used_at, permissions, quota_per_day, expires_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
                &[
                    &record.id.as_str(),
                    &record.owner_name,
                    &record.fingerprint,
                    &record.created_at,
                    &record.revoked,
                    &record.revoked_at,
                    &record.last_used_at,
                    &record.permissions,
                    &to_db_int(record.quota_per_day),
                    &expires_at,
                ],
            )
            .await
            .map_err(DbError::from)?;

        info!(owner = %record.owner_name, "Key row inserted");
        Ok(())
    }

    #[instrument(skip(self, patch))]
    async fn update(&self, id: &KeyId, patch: KeyPatch) -> StoreResult<Option<PatchedKey>> {
        let Some(before) = self.find_by_id(id).await? else {
            return Ok(None);
        };

        let client = self.pool.get().await?;
        let changed = match &patch {
            KeyPatch::Revoke { at } => {
                client
                    .execute(
                        "UPDATE api_keys SET revoked = TRUE, revoked_at = COALESCE(revoked_at, $2) WHERE id = $1",
                        &[&id.as_str(), at],
                    )
                    .await
            }
            KeyPatch::SetQuota(quota) => {
                client
                    .execute(
                        "UPDATE api_keys SET quota_per_day = $2 WHERE id = $1",
                        &[&id.as_str(), &to_db_int(*quota)],
                    )
                    .await
            }
            KeyPatch::SetFingerprint(fingerprint) => {
                client
                    .execute(
                        "UPDATE api_keys SET fingerprint = $2 WHERE id = $1",
                        &[&id.as_str(), fingerprint],
                    )
                    .await
            }
        }
        .map_err(DbError::from)?;

        if changed == 0 {
            // deleted between the read and the write
            return Ok(None);
        }

        let after = self.find_by_id(id).await?.ok_or_else(|| {
            StoreError::Unavailable(format!("Key {} vanished after update", id))
        })?;
        Ok(Some(PatchedKey { before, after }))
    }

    async fn consume_quota(&self, id: &KeyId, now: DateTime<Utc>) -> StoreResult<UsageOutcome> {
        let client = self.pool.get().await?;
        let today = now.date_naive();

        let admitted = client
            .query_opt(CONSUME_QUOTA, &[&id.as_str(), &today, &now])
            .await
            .map_err(DbError::from)?;

        if admitted.is_some() {
            client
                .execute(
                    "UPDATE api_keys SET last_used_at = $2 WHERE id = $1",
                    &[&id.as_str(), &now],
                )
                .await
                .map_err(DbError::from)?;
        }
        drop(client);

        let outcome = match (admitted, self.find_by_id(id).await?) {
            (_, None) => UsageOutcome::Missing,
            (Some(_), Some(record)) => UsageOutcome::Recorded(record),
            (None, Some(record)) if record.revoked => UsageOutcome::Revoked(record),
            (None, Some(record)) => {
                warn!(key_id = %id, quota = record.quota_per_day, "Quota slot full");
                UsageOutcome::Exhausted(record)
            }
        };
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &KeyId) -> StoreResult<bool> {
        let client = self.pool.get().await?;
        let result = client
            .execute("DELETE FROM api_keys WHERE id = $1", &[&id.as_str()])
            .await
            .map_err(DbError::from)?;

        if result > 0 {
            warn!(key_id = %id, "API key deleted");
        }
        Ok(result > 0)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.pool.test_connection().await.map_err(StoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_int_conversions() {
        assert_eq!(to_db_int(50), 50);
        assert_eq!(to_db_int(u32::MAX), i32::MAX);
        assert_eq!(from_db_int(7), 7);
        assert_eq!(from_db_int(-1), 0);
    }

    #[test]
    fn test_daily_usage_json_shape_matches_record() {
        // shape produced by jsonb_build_object in SELECT_KEYS
        let json = serde_json::json!({
            "2025-03-10": {"count": 4, "last_used": "2025-03-10T08:15:00.123456+00:00"},
            "2025-03-11": {"count": 1, "last_used": null}
        });
        let usage: BTreeMap<NaiveDate, DailyUsage> = serde_json::from_value(json).unwrap();
        let day = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        assert_eq!(usage[&day].count, 4);
        assert!(usage[&day].last_used.is_some());
        assert_eq!(usage.len(), 2);
    }

    #[test]
    fn test_consume_statement_is_conditional() {
        assert!(CONSUME_QUOTA.contains("ON CONFLICT (key_id, usage_date) DO UPDATE"));
        assert!(CONSUME_QUOTA.contains("count < ("));
        assert!(CONSUME_QUOTA.contains("NOT k.revoked"));
    }
}
