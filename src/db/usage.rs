//! Usage log database operations
//!
//! Appends one row per request attempt to `api_key_usage_logs` and builds
//! the admin usage summary from it.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tracing::instrument;

use super::pool::{DbError, DbPool};
use crate::storage::{
    StoreError, StoreResult, UsageLog, UsageLogEntry, UsageSummary, OUTCOME_ACCEPTED,
    UNKNOWN_OWNER,
};

const INSERT_ENTRY: &str = r#"
    INSERT INTO api_key_usage_logs (
        key_id, owner_name, endpoint, method, status_code,
        outcome, response_time_ms, ip_address, user_agent, created_at
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
"#;

const SUMMARY_TOTALS: &str = r#"
    SELECT
        COUNT(*) AS total,
        COUNT(*) FILTER (WHERE (created_at AT TIME ZONE 'UTC')::date = $1::date) AS today,
        COUNT(*) FILTER (WHERE outcome = $2) AS accepted
    FROM api_key_usage_logs
"#;

/// Grouped counts; `{column}` is one of a fixed set of column names
fn grouped_counts_query(column: &str) -> String {
    format!(
        "SELECT COALESCE({column}, $1) AS label, COUNT(*) AS requests \
         FROM api_key_usage_logs GROUP BY 1",
        column = column
    )
}

fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Usage log kept in PostgreSQL next to the key registry
pub struct PostgresUsageLog {
    pool: DbPool,
}

impl PostgresUsageLog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn grouped(&self, column: &str) -> Result<BTreeMap<String, u64>, DbError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(grouped_counts_query(column).as_str(), &[&UNKNOWN_OWNER])
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<_, String>("label"), to_count(row.get("requests"))))
            .collect())
    }
}

#[async_trait]
impl UsageLog for PostgresUsageLog {
    #[instrument(skip(self, entry), fields(endpoint = %entry.endpoint, outcome = %entry.outcome))]
    async fn record(&self, entry: UsageLogEntry) -> StoreResult<()> {
        let client = self.pool.get().await.map_err(StoreError::from)?;
        let key_id = entry.key_id.as_ref().map(|id| id.as_str().to_string());
        let status_code = i32::from(entry.status_code);
        let response_time_ms = i64::try_from(entry.response_time_ms).unwrap_or(i64::MAX);

        client
            .execute(
                INSERT_ENTRY,
                &[
                    &key_id,
                    &entry.owner_name,
                    &entry.endpoint,
                    &entry.method,
                    &status_code,
                    &entry.outcome,
                    &response_time_ms,
                    &entry.ip_address,
                    &entry.user_agent,
                    &entry.timestamp,
                ],
            )
            .await
            .map_err(|e| StoreError::from(DbError::from(e)))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn summary(&self, today: NaiveDate) -> StoreResult<UsageSummary> {
        let client = self.pool.get().await.map_err(StoreError::from)?;
        let totals = client
            .query_one(SUMMARY_TOTALS, &[&today, &OUTCOME_ACCEPTED])
            .await
            .map_err(|e| StoreError::from(DbError::from(e)))?;

        let total_requests = to_count(totals.get("total"));
        let accepted_requests = to_count(totals.get("accepted"));

        Ok(UsageSummary {
            total_requests,
            today_requests: to_count(totals.get("today")),
            accepted_requests,
            rejected_requests: total_requests.saturating_sub(accepted_requests),
            by_owner: self.grouped("owner_name").await?,
            by_endpoint: self.grouped("endpoint").await?,
            by_outcome: self.grouped("outcome").await?,
        })
    }
}
