//! Per-request usage log
//!
//! Every authenticated attempt, accepted or rejected, is appended to a
//! [`UsageLog`]. The document backend keeps the log in PostgreSQL
//! (`crate::db::PostgresUsageLog`); the blob and memory backends keep
//! process-local aggregates in [`MemoryUsageLog`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;

use super::StoreResult;
use crate::keys::record::KeyId;

/// Outcome label for requests that passed the gate
pub const OUTCOME_ACCEPTED: &str = "accepted";

/// Owner label for attempts that never resolved to a key
pub const UNKNOWN_OWNER: &str = "unknown";

/// One request attempt
#[derive(Debug, Clone)]
pub struct UsageLogEntry {
    /// `None` when the credential never resolved to a key
    pub key_id: Option<KeyId>,
    pub owner_name: Option<String>,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    /// [`OUTCOME_ACCEPTED`] or the rejection's error kind
    pub outcome: String,
    pub response_time_ms: u64,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl UsageLogEntry {
    pub fn accepted(&self) -> bool {
        self.outcome == OUTCOME_ACCEPTED
    }
}

/// Aggregate over the whole log
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageSummary {
    pub total_requests: u64,
    pub today_requests: u64,
    pub accepted_requests: u64,
    pub rejected_requests: u64,
    pub by_owner: BTreeMap<String, u64>,
    pub by_endpoint: BTreeMap<String, u64>,
    pub by_outcome: BTreeMap<String, u64>,
}

/// Sink for request attempts
#[async_trait]
pub trait UsageLog: Send + Sync {
    async fn record(&self, entry: UsageLogEntry) -> StoreResult<()>;

    /// Totals across all days, with `today` counted separately
    async fn summary(&self, today: NaiveDate) -> StoreResult<UsageSummary>;
}

#[derive(Default)]
struct Totals {
    by_day: BTreeMap<NaiveDate, u64>,
    accepted: u64,
    rejected: u64,
    by_owner: BTreeMap<String, u64>,
    by_endpoint: BTreeMap<String, u64>,
    by_outcome: BTreeMap<String, u64>,
}

/// Usage aggregates held in process memory, lost on restart
#[derive(Default)]
pub struct MemoryUsageLog {
    totals: Mutex<Totals>,
}

impl MemoryUsageLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageLog for MemoryUsageLog {
    async fn record(&self, entry: UsageLogEntry) -> StoreResult<()> {
        let mut totals = self.totals.lock();
        *totals.by_day.entry(entry.timestamp.date_naive()).or_default() += 1;
        if entry.accepted() {
            totals.accepted += 1;
        } else {
            totals.rejected += 1;
        }
        let owner = entry.owner_name.unwrap_or_else(|| UNKNOWN_OWNER.to_string());
        *totals.by_owner.entry(owner).or_default() += 1;
        *totals.by_endpoint.entry(entry.endpoint).or_default() += 1;
        *totals.by_outcome.entry(entry.outcome).or_default() += 1;
        Ok(())
    }

    async fn summary(&self, today: NaiveDate) -> StoreResult<UsageSummary> {
        let totals = self.totals.lock();
        Ok(UsageSummary {
            total_requests: totals.by_day.values().sum(),
            today_requests: totals.by_day.get(&today).copied().unwrap_or(0),
            accepted_requests: totals.accepted,
            rejected_requests: totals.rejected,
            by_owner: totals.by_owner.clone(),
            by_endpoint: totals.by_endpoint.clone(),
            by_outcome: totals.by_outcome.clone(),
        })
    }
}
