//! Per-key daily quota accounting
//!
//! Quota slots are UTC calendar days. Each day keeps its own counter in
//! `KeyRecord::daily_usage`; earlier days are left in place rather than reset.

use chrono::{DateTime, NaiveDate, Utc};

use super::record::{DailyUsage, KeyRecord};

/// Daily quota decisions on a record snapshot
pub struct QuotaTracker;

impl QuotaTracker {
    /// Admit one request for `now`'s UTC day if the key has quota left.
    ///
    /// On success the day's counter is incremented and the usage timestamps
    /// are set to `now`. When the quota is exhausted the record is left
    /// untouched (apart from an empty slot for today).
    pub fn check_and_consume(record: &mut KeyRecord, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        let quota = record.quota_per_day;
        let slot = record.daily_usage.entry(today).or_insert_with(DailyUsage::default);

        if slot.count >= quota {
            return false;
        }

        slot.count += 1;
        slot.last_used = Some(now);
        record.last_used_at = Some(now);
        true
    }

    /// Requests admitted on `date`
    pub fn used_on(record: &KeyRecord, date: NaiveDate) -> u32 {
        record.daily_usage.get(&date).map(|slot| slot.count).unwrap_or(0)
    }

    /// Requests still available for `now`'s UTC day
    pub fn remaining_today(record: &KeyRecord, now: DateTime<Utc>) -> u32 {
        record
            .quota_per_day
            .saturating_sub(Self::used_on(record, now.date_naive()))
    }
}
