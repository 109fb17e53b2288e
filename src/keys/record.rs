//! Key registry records
//!
//! A `KeyRecord` is what the registry stores for every issued key. The raw
//! credential never appears here, only its fingerprint.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Quota applied when a key is created without one (and to legacy records
/// that predate the field).
pub const DEFAULT_QUOTA_PER_DAY: u32 = 50;

/// Owner label of the synthetic record returned for the master key
pub const MASTER_OWNER: &str = "admin";

fn default_quota() -> u32 {
    DEFAULT_QUOTA_PER_DAY
}

/// Opaque key identifier
///
/// New keys get a UUID v4; identifiers of legacy records are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    pub fn generate() -> Self {
        KeyId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for KeyId {
    fn from(value: String) -> Self {
        KeyId(value)
    }
}

impl From<&str> for KeyId {
    fn from(value: &str) -> Self {
        KeyId(value.to_string())
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Expiry timestamp as it was written to the registry.
///
/// Kept as text so that one malformed value cannot make the whole registry
/// unreadable; it is parsed when a key is validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpiresAt(String);

impl ExpiresAt {
    pub fn parse(&self) -> Result<DateTime<Utc>, chrono::ParseError> {
        timestamp::parse_utc(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<DateTime<Utc>> for ExpiresAt {
    fn from(at: DateTime<Utc>) -> Self {
        ExpiresAt(timestamp::format_utc(&at))
    }
}

impl From<String> for ExpiresAt {
    fn from(raw: String) -> Self {
        ExpiresAt(raw)
    }
}

/// Request counter for one quota slot (key, UTC day)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub count: u32,
    #[serde(default, with = "timestamp::option")]
    pub last_used: Option<DateTime<Utc>>,
}

/// A registered API key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: KeyId,
    #[serde(alias = "company_name")]
    pub owner_name: String,
    #[serde(alias = "api_key_hash")]
    pub fingerprint: String,
    #[serde(default = "Utc::now", with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default, with = "timestamp::option")]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default = "default_quota")]
    pub quota_per_day: u32,
    #[serde(default)]
    pub daily_usage: BTreeMap<NaiveDate, DailyUsage>,
    #[serde(default)]
    pub expires_at: Option<ExpiresAt>,
}

impl KeyRecord {
    /// Build a fresh, unrevoked record with no usage
    pub fn new(
        owner_name: String,
        fingerprint: String,
        permissions: Vec<String>,
        quota_per_day: u32,
        expires_at: Option<ExpiresAt>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: KeyId::generate(),
            owner_name,
            fingerprint,
            created_at,
            revoked: false,
            revoked_at: None,
            last_used_at: None,
            permissions,
            quota_per_day,
            daily_usage: BTreeMap::new(),
            expires_at,
        }
    }

    /// Synthetic record handed out for the master key. Never persisted.
    pub fn master(now: DateTime<Utc>) -> Self {
        Self {
            id: KeyId::from("master"),
            owner_name: MASTER_OWNER.to_string(),
            fingerprint: String::new(),
            created_at: now,
            revoked: false,
            revoked_at: None,
            last_used_at: Some(now),
            permissions: vec!["*".to_string()],
            quota_per_day: u32::MAX,
            daily_usage: BTreeMap::new(),
            expires_at: None,
        }
    }

    /// Parsed expiry: `None` when the key never expires, `Some(Err(_))` when
    /// the stored value cannot be read.
    pub fn expiry(&self) -> Option<Result<DateTime<Utc>, chrono::ParseError>> {
        self.expires_at.as_ref().map(ExpiresAt::parse)
    }

    /// Mark the key revoked. The first revocation time is kept.
    pub fn revoke(&mut self, at: DateTime<Utc>) {
        if !self.revoked {
            self.revoked = true;
            self.revoked_at = Some(at);
        }
    }
}

/// Pick the record a fingerprint resolves to: the first non-revoked match,
/// otherwise the first revoked one.
pub fn resolve_fingerprint<'a, I>(records: I, fingerprint: &str) -> Option<&'a KeyRecord>
where
    I: IntoIterator<Item = &'a KeyRecord>,
{
    let mut revoked_match = None;
    for record in records {
        if record.fingerprint != fingerprint {
            continue;
        }
        if !record.revoked {
            return Some(record);
        }
        revoked_match.get_or_insert(record);
    }
    revoked_match
}

/// Timestamp (de)serialization for registry documents.
///
/// Writes RFC 3339 in UTC. Reads RFC 3339, and naive ISO-8601 timestamps
/// (taken as UTC) which older registries contain.
pub mod timestamp {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format_utc(at: &DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn parse_utc(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        let raw = raw.trim();
        let rfc3339 = DateTime::parse_from_rfc3339(raw);
        if let Ok(at) = &rfc3339 {
            return Ok(at.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
            return Ok(naive.and_utc());
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                return Ok(midnight.and_utc());
            }
        }
        rfc3339.map(|at| at.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_utc(at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_utc(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            at: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match at {
                Some(at) => serializer.serialize_some(&format_utc(at)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| parse_utc(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn record(fingerprint: &str, revoked: bool) -> KeyRecord {
        let mut r = KeyRecord::new(
            "AcmeCo".to_string(),
            fingerprint.to_string(),
            vec![],
            DEFAULT_QUOTA_PER_DAY,
            None,
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        );
        r.revoked = revoked;
        r
    }

    #[test]
    fn test_legacy_registry_entry_loads() {
        let json = r#"[{
            "id": "a1b2c3d4e5f6a7b8",
            "company_name": "GreenFields",
            "api_key_hash": "abc123",
            "created_at": "2024-05-01T09:30:00.123456",
            "revoked": false,
            "revoked_at": null,
            "last_used_at": "2024-05-01T10:00:00.5",
            "permissions": ["predict"],
            "daily_usage": {"2024-05-01": {"count": 3, "last_used": "2024-05-01T10:00:00.5"}},
            "expires_at": null
        }]"#;

        let records: Vec<KeyRecord> = serde_json::from_str(json).unwrap();
        let r = &records[0];
        assert_eq!(r.id.as_str(), "a1b2c3d4e5f6a7b8");
        assert_eq!(r.owner_name, "GreenFields");
        assert_eq!(r.fingerprint, "abc123");
        assert_eq!(r.quota_per_day, DEFAULT_QUOTA_PER_DAY);
        assert_eq!(r.created_at, Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap() + Duration::microseconds(123456));
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert_eq!(r.daily_usage[&day].count, 3);
        assert!(r.expires_at.is_none());
    }

    #[test]
    fn test_record_json_uses_current_field_names() {
        let r = record("fp", false);
        let value = serde_json::to_value(&r).unwrap();
        assert_eq!(value["owner_name"], "AcmeCo");
        assert_eq!(value["fingerprint"], "fp");
        assert!(value.get("company_name").is_none());

        let back: KeyRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_malformed_expiry_survives_loading() {
        let json = r#"{"id": "k1", "owner_name": "x", "fingerprint": "f", "expires_at": "next tuesday"}"#;
        let r: KeyRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.expires_at.as_ref().map(ExpiresAt::as_str), Some("next tuesday"));
        assert!(matches!(r.expiry(), Some(Err(_))));
    }

    #[test]
    fn test_expiry_formats() {
        let at = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(ExpiresAt::from(at).parse().unwrap(), at);
        assert_eq!(ExpiresAt::from("2030-01-02T03:04:05Z".to_string()).parse().unwrap(), at);
        assert_eq!(ExpiresAt::from("2030-01-02T03:04:05".to_string()).parse().unwrap(), at);
        assert_eq!(
            ExpiresAt::from("2030-01-02".to_string()).parse().unwrap(),
            Utc.with_ymd_and_hms(2030, 1, 2, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_revoke_keeps_first_timestamp() {
        let mut r = record("fp", false);
        let first = Utc::now();
        r.revoke(first);
        r.revoke(first + Duration::hours(1));
        assert!(r.revoked);
        assert_eq!(r.revoked_at, Some(first));
    }

    #[test]
    fn test_resolve_prefers_active_match() {
        let records = vec![record("fp", true), record("other", false), record("fp", false)];
        let found = resolve_fingerprint(&records, "fp").unwrap();
        assert!(!found.revoked);
        assert_eq!(found.id, records[2].id);

        let only_revoked = vec![record("fp", true)];
        assert!(resolve_fingerprint(&only_revoked, "fp").unwrap().revoked);
        assert!(resolve_fingerprint(&records, "missing").is_none());
    }
}
