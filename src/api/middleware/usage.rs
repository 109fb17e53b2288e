//! Usage Headers and Request Context
//!
//! Reports the caller's daily quota on accepted responses and collects the
//! client details logged with every authenticated request.

use actix_web::{
    dev::ServiceRequest,
    http::header::{HeaderMap, HeaderName, HeaderValue},
};
use chrono::{DateTime, Utc};
use std::net::IpAddr;

use super::auth::AuthenticatedKey;
use crate::keys::QuotaTracker;
use crate::keys::{QUOTA_LIMIT, QUOTA_REMAINING, QUOTA_USED};

/// Extract client IP from request
pub fn extract_client_ip(req: &ServiceRequest) -> Option<IpAddr> {
    // Try X-Forwarded-For first (for proxied requests)
    if let Some(forwarded) = req.headers().get("X-Forwarded-For") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            // X-Forwarded-For may contain multiple IPs, take the first (client)
            if let Some(first_ip) = forwarded_str.split(',').next() {
                if let Ok(ip) = first_ip.trim().parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }

    // Fall back to connection info
    req.peer_addr().map(|addr| addr.ip())
}

/// Extract user agent from request
pub fn extract_user_agent(req: &ServiceRequest) -> Option<String> {
    req.headers()
        .get("User-Agent")
        .and_then(|ua| ua.to_str().ok())
        .map(|s| s.chars().take(200).collect()) // Limit length
}

/// Daily quota summary for response headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageInfo {
    pub quota_per_day: u32,
    pub used_today: u32,
    pub remaining_today: u32,
}

impl UsageInfo {
    /// Usage of a regular key; `None` for the master key
    pub fn for_key(auth: &AuthenticatedKey, now: DateTime<Utc>) -> Option<Self> {
        if auth.privileged {
            return None;
        }
        let record = &auth.record;
        Some(Self {
            quota_per_day: record.quota_per_day,
            used_today: QuotaTracker::used_on(record, now.date_naive()),
            remaining_today: QuotaTracker::remaining_today(record, now),
        })
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        let values = [
            (QUOTA_LIMIT, self.quota_per_day),
            (QUOTA_USED, self.used_today),
            (QUOTA_REMAINING, self.remaining_today),
        ];
        for (name, value) in values {
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                headers.insert(name, HeaderValue::from(value));
            }
        }
    }
}
