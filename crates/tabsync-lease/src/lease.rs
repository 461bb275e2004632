//! Leader lease record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The shared leadership claim. Heartbeats rewrite it with a later
/// `expires_at`; a release rewrites it with `expires_at = now`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderLease {
    pub holder_id: String,
    pub expires_at: DateTime<Utc>,
}

impl LeaderLease {
    pub fn new(holder_id: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            holder_id: holder_id.into(),
            expires_at,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn is_held_by(&self, holder_id: &str) -> bool {
        self.holder_id == holder_id
    }
}

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Storage key of the lease record
    pub lease_key: String,
    /// How often the leader rewrites the lease (and followers poll it)
    pub heartbeat_interval: Duration,
    /// Lease lifetime; a lease not rewritten for this long is contested
    pub leader_timeout: Duration,
    /// Delay between writing a claim and re-reading it
    pub claim_confirm_delay: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_key: "tabsync:leader".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            leader_timeout: Duration::from_secs(15),
            claim_confirm_delay: Duration::from_millis(50),
        }
    }
}
