//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use tabsync_lease::LeaseConfig;
use tabsync_refresh::RetryPolicy;

use crate::error::CoreError;
use crate::Result;

/// Durations are (de)serialised as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Coordination domain; prefixes every shared storage key
    pub domain: String,
    /// Renew this long before the session expires
    #[serde(with = "millis")]
    pub refresh_threshold: Duration,
    /// Lease rewrite period of the leader
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    /// A lease not rewritten for this long is contested
    #[serde(with = "millis")]
    pub leader_timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub retry_delay: Duration,
    /// Backoff cap
    #[serde(with = "millis")]
    pub max_retry_delay: Duration,
    #[serde(with = "millis")]
    pub claim_confirm_delay: Duration,
    /// Bound on the provider call made while initializing
    #[serde(with = "millis")]
    pub init_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: "tabsync".to_string(),
            refresh_threshold: Duration::from_secs(5 * 60),
            heartbeat_interval: Duration::from_secs(5),
            leader_timeout: Duration::from_secs(15),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            claim_confirm_delay: Duration::from_millis(50),
            init_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!(path = %path.as_ref().display(), domain = %config.domain, "Loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.domain.trim().is_empty() {
            return Err(CoreError::Config("domain must not be empty".to_string()));
        }

        let durations = [
            ("refresh_threshold", self.refresh_threshold),
            ("heartbeat_interval", self.heartbeat_interval),
            ("leader_timeout", self.leader_timeout),
            ("retry_delay", self.retry_delay),
            ("max_retry_delay", self.max_retry_delay),
            ("claim_confirm_delay", self.claim_confirm_delay),
            ("init_timeout", self.init_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| value.is_zero()) {
            return Err(CoreError::Config(format!("{} must be positive", name)));
        }

        if self.heartbeat_interval >= self.leader_timeout {
            return Err(CoreError::Config(format!(
                "heartbeat_interval ({:?}) must be below leader_timeout ({:?})",
                self.heartbeat_interval, self.leader_timeout
            )));
        }
        if self.heartbeat_interval * 2 > self.leader_timeout {
            tracing::warn!(
                heartbeat_ms = self.heartbeat_interval.as_millis() as u64,
                leader_timeout_ms = self.leader_timeout.as_millis() as u64,
                "Heartbeat is close to the leader timeout; expect spurious re-elections"
            );
        }

        self.retry_policy().validate()?;
        Ok(())
    }

    pub fn session_key(&self) -> String {
        format!("{}:session", self.domain)
    }

    pub fn lease_key(&self) -> String {
        format!("{}:leader", self.domain)
    }

    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            lease_key: self.lease_key(),
            heartbeat_interval: self.heartbeat_interval,
            leader_timeout: self.leader_timeout,
            claim_confirm_delay: self.claim_confirm_delay,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            refresh_threshold: self.refresh_threshold,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            max_retry_delay: self.max_retry_delay,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
