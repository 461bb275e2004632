//! Renewal timing

use chrono::{DateTime, Utc};
use std::time::Duration;

use tabsync_session::Session;

use crate::error::RefreshError;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Renew this long before the session expires
    pub refresh_threshold: Duration,
    /// Retries after the first failed call
    pub max_retries: u32,
    /// Base delay, doubled after every failure
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            refresh_threshold: Duration::from_secs(5 * 60),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.retry_delay.is_zero() {
            return Err(RefreshError::InvalidPolicy(
                "retry_delay must be positive".to_string(),
            ));
        }
        if self.max_retry_delay < self.retry_delay {
            return Err(RefreshError::InvalidPolicy(format!(
                "max_retry_delay ({:?}) is below retry_delay ({:?})",
                self.max_retry_delay, self.retry_delay
            )));
        }
        Ok(())
    }

    /// Delay after the failed call with zero-based index `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.retry_delay
            .saturating_mul(multiplier)
            .min(self.max_retry_delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn due_at(&self, session: &Session) -> DateTime<Utc> {
        let threshold =
            chrono::Duration::from_std(self.refresh_threshold).unwrap_or(chrono::Duration::zero());
        session.expires_at - threshold
    }

    /// Time left until renewal is due; zero when already overdue.
    pub fn wait_until_due(&self, session: &Session, now: DateTime<Utc>) -> Duration {
        (self.due_at(session) - now).to_std().unwrap_or(Duration::ZERO)
    }
}
