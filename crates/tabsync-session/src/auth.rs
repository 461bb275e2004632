//! Authentication failures surfaced to callers

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthErrorKind {
    /// Wrong password, unknown account or revoked refresh token
    InvalidCredentials,
    /// Transport failure or transient upstream outage
    Network,
    /// Opaque upstream failure
    ProviderError,
    /// Renewal gave up after exhausting its retries
    SessionExpired,
    Unknown,
}

impl AuthErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthErrorKind::InvalidCredentials => "invalid-credentials",
            AuthErrorKind::Network => "network",
            AuthErrorKind::ProviderError => "provider-error",
            AuthErrorKind::SessionExpired => "session-expired",
            AuthErrorKind::Unknown => "unknown",
        }
    }

    /// Whether a renewal failing with this kind is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthErrorKind::Network | AuthErrorKind::Unknown)
    }
}

impl std::fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AuthErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "invalid-credentials" => Ok(AuthErrorKind::InvalidCredentials),
            "network" => Ok(AuthErrorKind::Network),
            "provider-error" => Ok(AuthErrorKind::ProviderError),
            "session-expired" => Ok(AuthErrorKind::SessionExpired),
            "unknown" => Ok(AuthErrorKind::Unknown),
            _ => Err(format!("Unknown auth error kind: {}", s)),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct AuthError {
    pub kind: AuthErrorKind,
    pub message: String,
}

impl AuthError {
    pub fn new(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_credentials(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::InvalidCredentials, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Network, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::ProviderError, message)
    }

    pub fn session_expired(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::SessionExpired, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Unknown, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        for kind in [
            AuthErrorKind::InvalidCredentials,
            AuthErrorKind::Network,
            AuthErrorKind::ProviderError,
            AuthErrorKind::SessionExpired,
            AuthErrorKind::Unknown,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(kind.as_str().parse::<AuthErrorKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(AuthErrorKind::Network.is_retryable());
        assert!(AuthErrorKind::Unknown.is_retryable());
        assert!(!AuthErrorKind::InvalidCredentials.is_retryable());
        assert!(!AuthErrorKind::SessionExpired.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = AuthError::invalid_credentials("Invalid login credentials");
        assert_eq!(err.to_string(), "invalid-credentials: Invalid login credentials");
    }
}
