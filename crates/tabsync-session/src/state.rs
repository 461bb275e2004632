//! Session State Machine states
//!
//! ```text
//! loading         -> authenticated | unauthenticated | error
//! authenticated   -> unauthenticated | error | authenticated (refresh)
//! unauthenticated -> authenticated | loading
//! error           -> authenticated | unauthenticated | loading
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::AuthError;
use crate::session::{AuthSession, Session, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Hydration has not produced a definitive answer yet
    Loading,
    Authenticated,
    Unauthenticated,
    /// Last operation failed; see `SessionState::error`
    Error,
}

impl SessionStatus {
    /// Check if transition to another state is valid
    pub fn can_transition_to(&self, target: SessionStatus) -> bool {
        use SessionStatus::*;

        match (self, target) {
            (Loading, Authenticated | Unauthenticated | Error) => true,
            (Authenticated, Unauthenticated | Error) => true,
            (Unauthenticated, Authenticated | Loading) => true,
            (Error, Authenticated | Unauthenticated | Loading) => true,
            // Same state is always valid (refresh re-enters authenticated)
            (a, b) if *a == b => true,
            _ => false,
        }
    }

    /// Returns true once hydration has produced an answer
    pub fn is_definitive(&self) -> bool {
        !matches!(self, SessionStatus::Loading)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Loading => "loading",
            SessionStatus::Authenticated => "authenticated",
            SessionStatus::Unauthenticated => "unauthenticated",
            SessionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "loading" => Ok(SessionStatus::Loading),
            "authenticated" => Ok(SessionStatus::Authenticated),
            "unauthenticated" => Ok(SessionStatus::Unauthenticated),
            "error" => Ok(SessionStatus::Error),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

/// Read-only snapshot of a tab's session.
///
/// Built only by `SessionMachine`; `user` and `session` are both present
/// exactly when `status` is `Authenticated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub status: SessionStatus,
    pub user: Option<User>,
    pub session: Option<Session>,
    pub error: Option<AuthError>,
    pub last_refreshed: Option<DateTime<Utc>>,
}

impl SessionState {
    pub(crate) fn loading() -> Self {
        Self {
            status: SessionStatus::Loading,
            user: None,
            session: None,
            error: None,
            last_refreshed: None,
        }
    }

    pub(crate) fn authenticated(auth: AuthSession, last_refreshed: Option<DateTime<Utc>>) -> Self {
        Self {
            status: SessionStatus::Authenticated,
            user: Some(auth.user),
            session: Some(auth.session),
            error: None,
            last_refreshed,
        }
    }

    pub(crate) fn unauthenticated() -> Self {
        Self {
            status: SessionStatus::Unauthenticated,
            ..Self::loading()
        }
    }

    pub(crate) fn failed(error: AuthError) -> Self {
        Self {
            status: SessionStatus::Error,
            error: Some(error),
            ..Self::loading()
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.status == SessionStatus::Authenticated
    }

    /// The session+user pair, when authenticated.
    pub fn auth_session(&self) -> Option<AuthSession> {
        match (&self.session, &self.user) {
            (Some(session), Some(user)) => Some(AuthSession::new(session.clone(), user.clone())),
            _ => None,
        }
    }
}
