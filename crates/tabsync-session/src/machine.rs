//! Session State Machine
//!
//! Every change to a tab's `SessionState` is a `Transition`. Applying one
//! recomputes the whole record, publishes it on the watch channel and
//! notifies subscribers synchronously before `apply` returns.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use tabsync_storage::Clock;

use crate::auth::AuthError;
use crate::error::SessionError;
use crate::session::{AuthSession, Session};
use crate::state::{SessionState, SessionStatus};
use crate::subscribers::{SubscriberSet, Subscription};
use crate::Result;

#[derive(Debug, Clone)]
pub enum Transition {
    SignInOk(AuthSession),
    /// Only meaningful while hydrating; interactive sign-in failures are
    /// returned to the caller instead.
    SignInFail(AuthError),
    SignOut,
    RefreshOk(Session),
    RefreshFail { error: AuthError, attempt: u32 },
    /// Another tab wrote the shared session; `None` means it signed out.
    ExternalUpdate(Option<AuthSession>),
    /// Re-run hydration.
    Hydrate,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::SignInOk(_) => "SIGN_IN_OK",
            Transition::SignInFail(_) => "SIGN_IN_FAIL",
            Transition::SignOut => "SIGN_OUT",
            Transition::RefreshOk(_) => "REFRESH_OK",
            Transition::RefreshFail { .. } => "REFRESH_FAIL",
            Transition::ExternalUpdate(_) => "EXTERNAL_UPDATE",
            Transition::Hydrate => "HYDRATE",
        }
    }

    fn target(&self) -> SessionStatus {
        match self {
            Transition::SignInOk(_) | Transition::RefreshOk(_) => SessionStatus::Authenticated,
            Transition::ExternalUpdate(Some(_)) => SessionStatus::Authenticated,
            Transition::SignInFail(_) | Transition::RefreshFail { .. } => SessionStatus::Error,
            Transition::SignOut | Transition::ExternalUpdate(None) => {
                SessionStatus::Unauthenticated
            }
            Transition::Hydrate => SessionStatus::Loading,
        }
    }

    /// Renewal results only apply to a live session.
    fn requires_session(&self) -> bool {
        matches!(
            self,
            Transition::RefreshOk(_) | Transition::RefreshFail { .. }
        )
    }
}

pub struct SessionMachine {
    state: RwLock<SessionState>,
    /// Serialises apply+notify so subscribers see transitions in order
    dispatch: Mutex<()>,
    subscribers: SubscriberSet,
    watch: watch::Sender<SessionState>,
    clock: Clock,
}

impl SessionMachine {
    pub fn new(clock: Clock) -> Self {
        Self::with_state(SessionState::loading(), clock)
    }

    /// Starts authenticated from a previously hydrated session, pending
    /// background verification.
    pub fn hydrated(auth: AuthSession, clock: Clock) -> Self {
        Self::with_state(SessionState::authenticated(auth, None), clock)
    }

    fn with_state(state: SessionState, clock: Clock) -> Self {
        let (watch, _) = watch::channel(state.clone());
        Self {
            state: RwLock::new(state),
            dispatch: Mutex::new(()),
            subscribers: SubscriberSet::new(),
            watch,
            clock,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.read().status
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.watch.subscribe()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        self.subscribers.add(callback)
    }

    /// Apply a transition and notify subscribers.
    ///
    /// Callbacks run on the caller's stack and must not apply transitions
    /// themselves.
    pub fn apply(&self, transition: Transition) -> Result<SessionState> {
        let _dispatch = self.dispatch.lock();

        let current = self.state.read().clone();
        let target = transition.target();

        let allowed = current.status.can_transition_to(target)
            && (!transition.requires_session() || current.is_authenticated());
        if !allowed {
            tracing::warn!(
                from = %current.status,
                transition = transition.name(),
                "Rejected session transition"
            );
            return Err(SessionError::InvalidTransition {
                from: current.status.to_string(),
                transition: transition.name().to_string(),
            });
        }

        let name = transition.name();
        let next = self.next_state(&current, transition, self.clock.now());
        if next == current {
            tracing::trace!(transition = name, "Session transition changed nothing");
            return Ok(next);
        }

        *self.state.write() = next.clone();
        self.watch.send_replace(next.clone());

        tracing::debug!(
            from = %current.status,
            to = %next.status,
            transition = name,
            "Session transition applied"
        );

        self.subscribers.notify(&next);
        Ok(next)
    }

    fn next_state(
        &self,
        current: &SessionState,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> SessionState {
        match transition {
            Transition::SignInOk(auth) => SessionState::authenticated(auth, None),
            Transition::SignInFail(error) => SessionState::failed(error),
            Transition::SignOut | Transition::ExternalUpdate(None) => {
                SessionState::unauthenticated()
            }
            Transition::RefreshOk(session) => SessionState {
                session: Some(session),
                last_refreshed: Some(now),
                ..current.clone()
            },
            Transition::RefreshFail { error, attempt } => {
                SessionState::failed(AuthError::session_expired(format!(
                    "renewal failed after {} attempt(s): {}",
                    attempt, error
                )))
            }
            Transition::ExternalUpdate(Some(auth)) => {
                // Another tab's renewal keeps our renewal timestamp for the same identity
                let same_user = current.user.as_ref().map(|u| &u.id) == Some(&auth.user.id);
                let last_refreshed = if same_user { current.last_refreshed } else { None };
                SessionState::authenticated(auth, last_refreshed)
            }
            Transition::Hydrate => SessionState::loading(),
        }
    }
}
