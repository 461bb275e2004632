//! In-memory identity provider
//!
//! Accounts live in a map and sessions are minted locally. Renewal failures
//! and latency can be scripted, and every renewal call is logged with its
//! timestamp, which makes it the provider of choice for tests and demos.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tabsync_storage::Clock;

use crate::auth::AuthError;
use crate::provider::IdentityProvider;
use crate::session::{AuthSession, Credentials, Session, User};

pub struct MemoryProvider {
    clock: Clock,
    session_ttl: chrono::Duration,
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<String, Account>,
    oauth_providers: HashSet<String>,
    current: Option<AuthSession>,
    renew_failures: VecDeque<AuthError>,
    renew_latency: Option<Duration>,
    renewals: Vec<DateTime<Utc>>,
    next_token: u64,
    confirm_sign_ups: bool,
}

struct Account {
    password: String,
    user: User,
}

impl MemoryProvider {
    pub fn new(clock: Clock, session_ttl: chrono::Duration) -> Self {
        Self {
            clock,
            session_ttl,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn add_account(&self, email: &str, password: &str) -> User {
        let mut state = self.state.lock();
        let user = User::new(format!("user-{}", state.accounts.len() + 1), Some(email.to_string()));
        state.accounts.insert(
            email.to_string(),
            Account {
                password: password.to_string(),
                user: user.clone(),
            },
        );
        user
    }

    pub fn allow_oauth(&self, provider_name: &str) {
        self.state
            .lock()
            .oauth_providers
            .insert(provider_name.to_string());
    }

    /// Sign-ups succeed without issuing a session until confirmed.
    pub fn require_confirmation(&self, required: bool) {
        self.state.lock().confirm_sign_ups = required;
    }

    /// The next renewals fail with these errors, in order.
    pub fn fail_renewals<I>(&self, errors: I)
    where
        I: IntoIterator<Item = AuthError>,
    {
        self.state.lock().renew_failures.extend(errors);
    }

    pub fn set_renew_latency(&self, latency: Option<Duration>) {
        self.state.lock().renew_latency = latency;
    }

    /// Timestamps of every renewal call, successful or not.
    pub fn renewals(&self) -> Vec<DateTime<Utc>> {
        self.state.lock().renewals.clone()
    }

    pub fn current(&self) -> Option<AuthSession> {
        self.state.lock().current.clone()
    }

    pub fn mint(&self, user: User) -> AuthSession {
        let mut state = self.state.lock();
        self.issue(&mut state, user)
    }

    fn issue(&self, state: &mut MemoryState, user: User) -> AuthSession {
        state.next_token += 1;
        let auth = AuthSession::new(
            Session {
                access_token: format!("access-{}", state.next_token),
                refresh_token: format!("refresh-{}", state.next_token),
                expires_at: self.clock.now() + self.session_ttl,
            },
            user,
        );
        state.current = Some(auth.clone());
        auth
    }
}

#[async_trait]
impl IdentityProvider for MemoryProvider {
    async fn get_session(&self) -> Result<Option<AuthSession>, AuthError> {
        let now = self.clock.now();
        Ok(self
            .state
            .lock()
            .current
            .clone()
            .filter(|auth| !auth.session.is_expired_at(now)))
    }

    async fn sign_in_with_password(
        &self,
        credentials: &Credentials,
    ) -> Result<AuthSession, AuthError> {
        let mut state = self.state.lock();
        let user = match state.accounts.get(&credentials.email) {
            Some(account) if account.password == credentials.password => account.user.clone(),
            _ => return Err(AuthError::invalid_credentials("Invalid login credentials")),
        };
        Ok(self.issue(&mut state, user))
    }

    async fn sign_up(&self, credentials: &Credentials) -> Result<Option<AuthSession>, AuthError> {
        if self.state.lock().accounts.contains_key(&credentials.email) {
            return Err(AuthError::provider("User already registered"));
        }

        let user = self.add_account(&credentials.email, &credentials.password);
        let mut state = self.state.lock();
        if state.confirm_sign_ups {
            return Ok(None);
        }
        Ok(Some(self.issue(&mut state, user)))
    }

    async fn sign_in_with_oauth(&self, provider_name: &str) -> Result<AuthSession, AuthError> {
        let mut state = self.state.lock();
        if !state.oauth_providers.contains(provider_name) {
            return Err(AuthError::provider(format!(
                "Unsupported provider: {}",
                provider_name
            )));
        }

        let user = User::new(format!("{}-user", provider_name), None);
        Ok(self.issue(&mut state, user))
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.state.lock().current = None;
        Ok(())
    }

    async fn renew_session(&self, current: &Session) -> Result<AuthSession, AuthError> {
        let latency = {
            let mut state = self.state.lock();
            state.renewals.push(self.clock.now());
            state.renew_latency
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if let Some(error) = state.renew_failures.pop_front() {
            return Err(error);
        }

        let user = match &state.current {
            Some(auth) if auth.session.same_token(current) => auth.user.clone(),
            _ => return Err(AuthError::invalid_credentials("Invalid Refresh Token")),
        };
        Ok(self.issue(&mut state, user))
    }
}
