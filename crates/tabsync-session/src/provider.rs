//! Identity provider interface consumed by the coordinator

use async_trait::async_trait;

use crate::auth::AuthError;
use crate::session::{AuthSession, Credentials, Session};

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The session the provider currently considers valid, if any.
    async fn get_session(&self) -> Result<Option<AuthSession>, AuthError>;

    async fn sign_in_with_password(&self, credentials: &Credentials)
        -> Result<AuthSession, AuthError>;

    /// `None` when the account needs confirming before a session is issued.
    async fn sign_up(&self, credentials: &Credentials) -> Result<Option<AuthSession>, AuthError>;

    async fn sign_in_with_oauth(&self, provider_name: &str) -> Result<AuthSession, AuthError>;

    async fn sign_out(&self) -> Result<(), AuthError>;

    async fn renew_session(&self, current: &Session) -> Result<AuthSession, AuthError>;

    /// The tab adopted a session written by another tab (or dropped it).
    fn session_changed(&self, _session: Option<&AuthSession>) {}
}
