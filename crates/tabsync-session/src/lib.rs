//! Tabsync Session Management
//!
//! Owns the canonical `SessionState` of one tab:
//! - Every change goes through a `Transition`; status is never set directly
//! - `user` and `session` are both present or both absent
//! - Subscribers are notified synchronously, in registration order
//! - The identity provider is consumed through `IdentityProvider`

mod auth;
mod error;
mod machine;
mod memory;
mod provider;
mod session;
mod state;
mod subscribers;

pub use auth::{AuthError, AuthErrorKind};
pub use error::SessionError;
pub use machine::{SessionMachine, Transition};
pub use memory::MemoryProvider;
pub use provider::IdentityProvider;
pub use session::{AuthSession, Credentials, Session, User};
pub use state::{SessionState, SessionStatus};
pub use subscribers::{SubscriberSet, Subscription};

pub type Result<T> = std::result::Result<T, SessionError>;
