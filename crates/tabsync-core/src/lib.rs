//! Tabsync Core
//!
//! Multi-tab authentication session coordination. Every tab of an origin
//! runs one `Coordinator`; together they keep a single consistent session,
//! elect one leader to renew it, and propagate sign-in and sign-out to
//! each other through the shared storage channel.

mod config;
mod coordinator;
mod error;
mod runtime;
mod supabase;

pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use error::CoreError;
pub use runtime::TabRuntime;
pub use supabase::{OAuthRedirect, OAuthTokens, SupabaseProvider};

// Re-export the types callers handle
pub use tabsync_session::{
    AuthError, AuthErrorKind, AuthSession, Credentials, IdentityProvider, MemoryProvider,
    Session, SessionState, SessionStatus, Subscription, User,
};
pub use tabsync_storage::{Clock, SharedStore, StorageError};

pub type Result<T> = std::result::Result<T, CoreError>;

/// Initialize logging
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).init();
}
