//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] tabsync_storage::StorageError),

    #[error("Lease error: {0}")]
    Lease(#[from] tabsync_lease::LeaseError),

    #[error("Authentication error: {0}")]
    Auth(#[from] tabsync_session::AuthError),

    #[error("Refresh error: {0}")]
    Refresh(#[from] tabsync_refresh::RefreshError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Coordinator destroyed")]
    Destroyed,
}
