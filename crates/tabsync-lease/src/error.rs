//! Lease error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("Storage error: {0}")]
    Storage(#[from] tabsync_storage::StorageError),
}
