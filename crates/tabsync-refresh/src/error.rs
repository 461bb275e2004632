//! Refresh error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("Invalid retry policy: {0}")]
    InvalidPolicy(String),
}
