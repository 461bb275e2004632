//! Session error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid state transition: {from} -> {transition}")]
    InvalidTransition { from: String, transition: String },
}
