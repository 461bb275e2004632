//! Tabsync Refresh Scheduler
//!
//! Renews the shared session shortly before it expires. Only the leader
//! tab runs a cycle, and every provider call is bracketed by a leadership
//! check so a demoted tab never publishes a renewal.

mod error;
mod policy;
mod scheduler;

pub use error::RefreshError;
pub use policy::RetryPolicy;
pub use scheduler::{RefreshEvent, RefreshScheduler};

pub type Result<T> = std::result::Result<T, RefreshError>;
