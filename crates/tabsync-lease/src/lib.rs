//! Tabsync Leader Lease
//!
//! Lease-based, last-writer-wins election of the one tab allowed to renew
//! the shared session. Leadership is advisory: the lease is never
//! read-modify-written atomically, so two tabs may briefly both believe
//! they lead. Anything with side effects re-checks `confirm_leadership`
//! first, and the overlap heals within one heartbeat.

mod error;
mod lease;
mod manager;

pub use error::LeaseError;
pub use lease::{LeaderLease, LeaseConfig};
pub use manager::{LeaseManager, Role};

pub type Result<T> = std::result::Result<T, LeaseError>;
