//! Tabsync Storage Layer
//!
//! The shared storage channel every tab of an origin sees: a SQLite-backed
//! key/value table plus a change bus that tells the other tabs a key was
//! written. Writes are last-writer-wins; there is no compare-and-swap.

mod channel;
mod clock;
mod database;
mod error;
mod migrations;

pub use channel::{
    get_json, set_json, ChangeEvent, ChangeStream, Notice, SharedStore, StorageChannel,
    TabChannel,
};
pub use clock::Clock;
pub use database::Database;
pub use error::StorageError;

pub type Result<T> = std::result::Result<T, StorageError>;
