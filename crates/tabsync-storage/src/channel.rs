//! Shared storage channel
//!
//! `SharedStore` is the origin-wide store; each tab talks to it through its
//! own `TabChannel`, which tags writes with the tab id so change notices are
//! delivered to every tab except the writer.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tokio::sync::broadcast;

use crate::database::Database;
use crate::Result;

const BUS_CAPACITY: usize = 256;

/// A write observed on the change bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: String,
    pub value: String,
    pub writer: String,
}

/// What a `ChangeStream` hands to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Another tab wrote this value to the watched key.
    Changed(String),
    /// The observer fell behind the bus; re-read the key.
    Missed,
}

pub trait StorageChannel: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Change notices for `key` written by other tabs, in write order.
    fn subscribe(&self, key: &str) -> ChangeStream;
}

pub fn get_json<T: DeserializeOwned>(channel: &dyn StorageChannel, key: &str) -> Result<Option<T>> {
    match channel.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn set_json<T: Serialize + ?Sized>(
    channel: &dyn StorageChannel,
    key: &str,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    channel.set(key, &raw)
}

#[derive(Clone)]
pub struct SharedStore {
    db: Database,
    bus: broadcast::Sender<ChangeEvent>,
}

impl SharedStore {
    pub fn new(db: Database) -> Self {
        Self::with_capacity(db, BUS_CAPACITY)
    }

    pub fn with_capacity(db: Database, capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(capacity);
        Self { db, bus }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// The channel handle for one tab.
    pub fn channel(&self, tab_id: impl Into<String>) -> TabChannel {
        TabChannel {
            store: self.clone(),
            tab_id: tab_id.into(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

pub struct TabChannel {
    store: SharedStore,
    tab_id: String,
}

impl TabChannel {
    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }
}

impl StorageChannel for TabChannel {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.store.db.get_entry(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.store.db.put_entry(key, value, &self.tab_id)?;

        // No receivers just means no other tab is listening yet
        let _ = self.store.bus.send(ChangeEvent {
            key: key.to_string(),
            value: value.to_string(),
            writer: self.tab_id.clone(),
        });

        tracing::trace!(tab_id = %self.tab_id, key = %key, "Wrote channel entry");
        Ok(())
    }

    fn subscribe(&self, key: &str) -> ChangeStream {
        ChangeStream {
            rx: self.store.bus.subscribe(),
            key: key.to_string(),
            own_writer: self.tab_id.clone(),
        }
    }
}

pub struct ChangeStream {
    rx: broadcast::Receiver<ChangeEvent>,
    key: String,
    own_writer: String,
}

impl ChangeStream {
    /// Next notice for the watched key, or `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<Notice> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.key == self.key && event.writer != self.own_writer => {
                    return Some(Notice::Changed(event.value));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(key = %self.key, skipped, "Change stream lagged behind the bus");
                    return Some(Notice::Missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        holder: String,
        ttl: u64,
    }

    #[tokio::test]
    async fn test_writes_are_visible_to_every_tab() {
        let store = SharedStore::open_in_memory().unwrap();
        let tab_a = store.channel("tab-a");
        let tab_b = store.channel("tab-b");

        tab_a.set("auth:session", "null").unwrap();
        assert_eq!(tab_b.get("auth:session").unwrap(), Some("null".to_string()));
        assert_eq!(tab_b.get("auth:leader").unwrap(), None);
    }

    #[tokio::test]
    async fn test_writer_does_not_observe_its_own_writes() {
        let store = SharedStore::open_in_memory().unwrap();
        let tab_a = store.channel("tab-a");
        let tab_b = store.channel("tab-b");

        let mut own = tab_a.subscribe("auth:session");
        let mut other = tab_b.subscribe("auth:session");

        tab_a.set("auth:session", "one").unwrap();
        tab_b.set("auth:session", "two").unwrap();

        assert_eq!(other.recv().await, Some(Notice::Changed("one".to_string())));
        assert_eq!(own.recv().await, Some(Notice::Changed("two".to_string())));
    }

    #[tokio::test]
    async fn test_same_key_writes_arrive_in_order() {
        let store = SharedStore::open_in_memory().unwrap();
        let writer = store.channel("tab-a");
        let observer = store.channel("tab-b");
        let mut stream = observer.subscribe("auth:leader");

        writer.set("auth:session", "ignored").unwrap();
        for value in ["1", "2", "3"] {
            writer.set("auth:leader", value).unwrap();
        }

        for value in ["1", "2", "3"] {
            assert_eq!(stream.recv().await, Some(Notice::Changed(value.to_string())));
        }
    }

    #[tokio::test]
    async fn test_lagging_observer_is_told_to_resync() {
        let store = SharedStore::with_capacity(Database::open_in_memory().unwrap(), 2);
        let writer = store.channel("tab-a");
        let observer = store.channel("tab-b");
        let mut stream = observer.subscribe("auth:leader");

        for value in ["1", "2", "3", "4"] {
            writer.set("auth:leader", value).unwrap();
        }

        assert_eq!(stream.recv().await, Some(Notice::Missed));
        assert_eq!(observer.get("auth:leader").unwrap(), Some("4".to_string()));
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let store = SharedStore::open_in_memory().unwrap();
        let channel = store.channel("tab-a");

        let record = Record {
            holder: "tab-a".to_string(),
            ttl: 15,
        };
        set_json(&channel, "auth:leader", &record).unwrap();

        let read: Option<Record> = get_json(&channel, "auth:leader").unwrap();
        assert_eq!(read, Some(record));

        channel.set("auth:broken", "{not json").unwrap();
        assert!(get_json::<Record>(&channel, "auth:broken").is_err());
    }
}
