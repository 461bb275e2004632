//! Local subscribers to session state

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::state::SessionState;

type Callback = Arc<dyn Fn(&SessionState) + Send + Sync>;
type Entries = Mutex<Vec<(u64, Callback)>>;

/// Ordered callbacks; registration order is notification order.
#[derive(Clone, Default)]
pub struct SubscriberSet {
    entries: Arc<Entries>,
    next_id: Arc<AtomicU64>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, Arc::new(callback)));

        Subscription {
            id,
            entries: Arc::downgrade(&self.entries),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every subscriber with `state`.
    ///
    /// Iterates over a snapshot so callbacks may subscribe or unsubscribe
    /// freely; a callback removed mid-dispatch is skipped.
    pub fn notify(&self, state: &SessionState) {
        let snapshot: Vec<(u64, Callback)> = self.entries.lock().clone();

        for (id, callback) in snapshot {
            let still_registered = self.entries.lock().iter().any(|(i, _)| *i == id);
            if still_registered {
                callback(state);
            }
        }
    }
}

/// Handle returned by `subscribe`; cheap to clone into the callback itself.
#[derive(Clone)]
pub struct Subscription {
    id: u64,
    entries: Weak<Entries>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(entries) = self.entries.upgrade() {
            entries.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    #[test]
    fn test_notification_order() {
        let set = SubscriberSet::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            set.add(move |_| seen.lock().push(name));
        }

        set.notify(&SessionState::loading());
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unsubscribe_inside_own_callback() {
        let set = SubscriberSet::new();
        let calls = Arc::new(AtomicU64::new(0));
        let handle: Arc<OnceLock<Subscription>> = Arc::new(OnceLock::new());

        let subscription = {
            let calls = Arc::clone(&calls);
            let handle = Arc::clone(&handle);
            set.add(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(subscription) = handle.get() {
                    subscription.unsubscribe();
                }
            })
        };
        handle.set(subscription).ok();

        set.notify(&SessionState::loading());
        set.notify(&SessionState::unauthenticated());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_removed_mid_dispatch_is_skipped() {
        let set = SubscriberSet::new();
        let later_calls = Arc::new(AtomicU64::new(0));
        let later: Arc<OnceLock<Subscription>> = Arc::new(OnceLock::new());

        {
            let later = Arc::clone(&later);
            set.add(move |_| {
                if let Some(subscription) = later.get() {
                    subscription.unsubscribe();
                }
            });
        }
        let subscription = {
            let later_calls = Arc::clone(&later_calls);
            set.add(move |_| {
                later_calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        later.set(subscription).ok();

        set.notify(&SessionState::loading());
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
        assert_eq!(set.len(), 1);
    }
}
