//! One coordinator per tab
//!
//! The application builds a `TabRuntime` at bootstrap and passes it to
//! whatever needs the session. The first `coordinator` call builds the
//! instance; later calls return it and ignore their arguments.

use std::sync::{Arc, OnceLock};

use tabsync_session::IdentityProvider;
use tabsync_storage::{Clock, SharedStore};

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::Result;

pub struct TabRuntime {
    store: SharedStore,
    clock: Clock,
    coordinator: OnceLock<Coordinator>,
}

impl TabRuntime {
    pub fn new(store: SharedStore) -> Self {
        Self::with_clock(store, Clock::new())
    }

    pub fn with_clock(store: SharedStore, clock: Clock) -> Self {
        Self {
            store,
            clock,
            coordinator: OnceLock::new(),
        }
    }

    pub fn coordinator(
        &self,
        provider: Arc<dyn IdentityProvider>,
        config: Config,
    ) -> Result<&Coordinator> {
        if let Some(existing) = self.coordinator.get() {
            if existing.config() != &config {
                tracing::debug!(
                    tab_id = %existing.tab_id(),
                    "Coordinator already configured; ignoring new config"
                );
            }
            return Ok(existing);
        }

        let built = Coordinator::builder(provider, self.store.clone())
            .config(config)
            .clock(self.clock)
            .build()?;
        Ok(self.coordinator.get_or_init(|| built))
    }

    /// The coordinator, if one was built.
    pub fn get(&self) -> Option<&Coordinator> {
        self.coordinator.get()
    }
}
