//! Lease Manager
//!
//! Decides, from one tab's point of view, whether it leads:
//! - claim: write `{self, now + leader_timeout}`, wait, re-read, and lead
//!   only if the stored holder is still us (last writer wins)
//! - leader: rewrite the lease every heartbeat; seeing another holder
//!   demotes at once
//! - follower: poll every heartbeat and on change notices; contest the
//!   lease once it has expired
//!
//! Any storage failure is read as "not leader".

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use tabsync_storage::{get_json, set_json, Clock, StorageChannel};

use crate::lease::{LeaderLease, LeaseConfig};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub struct LeaseManager {
    inner: Arc<Inner>,
}

struct Inner {
    holder_id: String,
    channel: Arc<dyn StorageChannel>,
    clock: Clock,
    config: LeaseConfig,
    role: watch::Sender<Role>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaseManager {
    pub fn new(
        holder_id: impl Into<String>,
        channel: Arc<dyn StorageChannel>,
        clock: Clock,
        config: LeaseConfig,
    ) -> Self {
        let (role, _) = watch::channel(Role::Follower);

        Self {
            inner: Arc::new(Inner {
                holder_id: holder_id.into(),
                channel,
                clock,
                config,
                role,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.inner.holder_id
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.inner.config
    }

    /// Local belief; use `confirm_leadership` before acting on it.
    pub fn role(&self) -> Role {
        *self.inner.role.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn watch_role(&self) -> watch::Receiver<Role> {
        self.inner.role.subscribe()
    }

    pub fn read_lease(&self) -> Result<Option<LeaderLease>> {
        Ok(get_json(
            self.inner.channel.as_ref(),
            &self.inner.config.lease_key,
        )?)
    }

    fn write_lease(&self, lease: &LeaderLease) -> Result<()> {
        set_json(
            self.inner.channel.as_ref(),
            &self.inner.config.lease_key,
            lease,
        )?;
        Ok(())
    }

    fn lease_until(&self) -> chrono::DateTime<chrono::Utc> {
        let span = chrono::Duration::from_std(self.inner.config.leader_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        self.inner.clock.now() + span
    }

    /// Try to take the lease; returns whether this tab now leads.
    pub async fn try_claim(&self) -> bool {
        let now = self.inner.clock.now();

        match self.read_lease() {
            Ok(Some(lease)) if lease.is_valid_at(now) => {
                if lease.is_held_by(&self.inner.holder_id) {
                    return self.heartbeat();
                }
                self.set_role(Role::Follower);
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(holder_id = %self.inner.holder_id, error = %e, "Cannot read lease");
                self.set_role(Role::Follower);
                return false;
            }
        }

        let claim = LeaderLease::new(self.inner.holder_id.clone(), self.lease_until());
        if let Err(e) = self.write_lease(&claim) {
            tracing::warn!(
                holder_id = %self.inner.holder_id,
                error = %e,
                "Cannot write lease claim"
            );
            self.set_role(Role::Follower);
            return false;
        }

        // Writes are not atomic across tabs: only the last writer keeps the lease
        tokio::time::sleep(self.inner.config.claim_confirm_delay).await;

        let won = match self.read_lease() {
            Ok(Some(lease)) => lease.is_held_by(&self.inner.holder_id),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(
                    holder_id = %self.inner.holder_id,
                    error = %e,
                    "Cannot confirm lease claim"
                );
                false
            }
        };

        self.set_role(if won { Role::Leader } else { Role::Follower });
        won
    }

    /// Rewrite the lease with a fresh expiry if we still hold it.
    pub fn heartbeat(&self) -> bool {
        match self.read_lease() {
            Ok(Some(lease)) if lease.is_held_by(&self.inner.holder_id) => {
                let renewed = LeaderLease::new(self.inner.holder_id.clone(), self.lease_until());
                match self.write_lease(&renewed) {
                    Ok(()) => {
                        tracing::trace!(holder_id = %self.inner.holder_id, "Heartbeat");
                        self.set_role(Role::Leader);
                        true
                    }
                    Err(e) => {
                        tracing::warn!(
                            holder_id = %self.inner.holder_id,
                            error = %e,
                            "Heartbeat write failed"
                        );
                        self.set_role(Role::Follower);
                        false
                    }
                }
            }
            Ok(other) => {
                tracing::info!(
                    holder_id = %self.inner.holder_id,
                    current_holder = ?other.map(|lease| lease.holder_id),
                    "Leadership pre-empted"
                );
                self.set_role(Role::Follower);
                false
            }
            Err(e) => {
                tracing::warn!(
                    holder_id = %self.inner.holder_id,
                    error = %e,
                    "Heartbeat read failed"
                );
                self.set_role(Role::Follower);
                false
            }
        }
    }

    /// Re-read the stored lease and check it is still ours and live.
    pub fn confirm_leadership(&self) -> bool {
        if !self.is_leader() {
            return false;
        }

        let now = self.inner.clock.now();
        let confirmed = match self.read_lease() {
            Ok(Some(lease)) => lease.is_held_by(&self.inner.holder_id) && lease.is_valid_at(now),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(
                    holder_id = %self.inner.holder_id,
                    error = %e,
                    "Cannot confirm leadership"
                );
                false
            }
        };

        if !confirmed {
            self.set_role(Role::Follower);
        }
        confirmed
    }

    /// One election round.
    pub async fn tick(&self) -> Role {
        if self.is_leader() {
            self.heartbeat();
        } else {
            self.try_claim().await;
        }
        self.role()
    }

    /// Run the first election round, then keep electing in the background.
    ///
    /// Calling `start` while the loop is running only reports the role.
    pub async fn start(&self) -> Role {
        let ready = {
            let mut task = self.inner.task.lock();
            if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
                return self.role();
            }

            let (ready_tx, ready_rx) = oneshot::channel();
            let manager = self.clone();
            *task = Some(tokio::spawn(async move { manager.run(ready_tx).await }));
            ready_rx
        };

        ready.await.unwrap_or_else(|_| self.role())
    }

    /// Stop heartbeating without touching the stored lease.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.task.lock().take() {
            handle.abort();
            tracing::debug!(holder_id = %self.inner.holder_id, "Lease loop stopped");
        }
    }

    /// Give up leadership, expiring the lease now so followers need not
    /// wait out `leader_timeout`.
    pub fn release(&self) {
        match self.read_lease() {
            Ok(Some(lease)) if lease.is_held_by(&self.inner.holder_id) => {
                let released =
                    LeaderLease::new(self.inner.holder_id.clone(), self.inner.clock.now());
                match self.write_lease(&released) {
                    Ok(()) => tracing::info!(
                        holder_id = %self.inner.holder_id,
                        "Released leadership"
                    ),
                    Err(e) => {
                        tracing::warn!(
                            holder_id = %self.inner.holder_id,
                            error = %e,
                            "Cannot release lease"
                        )
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    holder_id = %self.inner.holder_id,
                    error = %e,
                    "Cannot read lease to release it"
                )
            }
        }

        self.set_role(Role::Follower);
    }

    async fn run(self, ready: oneshot::Sender<Role>) {
        let heartbeat = self.inner.config.heartbeat_interval;
        let mut changes = self.inner.channel.subscribe(&self.inner.config.lease_key);
        let mut bus_open = true;

        let role = self.tick().await;
        let _ = ready.send(role);

        let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                notice = changes.recv(), if bus_open => match notice {
                    Some(_) => self.on_lease_written().await,
                    None => {
                        tracing::warn!(
                            holder_id = %self.inner.holder_id,
                            "Change bus closed; polling only"
                        );
                        bus_open = false;
                    }
                },
            }
        }
    }

    /// Another tab wrote the lease.
    async fn on_lease_written(&self) {
        if !self.is_leader() {
            // Released or heartbeat; a live lease makes this a cheap read
            self.try_claim().await;
            return;
        }

        match self.read_lease() {
            Ok(Some(lease)) if lease.is_held_by(&self.inner.holder_id) => {}
            Ok(other) => {
                tracing::info!(
                    holder_id = %self.inner.holder_id,
                    current_holder = ?other.map(|lease| lease.holder_id),
                    "Leadership pre-empted"
                );
                self.set_role(Role::Follower);
            }
            Err(e) => {
                tracing::warn!(holder_id = %self.inner.holder_id, error = %e, "Cannot read lease");
                self.set_role(Role::Follower);
            }
        }
    }

    fn set_role(&self, role: Role) {
        let changed = self.inner.role.send_if_modified(|current| {
            if *current == role {
                false
            } else {
                *current = role;
                true
            }
        });

        if changed {
            tracing::info!(holder_id = %self.inner.holder_id, role = %role, "Leadership changed");
        }
    }
}

impl Clone for LeaseManager {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
