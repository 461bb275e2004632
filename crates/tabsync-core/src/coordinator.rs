//! Per-tab session coordinator
//!
//! The only surface the application talks to. It owns the tab's session
//! machine, lease manager and refresh scheduler, and wires them to the
//! shared storage channel:
//! - local sign-in/out is published under `<domain>:session`
//! - writes by other tabs arrive as `EXTERNAL_UPDATE`
//! - the scheduler runs only while the lease says this tab leads

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use tabsync_lease::{LeaseManager, Role};
use tabsync_refresh::{RefreshEvent, RefreshScheduler};
use tabsync_session::{
    AuthError, AuthErrorKind, AuthSession, Credentials, IdentityProvider, SessionMachine,
    SessionState, Subscription, Transition,
};
use tabsync_storage::{
    get_json, set_json, ChangeStream, Clock, Notice, SharedStore, StorageChannel,
};

use crate::config::Config;
use crate::error::CoreError;
use crate::Result;

pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    tab_id: String,
    config: Config,
    clock: Clock,
    session_key: String,
    provider: Arc<dyn IdentityProvider>,
    channel: Arc<dyn StorageChannel>,
    machine: SessionMachine,
    lease: LeaseManager,
    scheduler: RefreshScheduler,
    refresh_events: Mutex<Option<mpsc::UnboundedReceiver<RefreshEvent>>>,
    /// Held across the whole of `initialize`
    initialized: tokio::sync::Mutex<bool>,
    destroyed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct CoordinatorBuilder {
    provider: Arc<dyn IdentityProvider>,
    store: SharedStore,
    config: Config,
    clock: Option<Clock>,
    tab_id: Option<String>,
    hydrated: Option<AuthSession>,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn tab_id(mut self, tab_id: impl Into<String>) -> Self {
        self.tab_id = Some(tab_id.into());
        self
    }

    /// Start `authenticated` with a session restored elsewhere;
    /// `initialize` still verifies it.
    pub fn hydrated(mut self, auth: AuthSession) -> Self {
        self.hydrated = Some(auth);
        self
    }

    pub fn build(self) -> Result<Coordinator> {
        self.config.validate()?;

        let tab_id = self
            .tab_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let clock = self.clock.unwrap_or_default();
        let channel: Arc<dyn StorageChannel> = Arc::new(self.store.channel(tab_id.clone()));

        let machine = match self.hydrated {
            Some(auth) => SessionMachine::hydrated(auth, clock),
            None => SessionMachine::new(clock),
        };
        let lease = LeaseManager::new(
            tab_id.clone(),
            Arc::clone(&channel),
            clock,
            self.config.lease_config(),
        );
        let (scheduler, refresh_events) = RefreshScheduler::new(
            Arc::clone(&self.provider),
            lease.clone(),
            machine.watch(),
            self.config.retry_policy(),
            clock,
        );

        tracing::debug!(tab_id = %tab_id, domain = %self.config.domain, "Coordinator created");

        Ok(Coordinator {
            inner: Arc::new(Inner {
                session_key: self.config.session_key(),
                tab_id,
                config: self.config,
                clock,
                provider: self.provider,
                channel,
                machine,
                lease,
                scheduler,
                refresh_events: Mutex::new(Some(refresh_events)),
                initialized: tokio::sync::Mutex::new(false),
                destroyed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

impl Coordinator {
    pub fn builder(provider: Arc<dyn IdentityProvider>, store: SharedStore) -> CoordinatorBuilder {
        CoordinatorBuilder {
            provider,
            store,
            config: Config::default(),
            clock: None,
            tab_id: None,
            hydrated: None,
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.inner.tab_id
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.machine.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.machine.watch()
    }

    /// Register for local state changes. The callback runs synchronously on
    /// every transition and must not call back into the coordinator.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        self.inner.machine.subscribe(callback)
    }

    pub fn is_leader(&self) -> bool {
        self.inner.lease.is_leader()
    }

    /// Holder of the stored lease, whether or not it is still live.
    pub fn current_leader(&self) -> Result<Option<String>> {
        Ok(self.inner.lease.read_lease()?.map(|lease| lease.holder_id))
    }

    /// Hydrate, join the election and start listening to other tabs.
    ///
    /// Resolves with the first definitive state. Calling it again returns
    /// the current state.
    pub async fn initialize(&self) -> Result<SessionState> {
        let mut initialized = self.inner.initialized.lock().await;
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(CoreError::Destroyed);
        }
        if *initialized {
            return Ok(self.state());
        }

        // Writes racing the hydration read queue up here
        let changes = self.inner.channel.subscribe(&self.inner.session_key);
        self.hydrate().await;

        let roles = self.inner.lease.watch_role();
        let refresh_events = self.inner.refresh_events.lock().take();

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(self.clone().follow_shared_session(changes)));
        tasks.push(tokio::spawn(self.clone().follow_leadership(roles)));
        if let Some(events) = refresh_events {
            tasks.push(tokio::spawn(self.clone().follow_refresh(events)));
        }
        self.inner.tasks.lock().extend(tasks);

        let role = self.inner.lease.start().await;
        *initialized = true;

        let state = self.state();
        tracing::info!(
            tab_id = %self.inner.tab_id,
            status = %state.status,
            role = %role,
            "Coordinator initialized"
        );
        Ok(state)
    }

    pub async fn sign_in(&self, credentials: &Credentials) -> std::result::Result<(), AuthError> {
        let auth = self
            .inner
            .provider
            .sign_in_with_password(credentials)
            .await
            .map_err(|e| self.rejected("sign-in", e))?;
        self.establish(auth).await;
        Ok(())
    }

    /// Resolves without changing state when the provider wants the account
    /// confirmed first.
    pub async fn sign_up(&self, credentials: &Credentials) -> std::result::Result<(), AuthError> {
        let issued = self
            .inner
            .provider
            .sign_up(credentials)
            .await
            .map_err(|e| self.rejected("sign-up", e))?;

        match issued {
            Some(auth) => self.establish(auth).await,
            None => {
                tracing::info!(tab_id = %self.inner.tab_id, "Sign-up awaiting confirmation")
            }
        }
        Ok(())
    }

    pub async fn sign_in_with_oauth(
        &self,
        provider_name: &str,
    ) -> std::result::Result<(), AuthError> {
        let auth = self
            .inner
            .provider
            .sign_in_with_oauth(provider_name)
            .await
            .map_err(|e| self.rejected("oauth sign-in", e))?;
        self.establish(auth).await;
        Ok(())
    }

    /// Sign out here and in every other tab.
    ///
    /// Local state and the broadcast go first; a failing provider call is
    /// only logged.
    pub async fn sign_out(&self) {
        self.apply(Transition::SignOut);
        self.publish(None);
        tokio::task::yield_now().await;
        self.inner.scheduler.stop();
        self.inner.lease.release();

        if let Err(e) = self.inner.provider.sign_out().await {
            tracing::warn!(tab_id = %self.inner.tab_id, error = %e, "Provider sign-out failed");
        }
        tracing::info!(tab_id = %self.inner.tab_id, "Signed out");
    }

    /// Tear the tab down: stop every timer and give up leadership.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.scheduler.stop();
        self.inner.lease.stop();
        self.inner.lease.release();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        tracing::info!(tab_id = %self.inner.tab_id, "Coordinator destroyed");
    }

    async fn hydrate(&self) {
        let now = self.inner.clock.now();
        let stored = self
            .read_shared()
            .filter(|auth| !auth.session.is_expired_at(now));

        let answer = tokio::time::timeout(
            self.inner.config.init_timeout,
            self.inner.provider.get_session(),
        )
        .await
        .unwrap_or_else(|_| Err(AuthError::network("identity provider timed out")));

        let transition = match (answer, stored) {
            (Ok(Some(auth)), _) => Transition::SignInOk(auth),
            (Ok(None), Some(shared)) => self.adopt(shared),
            (Ok(None), None) => Transition::SignOut,
            (Err(e), Some(shared)) if e.kind == AuthErrorKind::Network => {
                tracing::warn!(
                    tab_id = %self.inner.tab_id,
                    error = %e,
                    "Provider unreachable; using shared session"
                );
                self.adopt(shared)
            }
            (Err(e), _) => {
                tracing::warn!(
                    tab_id = %self.inner.tab_id,
                    kind = %e.kind,
                    error = %e,
                    "Hydration failed"
                );
                Transition::SignInFail(e)
            }
        };

        self.transition(transition).await;
    }

    fn adopt(&self, shared: AuthSession) -> Transition {
        self.inner.provider.session_changed(Some(&shared));
        Transition::ExternalUpdate(Some(shared))
    }

    /// Published before yielding.
    async fn establish(&self, auth: AuthSession) {
        if let Some(state) = self.apply(Transition::SignInOk(auth)) {
            self.publish(state.auth_session().as_ref());
        }
        tokio::task::yield_now().await;
    }

    fn rejected(&self, operation: &str, error: AuthError) -> AuthError {
        tracing::warn!(
            tab_id = %self.inner.tab_id,
            operation,
            kind = %error.kind,
            error = %error,
            "Authentication rejected"
        );
        error
    }

    fn apply(&self, transition: Transition) -> Option<SessionState> {
        match self.inner.machine.apply(transition) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::debug!(tab_id = %self.inner.tab_id, error = %e, "Transition ignored");
                None
            }
        }
    }

    /// Apply a transition, then give other tasks a turn.
    async fn transition(&self, transition: Transition) -> Option<SessionState> {
        let applied = self.apply(transition);
        tokio::task::yield_now().await;
        applied
    }

    /// The last write to the session key, whoever made it.
    fn load_shared(&self) -> Result<Option<AuthSession>> {
        let record = get_json::<Option<AuthSession>>(
            self.inner.channel.as_ref(),
            &self.inner.session_key,
        )?;
        Ok(record.flatten())
    }

    fn read_shared(&self) -> Option<AuthSession> {
        match self.load_shared() {
            Ok(shared) => shared,
            Err(e) => {
                tracing::warn!(
                    tab_id = %self.inner.tab_id,
                    error = %e,
                    "Cannot read shared session"
                );
                None
            }
        }
    }

    fn publish(&self, auth: Option<&AuthSession>) {
        if let Err(e) = set_json(self.inner.channel.as_ref(), &self.inner.session_key, &auth) {
            tracing::warn!(
                tab_id = %self.inner.tab_id,
                error = %e,
                "Cannot publish shared session"
            );
        }
    }

    async fn follow_shared_session(self, mut changes: ChangeStream) {
        // A notice only says the key moved; concurrent writers can be
        // delivered in any order, so the store decides.
        while let Some(notice) = changes.recv().await {
            let shared = match self.load_shared() {
                Ok(shared) => shared,
                Err(e) => {
                    tracing::warn!(
                        tab_id = %self.inner.tab_id,
                        error = %e,
                        "Ignoring unreadable shared session"
                    );
                    continue;
                }
            };

            tracing::debug!(
                tab_id = %self.inner.tab_id,
                signed_in = shared.is_some(),
                missed = matches!(notice, Notice::Missed),
                "Shared session changed"
            );
            self.inner.provider.session_changed(shared.as_ref());
            self.transition(Transition::ExternalUpdate(shared)).await;
        }
    }

    async fn follow_leadership(self, mut roles: watch::Receiver<Role>) {
        loop {
            let role = *roles.borrow_and_update();
            match role {
                Role::Leader => {
                    if self.inner.scheduler.start() {
                        tracing::info!(tab_id = %self.inner.tab_id, "Refresh scheduling started");
                    }
                }
                Role::Follower => {
                    if self.inner.scheduler.is_running() {
                        self.inner.scheduler.stop();
                        tracing::info!(tab_id = %self.inner.tab_id, "Refresh scheduling stopped");
                    }
                }
            }

            if roles.changed().await.is_err() {
                break;
            }
        }
    }

    async fn follow_refresh(self, mut events: mpsc::UnboundedReceiver<RefreshEvent>) {
        while let Some(event) = events.recv().await {
            let current = self.state();
            if current.session.as_ref() != Some(event.previous()) {
                tracing::debug!(
                    tab_id = %self.inner.tab_id,
                    "Discarding renewal of a replaced session"
                );
                continue;
            }
            if !self.inner.lease.confirm_leadership() {
                tracing::debug!(
                    tab_id = %self.inner.tab_id,
                    "Discarding renewal result after losing leadership"
                );
                continue;
            }

            match event {
                RefreshEvent::Renewed { renewed, .. } => {
                    if let Some(state) = self.apply(Transition::RefreshOk(renewed.session)) {
                        self.publish(state.auth_session().as_ref());
                    }
                }
                RefreshEvent::Exhausted { error, attempts, .. } => {
                    tracing::error!(
                        tab_id = %self.inner.tab_id,
                        attempts,
                        error = %error,
                        "Session renewal exhausted; signing out everywhere"
                    );
                    self.apply(Transition::RefreshFail {
                        error,
                        attempt: attempts,
                    });
                    self.publish(None);
                    self.inner.provider.session_changed(None);
                }
            }
            tokio::task::yield_now().await;
        }
    }
}

impl Clone for Coordinator {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tabsync_session::{MemoryProvider, SessionStatus};

    fn config() -> Config {
        Config {
            domain: "test".to_string(),
            refresh_threshold: Duration::from_secs(2 * 60),
            heartbeat_interval: Duration::from_secs(1),
            leader_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            claim_confirm_delay: Duration::from_millis(50),
            init_timeout: Duration::from_secs(2),
        }
    }

    struct World {
        clock: Clock,
        store: SharedStore,
        provider: Arc<MemoryProvider>,
    }

    impl World {
        fn new() -> Self {
            let clock = Clock::new();
            let provider = Arc::new(MemoryProvider::new(clock, chrono::Duration::minutes(10)));
            provider.add_account("ada@example.com", "pw");
            Self {
                clock,
                store: SharedStore::open_in_memory().unwrap(),
                provider,
            }
        }

        /// Tabs of one browser share the provider and the store.
        async fn tab(&self, id: &str) -> Coordinator {
            let tab = Coordinator::builder(self.provider.clone(), self.store.clone())
                .config(config())
                .clock(self.clock)
                .tab_id(id)
                .build()
                .unwrap();
            tab.initialize().await.unwrap();
            tab
        }
    }

    fn ada() -> Credentials {
        Credentials::new("ada@example.com", "pw")
    }

    fn recording(tab: &Coordinator) -> Arc<Mutex<Vec<SessionStatus>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        tab.subscribe(move |state| sink.lock().push(state.status));
        seen
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_without_session() {
        let world = World::new();
        let tab = Coordinator::builder(world.provider.clone(), world.store.clone())
            .config(config())
            .clock(world.clock)
            .build()
            .unwrap();
        assert_eq!(tab.state().status, SessionStatus::Loading);

        let state = tab.initialize().await.unwrap();

        assert_eq!(state.status, SessionStatus::Unauthenticated);
        assert!(tab.is_leader());
        assert_eq!(tab.current_leader().unwrap().as_deref(), Some(tab.tab_id()));

        // Idempotent
        assert_eq!(tab.initialize().await.unwrap(), state);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_adopts_provider_session() {
        let world = World::new();
        world.provider.sign_in_with_password(&ada()).await.unwrap();

        let tab = world.tab("tab-1").await;

        let state = tab.state();
        assert_eq!(state.status, SessionStatus::Authenticated);
        assert_eq!(state.user.unwrap().email.as_deref(), Some("ada@example.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hydrated_tab_is_verified_on_initialize() {
        let world = World::new();
        let stale = world.provider.mint(tabsync_session::User::new("ghost", None));
        world.provider.sign_out().await.unwrap();

        let tab = Coordinator::builder(world.provider.clone(), world.store.clone())
            .config(config())
            .clock(world.clock)
            .hydrated(stale)
            .build()
            .unwrap();
        assert_eq!(tab.state().status, SessionStatus::Authenticated);

        let state = tab.initialize().await.unwrap();
        assert_eq!(state.status, SessionStatus::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_propagates_to_other_tabs() {
        let world = World::new();
        let tab1 = world.tab("tab-1").await;
        let tab2 = world.tab("tab-2").await;
        let seen = recording(&tab2);

        tab1.sign_in(&ada()).await.unwrap();
        assert_eq!(tab1.state().status, SessionStatus::Authenticated);

        settle().await;
        let state = tab2.state();
        assert_eq!(state.status, SessionStatus::Authenticated);
        assert_eq!(state.session, tab1.state().session);
        assert_eq!(*seen.lock(), vec![SessionStatus::Authenticated]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_is_observed_by_other_tabs() {
        let world = World::new();
        let tab1 = world.tab("tab-1").await;
        let tab2 = world.tab("tab-2").await;

        tab1.sign_in(&ada()).await.unwrap();
        settle().await;
        assert!(tab2.state().is_authenticated());

        tab2.sign_out().await;
        assert_eq!(tab2.state().status, SessionStatus::Unauthenticated);

        settle().await;
        let state = tab1.state();
        assert_eq!(state.status, SessionStatus::Unauthenticated);
        assert!(state.user.is_none() && state.session.is_none());
        assert!(world.provider.current().is_none());
    }

    fn stored_status(tab: &Coordinator) -> SessionStatus {
        match tab.load_shared().unwrap() {
            Some(_) => SessionStatus::Authenticated,
            None => SessionStatus::Unauthenticated,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_sign_in_and_sign_out_converge() {
        let world = World::new();
        let tab1 = world.tab("tab-1").await;
        let tab2 = world.tab("tab-2").await;

        let user = ada();
        let (signed_in, ()) = tokio::join!(tab1.sign_in(&user), tab2.sign_out());
        signed_in.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        let stored = stored_status(&tab1);
        assert_eq!(tab1.state().status, stored);
        assert_eq!(tab2.state().status, stored);
        assert_eq!(tab1.state().session, tab2.state().session);
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_sign_out_and_sign_in_converge() {
        let world = World::new();
        let tab1 = world.tab("tab-1").await;
        let tab2 = world.tab("tab-2").await;
        tab1.sign_in(&ada()).await.unwrap();
        settle().await;

        let user = ada();
        let ((), signed_in) = tokio::join!(tab1.sign_out(), tab2.sign_in(&user));
        signed_in.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        let stored = stored_status(&tab2);
        assert_eq!(tab1.state().status, stored);
        assert_eq!(tab2.state().status, stored);
        assert_eq!(tab1.state().session, tab2.state().session);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_drops_late_refresh_result() {
        let world = World::new();
        let tab1 = world.tab("tab-1").await;
        let tab2 = world.tab("tab-2").await;
        tab1.sign_in(&ada()).await.unwrap();
        settle().await;
        assert!(tab1.is_leader() && !tab2.is_leader());

        // An exhaustion reported after tab-2 lost the lease
        let (events, receiver) = mpsc::unbounded_channel();
        let listener = tokio::spawn(tab2.clone().follow_refresh(receiver));
        events
            .send(RefreshEvent::Exhausted {
                previous: tab2.state().session.unwrap(),
                error: AuthError::network("offline"),
                attempts: 4,
            })
            .unwrap();
        settle().await;
        listener.abort();

        assert!(tab2.state().is_authenticated());
        assert!(tab1.state().is_authenticated());
        assert_eq!(stored_status(&tab1), SessionStatus::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_credentials_leave_state_untouched() {
        let world = World::new();
        let tab = world.tab("tab-1").await;
        let seen = recording(&tab);

        let err = tab
            .sign_in(&Credentials::new("ada@example.com", "wrong"))
            .await
            .unwrap_err();

        assert_eq!(err.kind, AuthErrorKind::InvalidCredentials);
        assert_eq!(tab.state().status, SessionStatus::Unauthenticated);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_operation_notifies_exactly_once() {
        let world = World::new();
        let tab1 = world.tab("tab-1").await;
        let _tab2 = world.tab("tab-2").await;
        let seen = recording(&tab1);

        tab1.sign_in(&ada()).await.unwrap();
        tab1.sign_out().await;
        tab1.sign_in(&ada()).await.unwrap();
        settle().await;

        assert_eq!(
            *seen.lock(),
            vec![
                SessionStatus::Authenticated,
                SessionStatus::Unauthenticated,
                SessionStatus::Authenticated,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_inside_callback() {
        let world = World::new();
        let tab = world.tab("tab-1").await;
        let calls = Arc::new(Mutex::new(0));

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let counter = Arc::clone(&calls);
        let handle = Arc::clone(&slot);
        let subscription = tab.subscribe(move |_| {
            *counter.lock() += 1;
            if let Some(subscription) = handle.lock().take() {
                subscription.unsubscribe();
            }
        });
        *slot.lock() = Some(subscription);

        tab.sign_in(&ada()).await.unwrap();
        tab.sign_out().await;

        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_up_and_oauth() {
        let world = World::new();
        world.provider.allow_oauth("github");
        let tab = world.tab("tab-1").await;

        world.provider.require_confirmation(true);
        tab.sign_up(&Credentials::new("new@example.com", "pw"))
            .await
            .unwrap();
        assert_eq!(tab.state().status, SessionStatus::Unauthenticated);

        let err = tab.sign_in_with_oauth("myspace").await.unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::ProviderError);
        assert_eq!(tab.state().status, SessionStatus::Unauthenticated);

        tab.sign_in_with_oauth("github").await.unwrap();
        assert_eq!(tab.state().status, SessionStatus::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_the_leader_renews() {
        let world = World::new();
        let tab1 = world.tab("tab-1").await;
        let tab2 = world.tab("tab-2").await;
        let tab3 = world.tab("tab-3").await;

        tab1.sign_in(&ada()).await.unwrap();
        let signed_in = tab1.state().session.unwrap();

        tokio::time::sleep(Duration::from_secs(8 * 60 + 1)).await;

        assert_eq!(world.provider.renewals().len(), 1);
        let leaders = [&tab1, &tab2, &tab3]
            .iter()
            .filter(|tab| tab.is_leader())
            .count();
        assert_eq!(leaders, 1);

        // Every tab converged on the renewed session
        for tab in [&tab1, &tab2, &tab3] {
            let session = tab.state().session.unwrap();
            assert_ne!(session, signed_in);
            assert_eq!(Some(&session), world.provider.current().map(|a| a.session).as_ref());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_takes_over_renewal_after_leader_dies() {
        let world = World::new();
        let tab1 = world.tab("tab-1").await;
        let tab2 = world.tab("tab-2").await;
        assert!(tab1.is_leader());
        assert!(!tab2.is_leader());

        tab1.sign_in(&ada()).await.unwrap();
        let expires_at = tab1.state().session.unwrap().expires_at;

        // Simulated crash: timers stop, nothing is released
        tab1.inner.lease.stop();
        tab1.inner.scheduler.stop();

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(tab2.is_leader());
        assert_eq!(tab2.current_leader().unwrap().as_deref(), Some("tab-2"));
        assert!(world.provider.renewals().is_empty());

        tokio::time::sleep(Duration::from_secs(8 * 60)).await;
        let renewals = world.provider.renewals();
        assert_eq!(renewals.len(), 1);
        let due = expires_at - chrono::Duration::minutes(2);
        assert!(renewals[0] >= due && renewals[0] - due < chrono::Duration::seconds(1));
        assert!(tab2.state().is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_renewal_signs_out_everywhere() {
        let world = World::new();
        let tab1 = world.tab("tab-1").await;
        let tab2 = world.tab("tab-2").await;

        tab1.sign_in(&ada()).await.unwrap();
        world
            .provider
            .fail_renewals((0..4).map(|_| AuthError::network("offline")));

        tokio::time::sleep(Duration::from_secs(8 * 60 + 10)).await;

        let renewals = world.provider.renewals();
        assert_eq!(renewals.len(), 4);

        let state = tab1.state();
        assert_eq!(state.status, SessionStatus::Error);
        assert_eq!(state.error.unwrap().kind, AuthErrorKind::SessionExpired);
        assert_eq!(tab2.state().status, SessionStatus::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_hands_leadership_over() {
        let world = World::new();
        let tab1 = world.tab("tab-1").await;
        let tab2 = world.tab("tab-2").await;

        tab1.sign_in(&ada()).await.unwrap();
        tab1.sign_out().await;
        assert!(!tab1.is_leader());

        settle().await;
        assert!(tab2.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_releases_leadership_immediately() {
        let world = World::new();
        let tab1 = world.tab("tab-1").await;
        let tab2 = world.tab("tab-2").await;

        tab1.destroy();
        tab1.destroy();
        assert!(matches!(tab1.initialize().await, Err(CoreError::Destroyed)));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(tab2.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_falls_back_to_shared_session_when_provider_is_down() {
        let world = World::new();
        let tab1 = world.tab("tab-1").await;
        tab1.sign_in(&ada()).await.unwrap();

        let offline = Arc::new(Offline);
        let tab2 = Coordinator::builder(offline, world.store.clone())
            .config(config())
            .clock(world.clock)
            .tab_id("tab-2")
            .build()
            .unwrap();

        let state = tab2.initialize().await.unwrap();
        assert_eq!(state.status, SessionStatus::Authenticated);
        assert_eq!(state.session, tab1.state().session);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_without_fallback_reports_error() {
        let world = World::new();
        let tab = Coordinator::builder(Arc::new(Offline), world.store.clone())
            .config(config())
            .clock(world.clock)
            .build()
            .unwrap();

        let state = tab.initialize().await.unwrap();
        assert_eq!(state.status, SessionStatus::Error);
        assert_eq!(state.error.unwrap().kind, AuthErrorKind::Network);
    }

    /// Never answers `get_session`; everything else fails.
    struct Offline;

    #[async_trait::async_trait]
    impl IdentityProvider for Offline {
        async fn get_session(&self) -> std::result::Result<Option<AuthSession>, AuthError> {
            std::future::pending().await
        }

        async fn sign_in_with_password(
            &self,
            _credentials: &Credentials,
        ) -> std::result::Result<AuthSession, AuthError> {
            Err(AuthError::network("offline"))
        }

        async fn sign_up(
            &self,
            _credentials: &Credentials,
        ) -> std::result::Result<Option<AuthSession>, AuthError> {
            Err(AuthError::network("offline"))
        }

        async fn sign_in_with_oauth(
            &self,
            _provider_name: &str,
        ) -> std::result::Result<AuthSession, AuthError> {
            Err(AuthError::network("offline"))
        }

        async fn sign_out(&self) -> std::result::Result<(), AuthError> {
            Err(AuthError::network("offline"))
        }

        async fn renew_session(
            &self,
            _current: &tabsync_session::Session,
        ) -> std::result::Result<AuthSession, AuthError> {
            Err(AuthError::network("offline"))
        }
    }
}
