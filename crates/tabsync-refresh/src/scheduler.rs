//! Refresh Scheduler
//!
//! A cycle follows the tab's session through the state watch channel and
//! sleeps until `expires_at - refresh_threshold`. It then renews with
//! exponential backoff, checking leadership before and after each
//! provider call. Results go to the coordinator as `RefreshEvent`s; a
//! cycle that loses leadership ends without reporting anything.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use tabsync_lease::LeaseManager;
use tabsync_session::{AuthError, AuthSession, IdentityProvider, Session, SessionState};
use tabsync_storage::Clock;

use crate::policy::RetryPolicy;

#[derive(Debug, Clone)]
pub enum RefreshEvent {
    Renewed {
        previous: Session,
        renewed: AuthSession,
    },
    /// Every attempt failed, or the failure was not worth retrying.
    Exhausted {
        previous: Session,
        error: AuthError,
        attempts: u32,
    },
}

impl RefreshEvent {
    /// The session the cycle set out to renew.
    pub fn previous(&self) -> &Session {
        match self {
            RefreshEvent::Renewed { previous, .. } | RefreshEvent::Exhausted { previous, .. } => {
                previous
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleControl {
    Run,
    Stop,
}

struct Cycle {
    control: watch::Sender<CycleControl>,
    handle: JoinHandle<()>,
}

impl Cycle {
    fn is_live(&self) -> bool {
        !self.handle.is_finished() && *self.control.borrow() == CycleControl::Run
    }
}

enum Outcome {
    Finished(RefreshEvent),
    Abandoned,
}

pub struct RefreshScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    provider: Arc<dyn IdentityProvider>,
    lease: LeaseManager,
    sessions: watch::Receiver<SessionState>,
    events: mpsc::UnboundedSender<RefreshEvent>,
    policy: RetryPolicy,
    clock: Clock,
    cycle: Mutex<Option<Cycle>>,
}

impl RefreshScheduler {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        lease: LeaseManager,
        sessions: watch::Receiver<SessionState>,
        policy: RetryPolicy,
        clock: Clock,
    ) -> (Self, mpsc::UnboundedReceiver<RefreshEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();

        let scheduler = Self {
            inner: Arc::new(Inner {
                provider,
                lease,
                sessions,
                events,
                policy,
                clock,
                cycle: Mutex::new(None),
            }),
        };
        (scheduler, events_rx)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// Start a cycle; returns false if one is already running.
    pub fn start(&self) -> bool {
        let mut cycle = self.inner.cycle.lock();
        if cycle.as_ref().is_some_and(Cycle::is_live) {
            return false;
        }

        let (control, control_rx) = watch::channel(CycleControl::Run);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { run_cycle(inner, control_rx).await });

        *cycle = Some(Cycle { control, handle });
        tracing::debug!("Refresh cycle started");
        true
    }

    /// Cancel the running cycle. A provider call already in flight finishes,
    /// but its result is dropped.
    pub fn stop(&self) {
        if let Some(cycle) = self.inner.cycle.lock().take() {
            cycle.control.send_replace(CycleControl::Stop);
            tracing::debug!("Refresh cycle stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.cycle.lock().as_ref().is_some_and(Cycle::is_live)
    }
}

impl Clone for RefreshScheduler {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn is_stopped(control: &watch::Receiver<CycleControl>) -> bool {
    *control.borrow() == CycleControl::Stop
}

async fn stopped(control: &mut watch::Receiver<CycleControl>) {
    loop {
        if *control.borrow_and_update() == CycleControl::Stop {
            return;
        }
        if control.changed().await.is_err() {
            return;
        }
    }
}

async fn run_cycle(inner: Arc<Inner>, mut control: watch::Receiver<CycleControl>) {
    let mut sessions = inner.sessions.clone();
    // Last session a result was reported for; waits for the coordinator to apply it
    let mut handled: Option<Session> = None;

    loop {
        if is_stopped(&control) {
            break;
        }

        let current = sessions.borrow_and_update().session.clone();
        let pending = current.filter(|session| handled.as_ref() != Some(session));

        let Some(session) = pending else {
            tokio::select! {
                changed = sessions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = stopped(&mut control) => break,
            }
            continue;
        };

        let wait = inner.policy.wait_until_due(&session, inner.clock.now());
        tracing::debug!(
            expires_at = %session.expires_at,
            wait_ms = wait.as_millis() as u64,
            "Renewal scheduled"
        );

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = sessions.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = stopped(&mut control) => break,
        }

        match renew_with_retry(&inner, &session, &mut control).await {
            Outcome::Finished(event) => {
                handled = Some(session);
                if inner.events.send(event).is_err() {
                    break;
                }
            }
            Outcome::Abandoned => break,
        }
    }

    tracing::debug!("Refresh cycle ended");
}

async fn renew_with_retry(
    inner: &Inner,
    session: &Session,
    control: &mut watch::Receiver<CycleControl>,
) -> Outcome {
    let mut attempt: u32 = 0;

    loop {
        if is_stopped(control) || !inner.lease.confirm_leadership() {
            tracing::debug!(attempt, "Renewal abandoned before provider call");
            return Outcome::Abandoned;
        }

        tracing::debug!(attempt, "Renewing session");
        let result = inner.provider.renew_session(session).await;

        // Leadership may have moved while the call was in flight
        if is_stopped(control) || !inner.lease.confirm_leadership() {
            tracing::info!(attempt, "Discarding renewal result; no longer leader");
            return Outcome::Abandoned;
        }

        let error = match result {
            Ok(renewed) => {
                tracing::info!(
                    attempt,
                    expires_at = %renewed.session.expires_at,
                    "Session renewed"
                );
                return Outcome::Finished(RefreshEvent::Renewed {
                    previous: session.clone(),
                    renewed,
                });
            }
            Err(error) => error,
        };

        if !error.kind.is_retryable() || attempt >= inner.policy.max_retries {
            tracing::warn!(
                attempts = attempt + 1,
                kind = %error.kind,
                error = %error,
                "Renewal exhausted"
            );
            return Outcome::Finished(RefreshEvent::Exhausted {
                previous: session.clone(),
                error,
                attempts: attempt + 1,
            });
        }

        let delay = inner.policy.backoff(attempt);
        tracing::warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Renewal failed; retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stopped(control) => return Outcome::Abandoned,
        }
        attempt += 1;
    }
}
