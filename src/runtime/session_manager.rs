//! Session ownership for one runtime.
//!
//! Workers reserve a slot before a fetch that may claim a new session, so the
//! number of owned sessions never exceeds `max_sessions_per_runtime` even with
//! concurrent fetches. A background sweeper renews the leases of owned sessions,
//! releases sessions idle for longer than `session_idle_timeout`, and asks the
//! provider to drop expired sessions nobody holds.

use super::{RuntimeOptions, calculate_renewal_interval};
use crate::providers::{Provider, SessionFetchConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Debug)]
struct OwnedSession {
    in_flight: usize,
    last_activity: Instant,
}

#[derive(Debug, Default)]
struct Slots {
    owned: HashMap<String, OwnedSession>,
    reserved: usize,
}

/// Slot held by a worker across one fetch. Must be given back through
/// [`SessionManager::on_fetched`] or [`SessionManager::release_reservation`].
#[derive(Debug)]
pub(crate) struct Reservation {
    held: bool,
}

impl Reservation {
    pub(crate) fn can_claim_new(&self) -> bool {
        self.held
    }
}

#[derive(Debug)]
pub(crate) struct SessionManager {
    owner_id: String,
    max_sessions: usize,
    lock_timeout: Duration,
    idle_timeout: Duration,
    slots: Mutex<Slots>,
}

impl SessionManager {
    pub(crate) fn new(owner_id: String, options: &RuntimeOptions) -> Self {
        Self {
            owner_id,
            max_sessions: options.max_sessions_per_runtime,
            lock_timeout: options.session_lock_timeout,
            idle_timeout: options.session_idle_timeout,
            slots: Mutex::new(Slots::default()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub(crate) fn owned_count(&self) -> usize {
        self.slots().owned.len()
    }

    /// Take a free slot if there is one.
    pub(crate) fn try_reserve(&self) -> Reservation {
        let mut slots = self.slots();
        let held = slots.owned.len() + slots.reserved < self.max_sessions;
        if held {
            slots.reserved += 1;
        }
        Reservation { held }
    }

    pub(crate) fn fetch_config(&self, reservation: &Reservation) -> SessionFetchConfig {
        SessionFetchConfig {
            owner_id: self.owner_id.clone(),
            lock_timeout: self.lock_timeout,
            can_claim_new: reservation.can_claim_new(),
        }
    }

    pub(crate) fn release_reservation(&self, reservation: Reservation) {
        if reservation.held {
            let mut slots = self.slots();
            slots.reserved = slots.reserved.saturating_sub(1);
        }
    }

    /// Record that a fetched item runs on `session_id`; consumes the reservation.
    pub(crate) fn on_fetched(&self, session_id: Option<&str>, reservation: Reservation) {
        let mut slots = self.slots();
        if reservation.held {
            slots.reserved = slots.reserved.saturating_sub(1);
        }
        let Some(session_id) = session_id else {
            return;
        };
        let entry = slots.owned.entry(session_id.to_string()).or_insert_with(|| {
            debug!(target: "duralane::runtime::sessions", owner_id = %self.owner_id, session_id, "Session claimed");
            OwnedSession {
                in_flight: 0,
                last_activity: Instant::now(),
            }
        });
        entry.in_flight += 1;
        entry.last_activity = Instant::now();
    }

    pub(crate) fn on_finished(&self, session_id: Option<&str>) {
        let Some(session_id) = session_id else {
            return;
        };
        if let Some(session) = self.slots().owned.get_mut(session_id) {
            session.in_flight = session.in_flight.saturating_sub(1);
            session.last_activity = Instant::now();
        }
    }

    /// One maintenance pass: renew live sessions, release idle ones, clean orphans.
    pub(crate) async fn sweep(&self, store: &dyn Provider) {
        let (live, idle): (Vec<String>, Vec<String>) = {
            let slots = self.slots();
            let now = Instant::now();
            let mut live = Vec::new();
            let mut idle = Vec::new();
            for (id, session) in &slots.owned {
                if session.in_flight == 0 && now.duration_since(session.last_activity) >= self.idle_timeout {
                    idle.push(id.clone());
                } else {
                    live.push(id.clone());
                }
            }
            (live, idle)
        };

        for session_id in live {
            match store
                .renew_session_lock(&self.owner_id, std::slice::from_ref(&session_id), self.lock_timeout)
                .await
            {
                Ok(0) => {
                    warn!(target: "duralane::runtime::sessions", owner_id = %self.owner_id, session_id = %session_id, "Session lease lost");
                    self.forget(&session_id);
                }
                Ok(_) => trace!(target: "duralane::runtime::sessions", session_id = %session_id, "Session lease renewed"),
                Err(e) => warn!(target: "duralane::runtime::sessions", session_id = %session_id, error = %e, "Session renewal failed"),
            }
        }

        for session_id in idle {
            match store.release_session(&self.owner_id, &session_id).await {
                Ok(true) => {
                    debug!(target: "duralane::runtime::sessions", owner_id = %self.owner_id, session_id = %session_id, "Idle session released");
                    self.forget(&session_id);
                }
                Ok(false) => {
                    // Work arrived for it, or the lease is gone.
                    if let Ok(0) = store
                        .renew_session_lock(&self.owner_id, std::slice::from_ref(&session_id), self.lock_timeout)
                        .await
                    {
                        self.forget(&session_id);
                    }
                }
                Err(e) => warn!(target: "duralane::runtime::sessions", session_id = %session_id, error = %e, "Session release failed"),
            }
        }

        match store.cleanup_orphaned_sessions().await {
            Ok(0) => {}
            Ok(removed) => debug!(target: "duralane::runtime::sessions", removed, "Orphaned sessions removed"),
            Err(e) => warn!(target: "duralane::runtime::sessions", error = %e, "Orphaned session cleanup failed"),
        }
    }

    fn forget(&self, session_id: &str) {
        let mut slots = self.slots();
        if slots.owned.get(session_id).is_some_and(|s| s.in_flight == 0) {
            slots.owned.remove(session_id);
        }
    }

    /// Release everything this runtime still owns.
    pub(crate) async fn release_all(&self, store: &dyn Provider) {
        let owned: Vec<String> = self.slots().owned.keys().cloned().collect();
        for session_id in owned {
            if let Ok(true) = store.release_session(&self.owner_id, &session_id).await {
                self.forget(&session_id);
            }
        }
    }

    pub(crate) fn spawn_sweeper(self: Arc<Self>, store: Arc<dyn Provider>, shutdown: CancellationToken) -> JoinHandle<()> {
        let interval = calculate_renewal_interval(self.lock_timeout, Duration::from_secs(5))
            .min(self.idle_timeout / 2)
            .max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => self.sweep(store.as_ref()).await,
                }
            }
            self.release_all(store.as_ref()).await;
            debug!(target: "duralane::runtime::sessions", owner_id = %self.owner_id, "Session sweeper stopped");
        })
    }
}
