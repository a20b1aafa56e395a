//! Connection Registry
//!
//! The engine-wide map from session id to a `SessionHandle`. A handle is the
//! shareable face of a session: the reaper and HTTP handlers read it, but only
//! the session's own actor ever touches the session state behind it.

use crate::error::CloseReason;
use crate::models::SessionSummary;
use crate::ws::actor::SessionEvent;
use crate::ws::outbox::Outbox;
use chrono::{DateTime, Utc};
use companion_core::BotState;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Activity and heartbeat bookkeeping shared between the actor and the reaper.
#[derive(Debug)]
pub struct Liveness {
    started: Instant,
    last_activity_ms: AtomicU64,
    outstanding_pings: AtomicU32,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            outstanding_pings: AtomicU32::new(0),
        }
    }

    /// Records user activity.
    pub fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    /// Counts a ping sent without an answer yet and returns the new total.
    pub fn record_ping(&self) -> u32 {
        self.outstanding_pings.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_pong(&self) {
        self.outstanding_pings.store(0, Ordering::Relaxed);
    }

    pub fn outstanding_pings(&self) -> u32 {
        self.outstanding_pings.load(Ordering::Relaxed)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SessionHandle {
    pub id: Uuid,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
    pub liveness: Arc<Liveness>,
    state: watch::Receiver<BotState>,
    mailbox: mpsc::Sender<SessionEvent>,
    outbox: Outbox,
}

impl SessionHandle {
    pub fn new(
        id: Uuid,
        user_id: String,
        liveness: Arc<Liveness>,
        state: watch::Receiver<BotState>,
        mailbox: mpsc::Sender<SessionEvent>,
        outbox: Outbox,
    ) -> Self {
        Self {
            id,
            user_id,
            connected_at: Utc::now(),
            liveness,
            state,
            mailbox,
            outbox,
        }
    }

    pub fn state(&self) -> BotState {
        *self.state.borrow()
    }

    /// Sends a heartbeat ping and returns the number of unanswered pings.
    pub fn ping(&self) -> u32 {
        if self.outbox.ping() {
            self.liveness.record_ping()
        } else {
            self.liveness.outstanding_pings()
        }
    }

    /// Asks the actor to close the session. Returns false if the actor is gone.
    ///
    /// A full mailbox is not an error; the next sweep tries again.
    pub fn evict(&self, reason: CloseReason) -> bool {
        match self.mailbox.try_send(SessionEvent::Evict(reason)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(session_id = %self.id, "Mailbox full, eviction deferred");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed() || self.outbox.is_closed()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            user_id: self.user_id.clone(),
            state: self.state().to_string(),
            connected_at: self.connected_at,
            idle_seconds: self.liveness.idle_for().as_secs(),
        }
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<Uuid, Arc<SessionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: Arc<SessionHandle>) {
        info!(session_id = %handle.id, user_id = %handle.user_id, "Session registered");
        self.sessions.insert(handle.id, handle);
    }

    pub fn deregister(&self, id: Uuid) -> Option<Arc<SessionHandle>> {
        let removed = self.sessions.remove(&id).map(|(_, handle)| handle);
        if removed.is_some() {
            info!(session_id = %id, "Session deregistered");
        }
        removed
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Clones every handle out so callers never hold a shard lock across work.
    pub fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> = self.handles().iter().map(|h| h.summary()).collect();
        summaries.sort_by_key(|s| s.connected_at);
        summaries
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
