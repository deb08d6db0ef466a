//! Active Session Registry
//!
//! Tracks which `(local, remote)` pairs have a live session and keeps the
//! supervisor's lifetime counters.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::errors::{Result, SessionError};
use crate::types::{Role, SessionId};

/// Registry entry for a live session
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub role: Role,
    /// Distinguishes successive sessions for the same pair
    pub instance: Uuid,
    pub started_at: DateTime<Utc>,
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Closed,
    Failed,
}

/// Supervisor statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub started: u64,
    pub active: usize,
    pub connected: u64,
    pub failed: u64,
    pub closed: u64,
}

#[derive(Debug, Default)]
struct RegistryCounters {
    started: u64,
    connected: u64,
    failed: u64,
    closed: u64,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, ActiveSession>,
    /// Newest inbox order key seen by the last completed session of each pair
    resume_points: DashMap<SessionId, u64>,
    counters: Mutex<RegistryCounters>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the pair. Fails with `SessionAlreadyActive` if it is taken.
    pub fn try_register(&self, session_id: &SessionId, role: Role, instance: Uuid) -> Result<()> {
        match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(_) => Err(SessionError::SessionAlreadyActive {
                session_id: session_id.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(ActiveSession {
                    role,
                    instance,
                    started_at: Utc::now(),
                });
                self.counters.lock().started += 1;
                tracing::debug!("Registered session {} ({})", session_id, role);
                Ok(())
            }
        }
    }

    /// Release the pair at the end of a session. Only the registering
    /// instance can release it.
    pub fn complete(&self, session_id: &SessionId, instance: Uuid, outcome: SessionOutcome) -> bool {
        let removed = self
            .sessions
            .remove_if(session_id, |_, active| active.instance == instance)
            .is_some();
        if removed {
            let mut counters = self.counters.lock();
            match outcome {
                SessionOutcome::Closed => counters.closed += 1,
                SessionOutcome::Failed => counters.failed += 1,
            }
            tracing::debug!("Unregistered session {} ({:?})", session_id, outcome);
        }
        removed
    }

    /// Undo a registration whose session never ran
    pub fn discard(&self, session_id: &SessionId, instance: Uuid) {
        if self
            .sessions
            .remove_if(session_id, |_, active| active.instance == instance)
            .is_some()
        {
            let mut counters = self.counters.lock();
            counters.started = counters.started.saturating_sub(1);
        }
    }

    /// Remember where the pair's inbox stood when its session ended.
    /// Later sessions for the pair ignore entries up to and including it.
    pub fn record_resume_point(&self, session_id: &SessionId, order: u64) {
        self.resume_points
            .entry(session_id.clone())
            .and_modify(|point| *point = (*point).max(order))
            .or_insert(order);
    }

    pub fn resume_point(&self, session_id: &SessionId) -> Option<u64> {
        self.resume_points.get(session_id).map(|point| *point)
    }

    pub fn record_connected(&self) {
        self.counters.lock().connected += 1;
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn get(&self, session_id: &SessionId) -> Option<ActiveSession> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn stats(&self) -> SupervisorStats {
        let counters = self.counters.lock();
        SupervisorStats {
            started: counters.started,
            active: self.sessions.len(),
            connected: counters.connected,
            failed: counters.failed,
            closed: counters.closed,
        }
    }
}
