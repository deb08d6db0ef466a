//! Session Event System
//!
//! State notifications for the presentation layer, fanned out over a
//! `tokio::sync::broadcast` channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::{NegotiationState, Role, SessionId, SessionStatus};

#[derive(Debug, Clone, Serialize)]
pub enum SessionEvent {
    /// UI-facing status transition
    StatusChanged {
        session_id: SessionId,
        role: Role,
        status: SessionStatus,
        timestamp: DateTime<Utc>,
    },
    /// Negotiation state transition
    NegotiationStateChanged {
        session_id: SessionId,
        state: NegotiationState,
        timestamp: DateTime<Utc>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionEvent::StatusChanged { session_id, .. } => session_id,
            SessionEvent::NegotiationStateChanged { session_id, .. } => session_id,
        }
    }
}

/// Cloneable publisher side of the event channel
#[derive(Debug, Clone)]
pub struct SessionEventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl SessionEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn status_changed(&self, session_id: &SessionId, role: Role, status: SessionStatus) {
        self.publish(SessionEvent::StatusChanged {
            session_id: session_id.clone(),
            role,
            status,
            timestamp: Utc::now(),
        });
    }

    pub fn negotiation_changed(&self, session_id: &SessionId, state: NegotiationState) {
        self.publish(SessionEvent::NegotiationStateChanged {
            session_id: session_id.clone(),
            state,
            timestamp: Utc::now(),
        });
    }
}
