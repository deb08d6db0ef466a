//! Negotiation State Machine
//!
//! Owns the offer/answer lifecycle of one session: decides what to publish in
//! response to what is received or requested, buffers candidates that arrive
//! before the remote description, and enforces the single-exchange rules.

pub mod machine;
pub mod pending;

pub use machine::{NegotiationStateMachine, NegotiationStats, Reaction};
pub use pending::PendingCandidateQueue;

use crate::media::EngineError;
use crate::types::{NegotiationState, SdpKind};

/// Negotiation errors. All of them are fatal to the session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NegotiationError {
    #[error("Malformed {kind} description: {reason}")]
    MalformedSdp { kind: SdpKind, reason: String },

    #[error("Unexpected {event} in state {state}")]
    OutOfSequence { event: String, state: NegotiationState },

    #[error("Local offer already requested for this session")]
    DuplicateLocalOffer,

    #[error("Local answer already requested for this session")]
    DuplicateLocalAnswer,

    #[error("Transport engine {operation} failed: {message}")]
    Engine { operation: String, message: String },

    #[error("Peer connection already released")]
    ConnectionReleased,
}

impl NegotiationError {
    pub fn out_of_sequence(event: impl Into<String>, state: NegotiationState) -> Self {
        Self::OutOfSequence {
            event: event.into(),
            state,
        }
    }
}

impl From<EngineError> for NegotiationError {
    fn from(err: EngineError) -> Self {
        Self::Engine {
            operation: err.operation,
            message: err.message,
        }
    }
}
