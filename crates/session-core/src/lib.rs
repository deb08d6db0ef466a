//! Signaling and negotiation core for peer-to-peer media sessions.
//!
//! Two parties that cannot reach each other directly exchange session
//! descriptions and ICE candidates through an append-only relay store, then
//! hand media over to a point-to-point transport engine. This crate owns the
//! hard part in between: turning unordered, partially duplicated signaling
//! into one correctly sequenced offer/answer/candidate exchange, coordinated
//! with capture startup and connection lifecycle.
//!
//! Components, leaves first:
//!
//! - [`signaling`]: typed send/receive over the relay store
//! - [`negotiation`]: the per-session offer/answer state machine
//! - [`media`]: capture and transport engine ownership
//! - [`coordinator`]: the session supervisor and per-session tasks

// Error handling
pub mod errors;

// Data model
pub mod types;

// Configuration
pub mod config;

pub mod signaling;

pub mod negotiation;

pub mod media;

pub mod coordinator;

// Public exports
pub use config::SessionConfig;
pub use coordinator::{SessionEvent, SessionHandle, SessionSupervisor, SessionSupervisorBuilder, SupervisorStats};
pub use errors::{Result, SessionError};
pub use types::{
    FailureCode, FailureReason, IceCandidate, NegotiationState, PeerId, Role, SdpKind, SessionDescription,
    SessionId, SessionStatus,
};

/// Re-export of common types
pub mod prelude {
    pub use crate::config::SessionConfig;
    pub use crate::coordinator::{SessionEvent, SessionHandle, SessionSupervisor, SupervisorStats};
    pub use crate::errors::{
        CaptureError, ChannelError, EngineError, MediaError, NegotiationError, Result, SessionError,
    };
    pub use crate::media::loopback::{LoopbackCapture, LoopbackEngine};
    pub use crate::media::{
        CaptureConstraints, CaptureHandle, CaptureSource, ConnectionConfig, LocalTrackHandle, PeerConnection,
        PeerConnectionState, TransportEngine, TransportEvent,
    };
    pub use crate::signaling::{MemoryRelay, RelayStore, SignalChannel, SignalMessage};
    pub use crate::types::{
        FailureCode, FailureReason, IceCandidate, NegotiationState, PeerId, Role, SdpKind, SessionDescription,
        SessionId, SessionStatus,
    };
}
