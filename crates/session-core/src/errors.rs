//! Session error taxonomy.
//!
//! Each component has its own error enum (`ChannelError`, `MediaError`,
//! `NegotiationError`); `SessionError` aggregates them for the supervisor
//! and the public API.

use crate::types::{FailureCode, FailureReason, SessionId};

pub use crate::media::{CaptureError, EngineError, MediaError};
pub use crate::negotiation::NegotiationError;
pub use crate::signaling::{ChannelError, RelayError};

/// Session result type
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors surfaced by the session layer
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Signal channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Session already active: {session_id}")]
    SessionAlreadyActive { session_id: SessionId },

    #[error("Invalid peer identifier: {message}")]
    InvalidPeer { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SessionError {
    pub fn invalid_peer(message: impl Into<String>) -> Self {
        Self::InvalidPeer { message: message.into() }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Reason code reported with `Failed(reason)`
    pub fn failure_code(&self) -> FailureCode {
        match self {
            SessionError::Channel(_) => FailureCode::Channel,
            SessionError::Media(MediaError::TransportFailed { .. }) => FailureCode::Transport,
            SessionError::Media(_) => FailureCode::Media,
            SessionError::Negotiation(_) => FailureCode::Negotiation,
            _ => FailureCode::Internal,
        }
    }

    pub fn failure_reason(&self) -> FailureReason {
        FailureReason {
            code: self.failure_code(),
            message: self.to_string(),
        }
    }
}

impl From<peerlink_infra_common::Error> for SessionError {
    fn from(err: peerlink_infra_common::Error) -> Self {
        match err {
            peerlink_infra_common::Error::Config(message) => Self::Configuration { message },
            other => Self::Internal { message: other.to_string() },
        }
    }
}
