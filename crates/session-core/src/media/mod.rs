//! Media Session Controller
//!
//! Bridges negotiation to the two external media collaborators:
//!
//! - `engine`: the transport engine and capture subsystem interfaces
//! - `controller`: per-session ownership of the capture handle and peer connection
//! - `loopback`: in-process engine and capture source

pub mod controller;
pub mod engine;
pub mod loopback;

pub use controller::MediaSessionController;
pub use engine::{
    CaptureConstraints, CaptureHandle, CaptureSource, ConnectionConfig, IceServer, LocalTrackHandle,
    PeerConnection, PeerConnectionState, TransportEngine, TransportEvent,
};

/// Media result type
pub type MediaResult<T> = Result<T, MediaError>;

/// Media errors. Fatal to the session, never retried automatically.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MediaError {
    #[error("Capture permission denied")]
    PermissionDenied,

    #[error("Encoder initialization failed: {message}")]
    EncoderInit { message: String },

    #[error("Capture unavailable: {message}")]
    CaptureUnavailable { message: String },

    #[error("Transport engine {operation} failed: {message}")]
    Engine { operation: String, message: String },

    #[error("Failed to attach local track: {message}")]
    TrackAttach { message: String },

    #[error("Local media already prepared")]
    AlreadyPrepared,

    #[error("Local media not prepared")]
    NotPrepared,

    #[error("Transport failed: {message}")]
    TransportFailed { message: String },
}

/// Failure reported by a transport engine operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation}: {message}")]
pub struct EngineError {
    pub operation: String,
    pub message: String,
}

impl EngineError {
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Failure reported by the capture subsystem
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("capture unavailable: {0}")]
    Unavailable(String),
}

impl From<CaptureError> for MediaError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied => MediaError::PermissionDenied,
            CaptureError::EncoderInit(message) => MediaError::EncoderInit { message },
            CaptureError::Unavailable(message) => MediaError::CaptureUnavailable { message },
        }
    }
}

impl From<EngineError> for MediaError {
    fn from(err: EngineError) -> Self {
        MediaError::Engine {
            operation: err.operation,
            message: err.message,
        }
    }
}
