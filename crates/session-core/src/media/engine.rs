//! Interfaces of the external media collaborators.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{CaptureError, EngineError};
use crate::types::{IceCandidate, SessionDescription};

/// STUN/TURN server entry passed to the transport engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Settings for creating a peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub ice_servers: Vec<IceServer>,
    /// Unified-plan SDP semantics
    pub unified_plan: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            unified_plan: true,
        }
    }
}

/// Requested capture format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            width: 720,
            height: 1280,
            frame_rate: 30,
        }
    }
}

impl fmt::Display for CaptureConstraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}fps", self.width, self.height, self.frame_rate)
    }
}

/// The outgoing track produced by a capture session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrackHandle {
    pub id: String,
    pub kind: String,
    pub constraints: CaptureConstraints,
}

/// Connection state reported by the transport engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events raised by a peer connection. Delivered on the channel handed to
/// [`TransportEngine::create_connection`] for the life of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    ConnectionStateChanged(PeerConnectionState),
}

/// Point-to-point media transport engine
#[async_trait]
pub trait TransportEngine: Send + Sync + 'static {
    async fn create_connection(
        &self,
        config: &ConnectionConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerConnection>, EngineError>;
}

/// One transport engine connection.
///
/// `add_ice_candidate` must not be called before a remote description is set.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<String, EngineError>;

    async fn create_answer(&self) -> Result<String, EngineError>;

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError>;

    async fn add_track(&self, track: &LocalTrackHandle) -> Result<(), EngineError>;

    async fn close(&self);
}

/// Local capture subsystem
#[async_trait]
pub trait CaptureSource: Send + Sync + 'static {
    async fn request_capture(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError>;
}

/// A running capture session, exclusively owned by one media session
#[async_trait]
pub trait CaptureHandle: Send + Sync {
    fn track(&self) -> LocalTrackHandle;

    /// Stop capturing. Called once, on teardown.
    async fn stop(&mut self);
}
