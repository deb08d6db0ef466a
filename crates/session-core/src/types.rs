//! Core data model shared by every component of a session.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{NegotiationError, Result, SessionError};

/// Stable identifier of one party, as produced by the identity provider.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifies a session by the pair of parties taking part in it.
///
/// Both ids are fixed before the session starts and never equal.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId {
    local: PeerId,
    remote: PeerId,
}

impl SessionId {
    pub fn new(local: PeerId, remote: PeerId) -> Result<Self> {
        if local.0.trim().is_empty() || remote.0.trim().is_empty() {
            return Err(SessionError::invalid_peer("peer identifiers must not be empty"));
        }
        if local == remote {
            return Err(SessionError::invalid_peer(format!(
                "local and remote identifiers are both '{}'",
                local
            )));
        }
        Ok(Self { local, remote })
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.local, self.remote)
    }
}

/// Which side of the offer/answer exchange this session plays.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Role {
    /// Creates and publishes the offer, applies the answer
    Offerer,
    /// Waits for the offer, publishes the answer
    Answerer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Offerer => write!(f, "offerer"),
            Role::Answerer => write!(f, "answerer"),
        }
    }
}

/// Kind of a session description
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
        }
    }
}

/// A session description that passed the structural check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    /// Validate `sdp` and wrap it.
    ///
    /// Only the framing is checked here (non-empty, starts with the protocol
    /// version line); full SDP parsing belongs to the transport engine.
    pub fn parse(kind: SdpKind, sdp: impl Into<String>) -> std::result::Result<Self, NegotiationError> {
        let sdp = sdp.into();
        let body = sdp.trim_start();
        if body.is_empty() {
            return Err(NegotiationError::MalformedSdp {
                kind,
                reason: "empty description".to_string(),
            });
        }
        if !body.starts_with("v=") {
            return Err(NegotiationError::MalformedSdp {
                kind,
                reason: "missing protocol version line".to_string(),
            });
        }
        Ok(Self { kind, sdp })
    }
}

/// A network-reachability candidate for the media path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Media stream identification tag
    #[serde(rename = "sdpMid")]
    pub mid: String,
    /// Index of the media description the candidate belongs to
    #[serde(rename = "sdpMLineIndex", deserialize_with = "crate::signaling::message::lenient_line_index")]
    pub line_index: u16,
    /// The candidate attribute line
    pub candidate: String,
}

impl IceCandidate {
    pub fn new(mid: impl Into<String>, line_index: u16, candidate: impl Into<String>) -> Self {
        Self {
            mid: mid.into(),
            line_index,
            candidate: candidate.into(),
        }
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}] {}", self.mid, self.line_index, self.candidate)
    }
}

/// Negotiation progress of one session.
///
/// Offerer path: `Idle -> AwaitingLocalOffer -> OfferSent -> AnswerReceived`.
/// Answerer path: `Idle -> AwaitingRemoteOffer -> OfferReceived -> AnswerSent`.
/// `Failed` and `Closed` are terminal for both.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum NegotiationState {
    Idle,
    AwaitingLocalOffer,
    OfferSent,
    AnswerReceived,
    AwaitingRemoteOffer,
    OfferReceived,
    AnswerSent,
    Failed,
    Closed,
}

impl NegotiationState {
    /// No further messages are processed in this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }

    /// The single offer/answer exchange has completed
    pub fn is_negotiated(&self) -> bool {
        matches!(self, NegotiationState::AnswerReceived | NegotiationState::AnswerSent)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::AwaitingLocalOffer => "awaiting-local-offer",
            NegotiationState::OfferSent => "offer-sent",
            NegotiationState::AnswerReceived => "answer-received",
            NegotiationState::AwaitingRemoteOffer => "awaiting-remote-offer",
            NegotiationState::OfferReceived => "offer-received",
            NegotiationState::AnswerSent => "answer-sent",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Category of a fatal session error, surfaced to the presentation layer
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum FailureCode {
    Channel,
    Media,
    Negotiation,
    Transport,
    Internal,
}

/// Why a session failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub code: FailureCode,
    pub message: String,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Session state as seen by the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Capture and transport are being prepared
    Connecting,
    /// Offer/answer exchange in progress
    Negotiating,
    /// The transport engine reports an established media path
    Connected,
    /// Terminal failure
    Failed(FailureReason),
    /// Torn down on request
    Closed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Failed(_) | SessionStatus::Closed)
    }
}
