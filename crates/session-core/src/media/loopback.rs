//! In-process transport engine and capture source.
//!
//! `LoopbackEngine` enforces the transport rules a real engine does (no
//! candidate before a remote description, nothing after close), gathers
//! host candidates once a local description is set and reports `Connected`
//! when both descriptions and at least one remote candidate are applied.
//! Every call is recorded so tests can inspect what the session did.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::engine::{
    CaptureConstraints, CaptureHandle, CaptureSource, ConnectionConfig, LocalTrackHandle, PeerConnection,
    PeerConnectionState, TransportEngine, TransportEvent,
};
use super::{CaptureError, EngineError};
use crate::types::{IceCandidate, SessionDescription};

/// Engine operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopbackFailure {
    CreateConnection,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
    AddTrack,
}

/// Loopback engine settings
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Host candidates gathered after each local description
    pub local_candidates: u16,
    /// Fixed offer body instead of a generated one
    pub offer_sdp: Option<String>,
    /// Fixed answer body instead of a generated one
    pub answer_sdp: Option<String>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            local_candidates: 1,
            offer_sdp: None,
            answer_sdp: None,
        }
    }
}

/// Everything a loopback connection was asked to do
#[derive(Debug, Clone, Default)]
pub struct ConnectionRecord {
    pub config: Option<ConnectionConfig>,
    pub offers_created: usize,
    pub answers_created: usize,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub remote_descriptions_set: usize,
    pub applied_candidates: Vec<IceCandidate>,
    /// Candidates offered before any remote description; always rejected
    pub early_candidates: usize,
    pub tracks: Vec<LocalTrackHandle>,
    pub connected: bool,
    pub close_count: usize,
}

type FailureSet = Arc<Mutex<HashSet<LoopbackFailure>>>;

#[derive(Default)]
struct EngineShared {
    options: LoopbackOptions,
    connections: Vec<Arc<LoopbackConnection>>,
}

/// Loopback transport engine. Clones share state.
#[derive(Clone, Default)]
pub struct LoopbackEngine {
    shared: Arc<Mutex<EngineShared>>,
    failures: FailureSet,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: LoopbackOptions) -> Self {
        let engine = Self::default();
        engine.shared.lock().options = options;
        engine
    }

    /// Make `operation` fail on every connection from now on
    pub fn fail(&self, operation: LoopbackFailure) {
        self.failures.lock().insert(operation);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Connections created so far, oldest first
    pub fn connections(&self) -> Vec<Arc<LoopbackConnection>> {
        self.shared.lock().connections.clone()
    }

    /// Drop the engine's references to its connections
    pub fn forget_connections(&self) {
        self.shared.lock().connections.clear();
    }
}

#[async_trait]
impl TransportEngine for LoopbackEngine {
    async fn create_connection(
        &self,
        config: &ConnectionConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerConnection>, EngineError> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        if self.failures.lock().contains(&LoopbackFailure::CreateConnection) {
            return Err(EngineError::new("create_connection", "injected failure"));
        }

        let options = self.shared.lock().options.clone();
        let connection = Arc::new(LoopbackConnection {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            failures: self.failures.clone(),
            options,
            events,
            record: Mutex::new(ConnectionRecord {
                config: Some(config.clone()),
                ..ConnectionRecord::default()
            }),
        });
        let _ = connection.events.send(TransportEvent::ConnectionStateChanged(PeerConnectionState::New));

        self.shared.lock().connections.push(connection.clone());
        Ok(connection)
    }
}

pub struct LoopbackConnection {
    id: u64,
    failures: FailureSet,
    options: LoopbackOptions,
    events: mpsc::UnboundedSender<TransportEvent>,
    record: Mutex<ConnectionRecord>,
}

impl LoopbackConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn record(&self) -> ConnectionRecord {
        self.record.lock().clone()
    }

    /// Report a connection state change, as the engine would on network events
    pub fn report_state(&self, state: PeerConnectionState) {
        let _ = self.events.send(TransportEvent::ConnectionStateChanged(state));
    }

    fn check(&self, operation: LoopbackFailure, name: &str) -> Result<(), EngineError> {
        if self.record.lock().close_count > 0 {
            return Err(EngineError::new(name, "connection closed"));
        }
        if self.failures.lock().contains(&operation) {
            return Err(EngineError::new(name, "injected failure"));
        }
        Ok(())
    }

    fn default_sdp(&self, kind: &str) -> String {
        format!(
            "v=0\r\no=loopback {} 1 IN IP4 127.0.0.1\r\ns={}\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:0\r\n",
            self.id, kind
        )
    }

    fn maybe_connected(&self, record: &mut ConnectionRecord) {
        if !record.connected
            && record.local_description.is_some()
            && record.remote_description.is_some()
            && !record.applied_candidates.is_empty()
        {
            record.connected = true;
            debug!("Loopback connection {} connected", self.id);
            let _ = self
                .events
                .send(TransportEvent::ConnectionStateChanged(PeerConnectionState::Connected));
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_offer(&self) -> Result<String, EngineError> {
        self.check(LoopbackFailure::CreateOffer, "create_offer")?;
        self.record.lock().offers_created += 1;
        Ok(self.options.offer_sdp.clone().unwrap_or_else(|| self.default_sdp("offer")))
    }

    async fn create_answer(&self) -> Result<String, EngineError> {
        self.check(LoopbackFailure::CreateAnswer, "create_answer")?;
        let mut record = self.record.lock();
        if record.remote_description.is_none() {
            return Err(EngineError::new("create_answer", "no remote offer"));
        }
        record.answers_created += 1;
        Ok(self.options.answer_sdp.clone().unwrap_or_else(|| self.default_sdp("answer")))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), EngineError> {
        self.check(LoopbackFailure::SetLocalDescription, "set_local_description")?;
        let mut record = self.record.lock();
        record.local_description = Some(description.clone());

        for n in 0..self.options.local_candidates {
            let candidate = IceCandidate::new(
                "0",
                0,
                format!(
                    "candidate:{} 1 UDP 2122260223 127.0.0.1 {} typ host",
                    n + 1,
                    50000 + u32::from(n)
                ),
            );
            let _ = self.events.send(TransportEvent::LocalCandidate(candidate));
        }
        self.maybe_connected(&mut record);
        Ok(())
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), EngineError> {
        self.check(LoopbackFailure::SetRemoteDescription, "set_remote_description")?;
        let mut record = self.record.lock();
        record.remote_description = Some(description.clone());
        record.remote_descriptions_set += 1;
        self.maybe_connected(&mut record);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError> {
        self.check(LoopbackFailure::AddIceCandidate, "add_ice_candidate")?;
        let mut record = self.record.lock();
        if record.remote_description.is_none() {
            record.early_candidates += 1;
            return Err(EngineError::new("add_ice_candidate", "remote description not set"));
        }
        record.applied_candidates.push(candidate.clone());
        self.maybe_connected(&mut record);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrackHandle) -> Result<(), EngineError> {
        self.check(LoopbackFailure::AddTrack, "add_track")?;
        self.record.lock().tracks.push(track.clone());
        Ok(())
    }

    async fn close(&self) {
        let mut record = self.record.lock();
        record.close_count += 1;
        if record.close_count == 1 {
            let _ = self
                .events
                .send(TransportEvent::ConnectionStateChanged(PeerConnectionState::Closed));
        }
    }
}

#[derive(Debug, Default)]
struct CaptureShared {
    denial: Option<CaptureError>,
    requests: usize,
    stops: usize,
    active: usize,
    last_constraints: Option<CaptureConstraints>,
}

/// Loopback capture source. Clones share state.
#[derive(Clone, Default)]
pub struct LoopbackCapture {
    shared: Arc<Mutex<CaptureShared>>,
}

impl LoopbackCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every following request with `error`
    pub fn deny_with(&self, error: CaptureError) {
        self.shared.lock().denial = Some(error);
    }

    pub fn allow(&self) {
        self.shared.lock().denial = None;
    }

    pub fn requests(&self) -> usize {
        self.shared.lock().requests
    }

    pub fn stops(&self) -> usize {
        self.shared.lock().stops
    }

    /// Capture sessions started and not yet stopped
    pub fn active(&self) -> usize {
        self.shared.lock().active
    }

    pub fn last_constraints(&self) -> Option<CaptureConstraints> {
        self.shared.lock().last_constraints
    }
}

#[async_trait]
impl CaptureSource for LoopbackCapture {
    async fn request_capture(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        let mut shared = self.shared.lock();
        shared.requests += 1;
        shared.last_constraints = Some(*constraints);
        if let Some(denial) = &shared.denial {
            return Err(denial.clone());
        }
        shared.active += 1;

        let track = LocalTrackHandle {
            id: format!("loopback-video-{}", shared.requests),
            kind: "video".to_string(),
            constraints: *constraints,
        };
        Ok(Box::new(LoopbackCaptureHandle {
            track,
            shared: self.shared.clone(),
            stopped: false,
        }))
    }
}

struct LoopbackCaptureHandle {
    track: LocalTrackHandle,
    shared: Arc<Mutex<CaptureShared>>,
    stopped: bool,
}

#[async_trait]
impl CaptureHandle for LoopbackCaptureHandle {
    fn track(&self) -> LocalTrackHandle {
        self.track.clone()
    }

    async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let mut shared = self.shared.lock();
        shared.stops += 1;
        shared.active = shared.active.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SdpKind;

    async fn connection(engine: &LoopbackEngine) -> (Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = engine.create_connection(&ConnectionConfig::default(), tx).await.unwrap();
        (connection, rx)
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_rejected() {
        let engine = LoopbackEngine::new();
        let (connection, _rx) = connection(&engine).await;

        assert!(connection.add_ice_candidate(&IceCandidate::new("0", 0, "c1")).await.is_err());
        assert_eq!(engine.connections()[0].record().early_candidates, 1);
    }

    #[tokio::test]
    async fn test_connects_after_descriptions_and_candidate() {
        let engine = LoopbackEngine::with_options(LoopbackOptions {
            local_candidates: 2,
            ..LoopbackOptions::default()
        });
        let (connection, mut rx) = connection(&engine).await;
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::ConnectionStateChanged(PeerConnectionState::New))
        );

        let offer = SessionDescription::parse(SdpKind::Offer, connection.create_offer().await.unwrap()).unwrap();
        connection.set_local_description(&offer).await.unwrap();
        for _ in 0..2 {
            assert!(matches!(rx.recv().await, Some(TransportEvent::LocalCandidate(_))));
        }

        let answer = SessionDescription::parse(SdpKind::Answer, "v=0...B").unwrap();
        connection.set_remote_description(&answer).await.unwrap();
        connection.add_ice_candidate(&IceCandidate::new("0", 0, "c1")).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::ConnectionStateChanged(PeerConnectionState::Connected))
        );

        connection.close().await;
        connection.close().await;
        assert_eq!(engine.connections()[0].record().close_count, 2);
        assert!(connection.create_offer().await.is_err());
    }

    #[tokio::test]
    async fn test_capture_counts() {
        let capture = LoopbackCapture::new();
        let mut handle = capture.request_capture(&CaptureConstraints::default()).await.unwrap();
        assert_eq!(handle.track().kind, "video");
        assert_eq!(capture.active(), 1);

        handle.stop().await;
        handle.stop().await;
        assert_eq!(capture.stops(), 1);
        assert_eq!(capture.active(), 0);

        capture.deny_with(CaptureError::EncoderInit("no codec".to_string()));
        assert!(capture.request_capture(&CaptureConstraints::default()).await.is_err());
        assert_eq!(capture.requests(), 2);
    }
}
