//! Per-session media ownership.
//!
//! The controller exclusively owns the capture handle and the peer
//! connection; the negotiation machine only holds a weak reference to the
//! connection.

use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::engine::{
    CaptureConstraints, CaptureHandle, CaptureSource, ConnectionConfig, LocalTrackHandle, PeerConnection,
    TransportEngine, TransportEvent,
};
use super::{MediaError, MediaResult};
use crate::negotiation::NegotiationError;
use crate::types::{SdpKind, SessionDescription, SessionId};

pub struct MediaSessionController {
    session_id: SessionId,
    engine: Arc<dyn TransportEngine>,
    capture_source: Arc<dyn CaptureSource>,
    constraints: CaptureConstraints,
    connection_config: ConnectionConfig,
    capture: Option<Box<dyn CaptureHandle>>,
    connection: Option<Arc<dyn PeerConnection>>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    prepared: bool,
    offer_requested: bool,
    answer_requested: bool,
}

impl MediaSessionController {
    pub fn new(
        session_id: SessionId,
        engine: Arc<dyn TransportEngine>,
        capture_source: Arc<dyn CaptureSource>,
        constraints: CaptureConstraints,
        connection_config: ConnectionConfig,
    ) -> Self {
        Self {
            session_id,
            engine,
            capture_source,
            constraints,
            connection_config,
            capture: None,
            connection: None,
            transport_events: None,
            prepared: false,
            offer_requested: false,
            answer_requested: false,
        }
    }

    /// Start capture, create the connection and attach the outgoing track.
    ///
    /// Whatever was acquired before a failure stays owned by the controller
    /// and is released by the usual teardown calls.
    pub async fn prepare_local_media(&mut self) -> MediaResult<LocalTrackHandle> {
        if self.prepared {
            return Err(MediaError::AlreadyPrepared);
        }
        self.prepared = true;

        debug!("Session {} requesting capture {}", self.session_id, self.constraints);
        let capture = self.capture_source.request_capture(&self.constraints).await?;
        let track = capture.track();
        self.capture = Some(capture);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = self
            .engine
            .create_connection(&self.connection_config, events_tx)
            .await?;
        self.transport_events = Some(events_rx);
        self.connection = Some(connection.clone());

        connection
            .add_track(&track)
            .await
            .map_err(|e| MediaError::TrackAttach { message: e.to_string() })?;

        info!("Session {} local media ready (track {})", self.session_id, track.id);
        Ok(track)
    }

    /// Create the local offer. Allowed once per session.
    pub async fn create_local_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        if self.offer_requested {
            return Err(NegotiationError::DuplicateLocalOffer);
        }
        self.offer_requested = true;

        let sdp = self.live_connection()?.create_offer().await?;
        SessionDescription::parse(SdpKind::Offer, sdp)
    }

    /// Create the local answer. Allowed once per session.
    pub async fn create_local_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        if self.answer_requested {
            return Err(NegotiationError::DuplicateLocalAnswer);
        }
        self.answer_requested = true;

        let sdp = self.live_connection()?.create_answer().await?;
        SessionDescription::parse(SdpKind::Answer, sdp)
    }

    /// The connection's event stream. Can be taken once.
    pub fn take_transport_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.transport_events.take()
    }

    pub fn connection_handle(&self) -> MediaResult<Weak<dyn PeerConnection>> {
        self.connection
            .as_ref()
            .map(Arc::downgrade)
            .ok_or(MediaError::NotPrepared)
    }

    fn live_connection(&self) -> Result<&Arc<dyn PeerConnection>, NegotiationError> {
        self.connection.as_ref().ok_or(NegotiationError::ConnectionReleased)
    }

    pub fn has_capture(&self) -> bool {
        self.capture.is_some()
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// Stop capture. Returns `false` if there was nothing to release.
    pub async fn release_capture(&mut self) -> bool {
        match self.capture.take() {
            Some(mut capture) => {
                capture.stop().await;
                debug!("Session {} capture released", self.session_id);
                true
            }
            None => false,
        }
    }

    /// Close the connection. Returns `false` if there was nothing to release.
    pub async fn release_connection(&mut self) -> bool {
        self.transport_events = None;
        match self.connection.take() {
            Some(connection) => {
                connection.close().await;
                debug!("Session {} connection released", self.session_id);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::loopback::{LoopbackCapture, LoopbackEngine, LoopbackFailure};
    use crate::media::CaptureError;
    use crate::types::PeerId;

    fn controller(engine: &LoopbackEngine, capture: &LoopbackCapture) -> MediaSessionController {
        MediaSessionController::new(
            SessionId::new(PeerId::from("alice"), PeerId::from("bob")).unwrap(),
            Arc::new(engine.clone()),
            Arc::new(capture.clone()),
            CaptureConstraints::default(),
            ConnectionConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_prepare_attaches_track() {
        let engine = LoopbackEngine::new();
        let capture = LoopbackCapture::new();
        let mut media = controller(&engine, &capture);

        let track = media.prepare_local_media().await.unwrap();
        assert_eq!(track.constraints, CaptureConstraints::default());
        assert_eq!(capture.requests(), 1);
        assert_eq!(engine.connections()[0].record().tracks, vec![track]);
        assert!(media.take_transport_events().is_some());
        assert!(media.take_transport_events().is_none());
        assert!(matches!(media.prepare_local_media().await, Err(MediaError::AlreadyPrepared)));
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let engine = LoopbackEngine::new();
        let capture = LoopbackCapture::new();
        capture.deny_with(CaptureError::PermissionDenied);
        let mut media = controller(&engine, &capture);

        assert!(matches!(media.prepare_local_media().await, Err(MediaError::PermissionDenied)));
        assert!(engine.connections().is_empty());
        assert!(!media.release_capture().await);
    }

    #[tokio::test]
    async fn test_failed_track_attach_keeps_resources_for_teardown() {
        let engine = LoopbackEngine::new();
        engine.fail(LoopbackFailure::AddTrack);
        let capture = LoopbackCapture::new();
        let mut media = controller(&engine, &capture);

        assert!(matches!(media.prepare_local_media().await, Err(MediaError::TrackAttach { .. })));
        assert!(media.release_capture().await);
        assert!(media.release_connection().await);
        assert_eq!(capture.stops(), 1);
        assert_eq!(engine.connections()[0].record().close_count, 1);
    }

    #[tokio::test]
    async fn test_local_offer_once() {
        let engine = LoopbackEngine::new();
        let capture = LoopbackCapture::new();
        let mut media = controller(&engine, &capture);
        media.prepare_local_media().await.unwrap();

        let offer = media.create_local_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(matches!(
            media.create_local_offer().await,
            Err(NegotiationError::DuplicateLocalOffer)
        ));
    }

    #[tokio::test]
    async fn test_offer_failure_is_negotiation_error() {
        let engine = LoopbackEngine::new();
        engine.fail(LoopbackFailure::CreateOffer);
        let capture = LoopbackCapture::new();
        let mut media = controller(&engine, &capture);
        media.prepare_local_media().await.unwrap();

        assert!(matches!(
            media.create_local_offer().await,
            Err(NegotiationError::Engine { .. })
        ));
    }

    #[tokio::test]
    async fn test_release_once_each() {
        let engine = LoopbackEngine::new();
        let capture = LoopbackCapture::new();
        let mut media = controller(&engine, &capture);
        media.prepare_local_media().await.unwrap();
        let weak = media.connection_handle().unwrap();

        assert!(media.release_capture().await);
        assert!(!media.release_capture().await);
        assert!(media.release_connection().await);
        assert!(!media.release_connection().await);
        assert_eq!(capture.stops(), 1);
        assert_eq!(engine.connections()[0].record().close_count, 1);
        assert!(matches!(
            media.create_local_answer().await,
            Err(NegotiationError::ConnectionReleased)
        ));
        drop(weak);
    }
}
