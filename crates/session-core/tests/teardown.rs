//! Teardown ordering and bounded release steps.
//!
//! The collaborators here wrap the loopback ones and append to a shared
//! journal as each resource is released.

mod common;

use async_trait::async_trait;
use common::*;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use peerlink_session_core::prelude::*;
use peerlink_session_core::signaling::{RelayError, RelayListener};

type Journal = Arc<Mutex<Vec<&'static str>>>;

struct JournalCapture {
    inner: LoopbackCapture,
    journal: Journal,
}

struct JournalCaptureHandle {
    inner: Box<dyn CaptureHandle>,
    journal: Journal,
}

#[async_trait]
impl CaptureSource for JournalCapture {
    async fn request_capture(
        &self,
        constraints: &CaptureConstraints,
    ) -> std::result::Result<Box<dyn CaptureHandle>, CaptureError> {
        let inner = self.inner.request_capture(constraints).await?;
        Ok(Box::new(JournalCaptureHandle {
            inner,
            journal: self.journal.clone(),
        }))
    }
}

#[async_trait]
impl CaptureHandle for JournalCaptureHandle {
    fn track(&self) -> LocalTrackHandle {
        self.inner.track()
    }

    async fn stop(&mut self) {
        self.inner.stop().await;
        self.journal.lock().push("capture");
    }
}

struct JournalEngine {
    inner: LoopbackEngine,
    journal: Journal,
}

struct JournalConnection {
    inner: Arc<dyn PeerConnection>,
    journal: Journal,
}

#[async_trait]
impl TransportEngine for JournalEngine {
    async fn create_connection(
        &self,
        config: &ConnectionConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> std::result::Result<Arc<dyn PeerConnection>, EngineError> {
        let inner = self.inner.create_connection(config, events).await?;
        Ok(Arc::new(JournalConnection {
            inner,
            journal: self.journal.clone(),
        }))
    }
}

#[async_trait]
impl PeerConnection for JournalConnection {
    async fn create_offer(&self) -> std::result::Result<String, EngineError> {
        self.inner.create_offer().await
    }

    async fn create_answer(&self) -> std::result::Result<String, EngineError> {
        self.inner.create_answer().await
    }

    async fn set_local_description(&self, description: &SessionDescription) -> std::result::Result<(), EngineError> {
        self.inner.set_local_description(description).await
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> std::result::Result<(), EngineError> {
        self.inner.set_remote_description(description).await
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> std::result::Result<(), EngineError> {
        self.inner.add_ice_candidate(candidate).await
    }

    async fn add_track(&self, track: &LocalTrackHandle) -> std::result::Result<(), EngineError> {
        self.inner.add_track(track).await
    }

    async fn close(&self) {
        self.inner.close().await;
        self.journal.lock().push("connection");
    }
}

struct JournalRelay {
    inner: MemoryRelay,
    journal: Journal,
}

#[async_trait]
impl RelayStore for JournalRelay {
    async fn append(&self, address: &str, value: Value) -> std::result::Result<u64, RelayError> {
        self.inner.append(address, value).await
    }

    async fn listen(&self, address: &str) -> std::result::Result<RelayListener, RelayError> {
        let mut inner = self.inner.listen(address).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let forward = tokio::spawn(async move {
            while let Some(event) = inner.recv().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        let journal = self.journal.clone();
        Ok(RelayListener::new(address, rx, move || {
            journal.lock().push("subscription");
            forward.abort();
        }))
    }

    async fn tail(&self, address: &str) -> std::result::Result<Option<u64>, RelayError> {
        self.inner.tail(address).await
    }
}

struct Journaled {
    supervisor: SessionSupervisor,
    engine: LoopbackEngine,
    journal: Journal,
}

fn journaled(local_id: &str, relay: &MemoryRelay) -> Journaled {
    let journal = Journal::default();
    let engine = LoopbackEngine::new();
    let supervisor = SessionSupervisor::builder()
        .local_id(local_id)
        .relay(Arc::new(JournalRelay {
            inner: relay.clone(),
            journal: journal.clone(),
        }))
        .engine(Arc::new(JournalEngine {
            inner: engine.clone(),
            journal: journal.clone(),
        }))
        .capture(Arc::new(JournalCapture {
            inner: LoopbackCapture::new(),
            journal: journal.clone(),
        }))
        .config(test_config())
        .build()
        .unwrap();
    Journaled {
        supervisor,
        engine,
        journal,
    }
}

#[tokio::test]
async fn test_cancel_releases_capture_then_connection_then_subscription() {
    init_tracing();
    let relay = MemoryRelay::new();
    let alice = journaled("alice", &relay);

    let handle = alice.supervisor.start("bob").unwrap();
    wait_for_negotiation(&handle, NegotiationState::OfferSent).await;
    assert!(alice.journal.lock().is_empty());

    alice.supervisor.cancel(&handle).await;
    assert_eq!(handle.status(), SessionStatus::Closed);
    assert_eq!(*alice.journal.lock(), vec!["capture", "connection", "subscription"]);
}

#[tokio::test]
async fn test_failure_releases_in_the_same_order() {
    init_tracing();
    let relay = MemoryRelay::new();
    let bob = journaled("bob", &relay);

    let handle = bob.supervisor.accept("alice").unwrap();
    wait_for_negotiation(&handle, NegotiationState::AwaitingRemoteOffer).await;
    wait_until(|| !bob.engine.connections().is_empty()).await;
    bob.engine.connections()[0].report_state(PeerConnectionState::Failed);

    assert!(matches!(wait_for_terminal(&handle).await, SessionStatus::Failed(_)));
    bob.supervisor.cancel(&handle).await;
    assert_eq!(*bob.journal.lock(), vec!["capture", "connection", "subscription"]);
}

/// Capture whose stop never completes
struct StuckCapture;

struct StuckCaptureHandle {
    track: LocalTrackHandle,
}

#[async_trait]
impl CaptureSource for StuckCapture {
    async fn request_capture(
        &self,
        constraints: &CaptureConstraints,
    ) -> std::result::Result<Box<dyn CaptureHandle>, CaptureError> {
        Ok(Box::new(StuckCaptureHandle {
            track: LocalTrackHandle {
                id: "stuck-video".to_string(),
                kind: "video".to_string(),
                constraints: *constraints,
            },
        }))
    }
}

#[async_trait]
impl CaptureHandle for StuckCaptureHandle {
    fn track(&self) -> LocalTrackHandle {
        self.track.clone()
    }

    async fn stop(&mut self) {
        std::future::pending::<()>().await
    }
}

fn stuck(relay: &MemoryRelay, engine: &LoopbackEngine) -> SessionSupervisor {
    SessionSupervisor::builder()
        .local_id("alice")
        .relay(Arc::new(relay.clone()))
        .engine(Arc::new(engine.clone()))
        .capture(Arc::new(StuckCapture))
        .config(test_config().with_teardown_timeout(Duration::from_millis(100)))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_stuck_capture_stop_does_not_block_cancel() {
    init_tracing();
    let relay = MemoryRelay::new();
    let engine = LoopbackEngine::new();
    let supervisor = stuck(&relay, &engine);

    let handle = supervisor.start("bob").unwrap();
    wait_for_negotiation(&handle, NegotiationState::OfferSent).await;
    supervisor.cancel(&handle).await;

    assert_eq!(handle.status(), SessionStatus::Closed);
    assert_eq!(handle.negotiation_state(), NegotiationState::Closed);
    assert!(!supervisor.is_active(&PeerId::from("bob")));
    assert_eq!(engine.connections()[0].record().close_count, 1);
    assert_eq!(relay.listener_count("signals/alice"), 0);

    let again = supervisor.start("bob").unwrap();
    wait_for_negotiation(&again, NegotiationState::OfferSent).await;
    supervisor.cancel(&again).await;
    assert_eq!(again.status(), SessionStatus::Closed);
}

#[tokio::test]
async fn test_stuck_capture_stop_does_not_block_shutdown() {
    init_tracing();
    let relay = MemoryRelay::new();
    let engine = LoopbackEngine::new();
    let supervisor = stuck(&relay, &engine);

    let bob = supervisor.start("bob").unwrap();
    let carol = supervisor.accept("carol").unwrap();
    wait_for_negotiation(&bob, NegotiationState::OfferSent).await;
    wait_for_negotiation(&carol, NegotiationState::AwaitingRemoteOffer).await;

    supervisor.shutdown().await;

    assert_eq!(bob.status(), SessionStatus::Closed);
    assert_eq!(carol.status(), SessionStatus::Closed);
    assert_eq!(supervisor.stats().active, 0);
    assert_eq!(supervisor.stats().closed, 2);
}
