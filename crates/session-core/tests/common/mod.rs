//! Shared helpers for session-core integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use peerlink_session_core::media::loopback::{LoopbackCapture, LoopbackEngine, LoopbackOptions};
use peerlink_session_core::signaling::MemoryRelay;
use peerlink_session_core::{NegotiationState, SessionConfig, SessionHandle, SessionStatus, SessionSupervisor};

pub const WAIT: Duration = Duration::from_secs(5);

/// Install a test subscriber once; honours RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with short backoffs for tests
pub fn test_config() -> SessionConfig {
    SessionConfig::default()
        .with_resubscribe(3, Duration::from_millis(10))
        .with_teardown_timeout(Duration::from_secs(2))
}

/// One party: its supervisor plus the loopback collaborators it was built with
pub struct TestPeer {
    pub supervisor: SessionSupervisor,
    pub engine: LoopbackEngine,
    pub capture: LoopbackCapture,
}

impl TestPeer {
    pub fn new(local_id: &str, relay: &MemoryRelay) -> Self {
        Self::with_options(local_id, relay, LoopbackOptions::default(), test_config())
    }

    pub fn with_options(local_id: &str, relay: &MemoryRelay, options: LoopbackOptions, config: SessionConfig) -> Self {
        let engine = LoopbackEngine::with_options(options);
        let capture = LoopbackCapture::new();
        let supervisor = SessionSupervisor::builder()
            .local_id(local_id)
            .relay(Arc::new(relay.clone()))
            .engine(Arc::new(engine.clone()))
            .capture(Arc::new(capture.clone()))
            .config(config)
            .build()
            .expect("supervisor should build");
        Self {
            supervisor,
            engine,
            capture,
        }
    }

    /// Offerer whose local offer body is fixed
    pub fn offering(local_id: &str, relay: &MemoryRelay, offer_sdp: &str) -> Self {
        let options = LoopbackOptions {
            offer_sdp: Some(offer_sdp.to_string()),
            ..LoopbackOptions::default()
        };
        Self::with_options(local_id, relay, options, test_config())
    }
}

/// Wait until the session status satisfies `predicate`, returning it.
/// Returns the final status if the session task ends first.
pub async fn wait_for_status<F>(handle: &SessionHandle, mut predicate: F) -> SessionStatus
where
    F: FnMut(&SessionStatus) -> bool,
{
    let mut rx = handle.watch_status();
    tokio::time::timeout(WAIT, async move {
        loop {
            let status = rx.borrow_and_update().clone();
            if predicate(&status) {
                return status;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    })
    .await
    .expect("timed out waiting for session status")
}

pub async fn wait_for_terminal(handle: &SessionHandle) -> SessionStatus {
    wait_for_status(handle, SessionStatus::is_terminal).await
}

pub async fn wait_for_negotiation(handle: &SessionHandle, expected: NegotiationState) -> NegotiationState {
    let mut rx = handle.watch_negotiation();
    tokio::time::timeout(WAIT, async move {
        loop {
            let state = *rx.borrow_and_update();
            if state == expected || state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    })
    .await
    .expect("timed out waiting for negotiation state")
}

/// Poll `condition` until it holds
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}
