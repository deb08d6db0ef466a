//! Session configuration.
//!
//! Every field has a default, so a partial TOML file or a handful of
//! `PEERLINK__*` environment variables is enough to override it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{Result, SessionError};
use crate::media::{CaptureConstraints, ConnectionConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capture format requested when local media is prepared
    pub capture: CaptureConstraints,
    /// Peer connection settings
    pub connection: ConnectionConfig,
    /// Relay path under which per-peer inboxes live
    pub relay_root: String,
    /// Attempts to re-establish a cancelled subscription after the handshake
    pub resubscribe_attempts: u32,
    pub resubscribe_backoff_ms: u64,
    /// Extra attempts for publishing a local candidate
    pub candidate_publish_retries: u32,
    /// Capacity of the session event broadcast channel
    pub event_capacity: usize,
    /// How long cancel and shutdown wait for a session to tear down
    pub teardown_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConstraints::default(),
            connection: ConnectionConfig::default(),
            relay_root: "signals".to_string(),
            resubscribe_attempts: 3,
            resubscribe_backoff_ms: 250,
            candidate_publish_retries: 2,
            event_capacity: 256,
            teardown_timeout_ms: 5000,
        }
    }
}

impl SessionConfig {
    pub fn with_relay_root(mut self, root: impl Into<String>) -> Self {
        self.relay_root = root.into();
        self
    }

    pub fn with_capture(mut self, capture: CaptureConstraints) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_resubscribe(mut self, attempts: u32, backoff: Duration) -> Self {
        self.resubscribe_attempts = attempts;
        self.resubscribe_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// Bound on each release step of a teardown. The steps together stay
    /// inside [`teardown_timeout`](Self::teardown_timeout).
    pub fn release_step_timeout(&self) -> Duration {
        self.teardown_timeout() / 4
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(SessionError::configuration("capture resolution must be non-zero"));
        }
        if self.capture.frame_rate == 0 {
            return Err(SessionError::configuration("capture frame rate must be non-zero"));
        }
        if self.relay_root.trim_matches('/').trim().is_empty() {
            return Err(SessionError::configuration("relay root must not be empty"));
        }
        if self.event_capacity == 0 {
            return Err(SessionError::configuration("event capacity must be non-zero"));
        }
        if self.teardown_timeout_ms == 0 {
            return Err(SessionError::configuration("teardown timeout must be non-zero"));
        }
        for server in &self.connection.ice_servers {
            if server.urls.is_empty() {
                return Err(SessionError::configuration("ICE server entry without urls"));
            }
        }
        Ok(())
    }
}
