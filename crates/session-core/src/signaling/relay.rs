//! Relay store interface.
//!
//! The relay is an external append-only publish/subscribe store keyed by
//! recipient address. It is only a message ferry: it never interprets the
//! entries it carries.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

use super::RelayError;

/// One stored entry. `key` is the append position within its address.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayEntry {
    pub key: u64,
    pub value: Value,
}

/// Delivered to a listener
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// An entry appended to the listened address
    Added(RelayEntry),
    /// The store cancelled the listener; no further events follow
    Cancelled { reason: String },
}

/// Relay store consumed by the signal channel.
///
/// The relay connection may be shared by every session of the process; each
/// listener is a read-only fan-out of one address.
#[async_trait]
pub trait RelayStore: Send + Sync + 'static {
    /// Append `value` under `address`, returning its order key
    async fn append(&self, address: &str, value: Value) -> Result<u64, RelayError>;

    /// Open a listener on `address`. Entries already stored are delivered
    /// first, in append order, followed by new entries as they arrive.
    async fn listen(&self, address: &str) -> Result<RelayListener, RelayError>;

    /// Order key of the newest entry under `address`, `None` if it is empty
    async fn tail(&self, address: &str) -> Result<Option<u64>, RelayError>;
}

/// An open listener on one relay address.
///
/// The listener is released exactly once: explicitly via [`release`](Self::release)
/// or implicitly on drop.
pub struct RelayListener {
    address: String,
    events: mpsc::UnboundedReceiver<RelayEvent>,
    on_release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl RelayListener {
    pub fn new(
        address: impl Into<String>,
        events: mpsc::UnboundedReceiver<RelayEvent>,
        on_release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            address: address.into(),
            events,
            on_release: Some(Box::new(on_release)),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Next event, or `None` once the listener is released or the store
    /// dropped its side.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        if self.on_release.is_none() {
            return None;
        }
        self.events.recv().await
    }

    pub fn is_released(&self) -> bool {
        self.on_release.is_none()
    }

    /// Release the listener. Returns `true` if this call released it.
    pub fn release(&mut self) -> bool {
        match self.on_release.take() {
            Some(release) => {
                self.events.close();
                release();
                true
            }
            None => false,
        }
    }
}

impl Drop for RelayListener {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for RelayListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayListener")
            .field("address", &self.address)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_release_runs_once() {
        let (tx, rx) = mpsc::unbounded_channel();
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let mut listener = RelayListener::new("signals/alice", rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(RelayEvent::Cancelled { reason: "test".to_string() }).unwrap();
        assert!(listener.recv().await.is_some());

        assert!(listener.release());
        assert!(!listener.release());
        drop(listener);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_released_listener_yields_nothing() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listener = RelayListener::new("signals/alice", rx, || {});
        listener.release();
        let _ = tx.send(RelayEvent::Cancelled { reason: "late".to_string() });
        assert!(listener.recv().await.is_none());
    }
}
