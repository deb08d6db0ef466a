//! In-process relay store.
//!
//! Keeps one append-only log per address and fans new entries out to every
//! open listener. Used by the demo binary and by tests, which can also inject
//! failures and cancel listeners.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use super::relay::{RelayEntry, RelayEvent, RelayListener, RelayStore};
use super::RelayError;

#[derive(Default)]
struct AddressLog {
    entries: Vec<RelayEntry>,
    listeners: HashMap<u64, mpsc::UnboundedSender<RelayEvent>>,
    listens: usize,
    releases: usize,
}

#[derive(Default)]
struct RelayState {
    logs: HashMap<String, AddressLog>,
    next_listener_id: u64,
    failing_appends: usize,
    failing_listens: usize,
}

/// Shared in-memory relay. Clones refer to the same store.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry stored under `address`
    pub fn entries(&self, address: &str) -> Vec<RelayEntry> {
        self.state
            .lock()
            .logs
            .get(address)
            .map(|log| log.entries.clone())
            .unwrap_or_default()
    }

    /// Number of listeners currently open on `address`
    pub fn listener_count(&self, address: &str) -> usize {
        self.state
            .lock()
            .logs
            .get(address)
            .map(|log| log.listeners.len())
            .unwrap_or(0)
    }

    /// Listeners ever opened on `address`
    pub fn listen_count(&self, address: &str) -> usize {
        self.state.lock().logs.get(address).map(|log| log.listens).unwrap_or(0)
    }

    /// Listeners released by their owner on `address`
    pub fn release_count(&self, address: &str) -> usize {
        self.state.lock().logs.get(address).map(|log| log.releases).unwrap_or(0)
    }

    /// Make the next `count` appends fail with [`RelayError::Unavailable`]
    pub fn fail_next_appends(&self, count: usize) {
        self.state.lock().failing_appends = count;
    }

    /// Make the next `count` listen requests fail with [`RelayError::Unavailable`]
    pub fn fail_next_listens(&self, count: usize) {
        self.state.lock().failing_listens = count;
    }

    /// Cancel every listener on `address`, as a store-side revocation would
    pub fn cancel_listeners(&self, address: &str, reason: &str) -> usize {
        let mut state = self.state.lock();
        let Some(log) = state.logs.get_mut(address) else {
            return 0;
        };
        let cancelled = log.listeners.len();
        for (_, sender) in log.listeners.drain() {
            let _ = sender.send(RelayEvent::Cancelled {
                reason: reason.to_string(),
            });
        }
        debug!("Cancelled {} listener(s) on {}: {}", cancelled, address, reason);
        cancelled
    }

    fn release_listener(state: &Weak<Mutex<RelayState>>, address: &str, id: u64) {
        if let Some(state) = state.upgrade() {
            let mut state = state.lock();
            if let Some(log) = state.logs.get_mut(address) {
                log.listeners.remove(&id);
                log.releases += 1;
            }
        }
    }
}

#[async_trait]
impl RelayStore for MemoryRelay {
    async fn append(&self, address: &str, value: Value) -> Result<u64, RelayError> {
        let mut state = self.state.lock();
        if state.failing_appends > 0 {
            state.failing_appends -= 1;
            return Err(RelayError::Unavailable(format!("append to {} refused", address)));
        }

        let log = state.logs.entry(address.to_string()).or_default();
        let entry = RelayEntry {
            key: log.entries.len() as u64,
            value,
        };
        log.entries.push(entry.clone());
        log.listeners
            .retain(|_, sender| sender.send(RelayEvent::Added(entry.clone())).is_ok());

        Ok(entry.key)
    }

    async fn listen(&self, address: &str) -> Result<RelayListener, RelayError> {
        let mut state = self.state.lock();
        if state.failing_listens > 0 {
            state.failing_listens -= 1;
            return Err(RelayError::Unavailable(format!("listen on {} refused", address)));
        }

        let id = state.next_listener_id;
        state.next_listener_id += 1;

        let (sender, receiver) = mpsc::unbounded_channel();
        let log = state.logs.entry(address.to_string()).or_default();
        for entry in &log.entries {
            // Receiver is held locally, the send cannot fail
            let _ = sender.send(RelayEvent::Added(entry.clone()));
        }
        log.listeners.insert(id, sender);
        log.listens += 1;

        let weak = Arc::downgrade(&self.state);
        let owned_address = address.to_string();
        Ok(RelayListener::new(address, receiver, move || {
            MemoryRelay::release_listener(&weak, &owned_address, id);
        }))
    }

    async fn tail(&self, address: &str) -> Result<Option<u64>, RelayError> {
        Ok(self
            .state
            .lock()
            .logs
            .get(address)
            .and_then(|log| log.entries.last())
            .map(|entry| entry.key))
    }
}
