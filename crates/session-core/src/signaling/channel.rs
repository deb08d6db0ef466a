//! Send-to-peer and receive-from-peer over the relay store.
//!
//! A party receives on `<root>/<own id>` and sends to `<root>/<remote id>`.

use std::sync::Arc;
use tracing::{debug, warn};

use super::message::SignalMessage;
use super::relay::{RelayEvent, RelayListener, RelayStore};
use super::ChannelError;
use crate::types::PeerId;

/// A message taken from the local inbox, with its relay order key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedSignal {
    pub message: SignalMessage,
    pub order: u64,
}

/// Signal channel bound to one relay root
#[derive(Clone)]
pub struct SignalChannel {
    relay: Arc<dyn RelayStore>,
    root: String,
}

impl SignalChannel {
    pub fn new(relay: Arc<dyn RelayStore>, root: impl Into<String>) -> Self {
        Self {
            relay,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Relay address of `peer`'s inbox
    pub fn address_for(&self, peer: &PeerId) -> String {
        let root = self.root.trim_end_matches('/');
        if root.is_empty() {
            peer.to_string()
        } else {
            format!("{}/{}", root, peer)
        }
    }

    /// Append `message` to `remote`'s inbox. No delivery guarantee beyond the
    /// relay's append semantics.
    pub async fn send(&self, remote: &PeerId, message: &SignalMessage) -> Result<(), ChannelError> {
        let address = self.address_for(remote);
        let value = message.to_wire().map_err(|e| ChannelError::Encode {
            message: e.to_string(),
        })?;

        let key = self
            .relay
            .append(&address, value)
            .await
            .map_err(|e| ChannelError::Publish {
                address: address.clone(),
                message: e.to_string(),
            })?;

        debug!("Published {} to {} (key {})", message.kind(), address, key);
        Ok(())
    }

    /// Open the local inbox. Entries already stored are delivered first.
    pub async fn subscribe(&self, local: &PeerId) -> Result<SignalSubscription, ChannelError> {
        self.resubscribe(local, None).await
    }

    /// Open the local inbox, delivering only entries appended from now on
    pub async fn subscribe_from_tail(&self, local: &PeerId) -> Result<SignalSubscription, ChannelError> {
        let tail = self.tail(local).await?;
        self.resubscribe(local, tail).await
    }

    /// Order key of the newest entry in the local inbox
    pub async fn tail(&self, local: &PeerId) -> Result<Option<u64>, ChannelError> {
        let address = self.address_for(local);
        self.relay
            .tail(&address)
            .await
            .map_err(|e| ChannelError::Subscribe {
                address: address.clone(),
                message: e.to_string(),
            })
    }

    /// Open the local inbox again, skipping entries up to and including
    /// `after`.
    pub async fn resubscribe(
        &self,
        local: &PeerId,
        after: Option<u64>,
    ) -> Result<SignalSubscription, ChannelError> {
        let address = self.address_for(local);
        let listener = self
            .relay
            .listen(&address)
            .await
            .map_err(|e| ChannelError::Subscribe {
                address: address.clone(),
                message: e.to_string(),
            })?;

        debug!("Subscribed to {} (resume after {:?})", address, after);
        Ok(SignalSubscription {
            address,
            listener: Some(listener),
            last_order: after,
            termination: None,
            skipped: 0,
        })
    }
}

/// Ordered sequence of messages arriving in the local inbox.
///
/// The sequence ends when the listener is cancelled by the store or released
/// by its owner; it is restarted only by subscribing again.
#[derive(Debug)]
pub struct SignalSubscription {
    address: String,
    listener: Option<RelayListener>,
    last_order: Option<u64>,
    termination: Option<ChannelError>,
    skipped: u64,
}

impl SignalSubscription {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Next well-formed message, or `None` once the sequence has ended.
    ///
    /// Malformed and unknown entries are skipped with a warning. Cancel safe.
    pub async fn next(&mut self) -> Option<ReceivedSignal> {
        loop {
            let listener = self.listener.as_mut()?;
            match listener.recv().await {
                Some(RelayEvent::Added(entry)) => {
                    if matches!(self.last_order, Some(last) if entry.key <= last) {
                        continue;
                    }
                    self.last_order = Some(entry.key);

                    match SignalMessage::from_wire(&entry.value) {
                        Ok(message) => {
                            return Some(ReceivedSignal {
                                message,
                                order: entry.key,
                            })
                        }
                        Err(e) => {
                            self.skipped += 1;
                            warn!("Skipping entry {} on {}: {}", entry.key, self.address, e);
                        }
                    }
                }
                Some(RelayEvent::Cancelled { reason }) => {
                    warn!("Listener on {} cancelled: {}", self.address, reason);
                    self.terminate(reason);
                    return None;
                }
                None => {
                    if self.listener.as_ref().is_some_and(|l| !l.is_released()) {
                        self.terminate("relay closed the listener".to_string());
                    }
                    return None;
                }
            }
        }
    }

    fn terminate(&mut self, reason: String) {
        self.termination = Some(ChannelError::ListenerCancelled {
            address: self.address.clone(),
            reason,
        });
        self.release();
    }

    /// Why the sequence ended, if the store ended it
    pub fn take_termination(&mut self) -> Option<ChannelError> {
        self.termination.take()
    }

    /// Order key of the last entry consumed, malformed ones included
    pub fn last_order(&self) -> Option<u64> {
        self.last_order
    }

    /// Entries skipped as malformed or unknown
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn is_active(&self) -> bool {
        self.listener.as_ref().is_some_and(|l| !l.is_released())
    }

    /// Release the underlying listener. Returns `true` on the first call only.
    pub fn release(&mut self) -> bool {
        match self.listener.as_mut() {
            Some(listener) => listener.release(),
            None => false,
        }
    }
}
