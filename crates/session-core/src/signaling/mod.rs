//! Signal Channel
//!
//! Typed, directional signaling over an external append-only relay store.
//! This layer carries no negotiation logic:
//!
//! - `message`: the signaling message variants and their wire encoding
//! - `relay`: the relay store interface consumed by the channel
//! - `memory`: an in-process relay store
//! - `channel`: send-to-peer / receive-from-peer over the relay

pub mod channel;
pub mod memory;
pub mod message;
pub mod relay;

pub use channel::{ReceivedSignal, SignalChannel, SignalSubscription};
pub use memory::MemoryRelay;
pub use message::{SignalMessage, WireError};
pub use relay::{RelayEntry, RelayEvent, RelayListener, RelayStore};

/// Errors reported by a relay store implementation
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("Relay unavailable: {0}")]
    Unavailable(String),

    #[error("Relay rejected the request: {0}")]
    Rejected(String),
}

/// Signal channel errors. Retryable by subscribing again, except encoding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to publish to {address}: {message}")]
    Publish { address: String, message: String },

    #[error("Failed to subscribe to {address}: {message}")]
    Subscribe { address: String, message: String },

    #[error("Listener on {address} cancelled: {reason}")]
    ListenerCancelled { address: String, reason: String },

    #[error("Failed to encode signal: {message}")]
    Encode { message: String },
}

impl ChannelError {
    /// Whether re-establishing the subscription or re-publishing may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ChannelError::Encode { .. })
    }
}
