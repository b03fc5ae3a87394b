//! Traits for the swarm substrate this layer runs on.
//!
//! The networker owns discovery and connections; this crate only consumes it:
//! - [`Networker`]: join/leave discovery keys, publish connection events
//! - [`PeerConnection`]: one live connection, carved into labelled channels
//! - [`Channel`]: one logical, ordered, bidirectional byte-message pipe
//!
//! Events flow from the networker to the muxer over an mpsc channel rather
//! than callbacks, so delivery order is explicit.

use crate::keys::DiscoveryKey;
use async_trait::async_trait;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Already joined discovery key {0}")]
    AlreadyJoined(DiscoveryKey),

    #[error("Failed to open channel {label}: {reason}")]
    ChannelOpen { label: String, reason: String },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Replication setup failed: {0}")]
    ReplicationSetup(String),

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Stable identity of a peer connection for as long as it is open.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Options passed along with a discovery join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOptions {
    /// Advertise ourselves under the key
    pub announce: bool,
    /// Look up other peers under the key
    pub lookup: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            announce: true,
            lookup: true,
        }
    }
}

/// Event published by the networker.
#[derive(Clone)]
pub enum SwarmEvent {
    /// A connection is live for `discovery_key`.
    ///
    /// The same connection may be reported once per discovery key it serves.
    Connected {
        connection: Arc<dyn PeerConnection>,
        discovery_key: DiscoveryKey,
    },
    /// The connection is gone; every channel on it is closed.
    Closed { connection_id: ConnectionId },
}

impl fmt::Debug for SwarmEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SwarmEvent::Connected {
                connection,
                discovery_key,
            } => f
                .debug_struct("Connected")
                .field("connection_id", connection.id())
                .field("discovery_key", discovery_key)
                .finish(),
            SwarmEvent::Closed { connection_id } => f
                .debug_struct("Closed")
                .field("connection_id", connection_id)
                .finish(),
        }
    }
}

/// A logical channel multiplexed over one peer connection.
///
/// Messages are delivered whole and in order. `recv` must be cancel-safe:
/// dropping a pending `recv` future never loses a message.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Label the channel was opened with.
    fn label(&self) -> &str;

    /// Send one message to the other end.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Receive the next message; `Ok(None)` once the channel is closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Close this channel without affecting the rest of the connection.
    async fn close(&self) -> Result<()>;
}

/// An active connection to a peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Connection identity, stable while the connection is open.
    fn id(&self) -> &ConnectionId;

    /// Whether we dialed this connection.
    fn is_initiator(&self) -> bool;

    /// Open a logical channel.
    ///
    /// Both peers open channels by the same label; the substrate pairs them.
    async fn open_channel(&self, label: &str) -> Result<Box<dyn Channel>>;
}

/// The swarm connection manager.
#[async_trait]
pub trait Networker: Send + Sync {
    /// Join the swarm for a discovery key. Idempotent per key; a repeat may
    /// fail with [`TransportError::AlreadyJoined`].
    async fn join(&self, discovery_key: DiscoveryKey, options: JoinOptions) -> Result<()>;

    /// Stop announcing and looking up a discovery key.
    async fn leave(&self, discovery_key: DiscoveryKey) -> Result<()>;

    /// Subscribe to connection events.
    ///
    /// Connections that are already live are replayed into the new receiver.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SwarmEvent>;
}
