//! feedmux-core: Multiplexes replication groups of append-only feeds over one
//! shared peer-to-peer swarm.
//!
//! This crate provides:
//! - A `Muxer` that joins root keys on a shared networker and routes
//!   connections to the right sessions
//! - `GroupSession`s tracking the local and learned feeds of one group
//! - The membership protocol engine converging feed sets between two peers
//! - Networker, connection, channel and replicator trait abstractions
//! - An in-memory swarm and feed store for tests and simulation

pub mod config;
pub mod engine;
pub mod events;
pub mod feed;
mod group;
pub mod keys;
pub mod memory;
pub mod muxer;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::{ConfigError, MuxConfig};
pub use engine::{EngineError, EnginePhase};
pub use events::{EventBus, MuxEvent, Subscription};
pub use feed::{Feed, FeedHandle, Replicator};
pub use keys::{DiscoveryKey, FeedKey, KeyError, RootKey};
pub use muxer::{MuxError, Muxer};
pub use session::{GroupSession, SessionId, SessionOptions, SessionStatus};
pub use transport::{
    Channel, ConnectionId, JoinOptions, Networker, PeerConnection, SwarmEvent, TransportError,
};
