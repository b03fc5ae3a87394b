//! Group session: one local join of one root key.
//!
//! A session is a named handle onto the group for its root key. Sessions
//! joined on the same key share that group's feeds and engines, so they
//! converge with each other and with every peer; each keeps its own identity
//! and is closed on its own. The group stops its engines when its last
//! session closes.

use crate::engine::EnginePhase;
use crate::events::{now_ms, MuxEvent};
use crate::feed::FeedHandle;
use crate::group::GroupShared;
use crate::keys::{DiscoveryKey, FeedKey, RootKey};
use crate::transport::{ConnectionId, PeerConnection};
use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Opaque session identity, unique within one muxer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Options for [`Muxer::join`](crate::Muxer::join).
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Diagnostic label used in logs and events
    pub name: Option<String>,
}

impl SessionOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

/// Snapshot of a session's convergence state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Distinct feeds in `feeds()`
    pub feeds: usize,
    /// Engines attached (any phase)
    pub engines: usize,
    /// Engines that are Steady or Closed
    pub settled_engines: usize,
    /// Replication fetches started and not yet finished
    pub in_flight: usize,
    pub closed: bool,
}

impl SessionStatus {
    /// Nothing left to exchange until something changes locally or a peer
    /// connects.
    pub fn is_quiescent(&self) -> bool {
        self.settled_engines == self.engines && self.in_flight == 0
    }
}

/// Handle to one join of a root key. Cheap to clone.
#[derive(Clone)]
pub struct GroupSession {
    id: SessionId,
    name: String,
    group: Arc<GroupShared>,
}

impl fmt::Debug for GroupSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupSession")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("discovery_key", self.group.discovery_key())
            .finish()
    }
}

impl GroupSession {
    pub(crate) fn new(id: SessionId, name: String, group: Arc<GroupShared>) -> Self {
        if !group.attach(id) {
            warn!("[{}] Joined group {} after it closed", name, group.name());
        }
        Self { id, name, group }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_key(&self) -> RootKey {
        self.group.root_key()
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        *self.group.discovery_key()
    }

    /// Add a local feed to the group.
    ///
    /// Idempotent: returns false if the key was already local, through this
    /// session or another one on the same root key. Otherwise the feed is
    /// queued as a delta announce to every connected peer that has neither
    /// been sent it nor announced it itself.
    pub fn add_feed(&self, feed: FeedHandle) -> bool {
        self.group.add_feed(self.id, feed)
    }

    /// Every feed in the group as far as this node knows: local feeds in the
    /// order added, then learned feeds in the order learned.
    pub fn feeds(&self) -> Vec<FeedHandle> {
        self.group.feeds()
    }

    /// Keys of [`feeds`](Self::feeds), same order.
    pub fn feed_keys(&self) -> Vec<FeedKey> {
        self.feeds().iter().map(|f| f.key()).collect()
    }

    pub fn has_feed(&self, key: &FeedKey) -> bool {
        self.group.holds(key)
    }

    /// Start an engine for a connection serving this session's root key.
    ///
    /// Returns false for a closed session, or when the group already runs an
    /// engine on this connection.
    pub fn on_peer_connection(&self, connection: Arc<dyn PeerConnection>) -> bool {
        if !self.group.is_member(self.id) {
            return false;
        }
        self.group.on_peer_connection(connection)
    }

    /// Tear down the engine bound to a closed connection.
    pub fn on_peer_closed(&self, connection_id: &ConnectionId) -> bool {
        self.group.on_peer_closed(connection_id)
    }

    /// Phase of the engine bound to `connection_id`, if any.
    pub fn engine_phase(&self, connection_id: &ConnectionId) -> Option<EnginePhase> {
        self.group.engine_phase(connection_id)
    }

    /// Number of attached engines, in any phase.
    pub fn peer_count(&self) -> usize {
        self.group.peer_count()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            closed: self.is_closed(),
            ..self.group.status()
        }
    }

    /// Watch the group's status; changes on every feed, engine or in-flight
    /// transition. `closed` turns true once the last session on the key has
    /// closed.
    pub fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.group.watch()
    }

    pub fn is_closed(&self) -> bool {
        !self.group.is_member(self.id)
    }

    /// Close this session. Idempotent.
    pub(crate) fn close(&self) {
        if !self.group.detach(self.id) {
            return;
        }
        info!("[{}] Session closed", self.name);
        self.group.emit(MuxEvent::SessionClosed {
            session: self.name.clone(),
            timestamp: now_ms(),
        });
    }
}
