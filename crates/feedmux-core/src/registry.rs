//! Bookkeeping for the muxer: live connections and discovery joins.
//!
//! Provides `ConnectionRegistry` for tracking which discovery keys each live
//! connection serves, and `JoinTable` for reference counting swarm joins and
//! holding later joiners until the first network join settles.
//! Neither type locks internally; the muxer keeps both behind its own lock.

use crate::keys::DiscoveryKey;
use crate::transport::{ConnectionId, PeerConnection};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;

/// Tracked state for a live connection.
pub struct LiveConnection {
    pub connection: Arc<dyn PeerConnection>,
    /// Discovery keys the networker reported this connection for
    pub discovery_keys: HashSet<DiscoveryKey>,
}

/// Registry of live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, LiveConnection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `connection` serves `discovery_key`.
    ///
    /// Returns false when this (connection, key) pair was already recorded,
    /// so duplicate deliveries from the networker can be dropped.
    pub fn connection_seen(
        &mut self,
        connection: Arc<dyn PeerConnection>,
        discovery_key: DiscoveryKey,
    ) -> bool {
        let entry = self
            .connections
            .entry(connection.id().clone())
            .or_insert_with(|| LiveConnection {
                connection,
                discovery_keys: HashSet::new(),
            });
        entry.discovery_keys.insert(discovery_key)
    }

    /// Forget a connection. Returns its state if it was known.
    pub fn connection_closed(&mut self, id: &ConnectionId) -> Option<LiveConnection> {
        self.connections.remove(id)
    }

    /// Live connections serving `discovery_key`.
    pub fn connections_for(&self, discovery_key: &DiscoveryKey) -> Vec<Arc<dyn PeerConnection>> {
        self.connections
            .values()
            .filter(|c| c.discovery_keys.contains(discovery_key))
            .map(|c| Arc::clone(&c.connection))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn clear(&mut self) {
        self.connections.clear();
    }
}

/// Progress of the network join behind one discovery key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    /// The first session's network join has not returned yet
    Pending,
    Joined,
    Failed,
}

struct JoinEntry {
    count: usize,
    state: watch::Sender<JoinState>,
}

/// A reference taken with [`JoinTable::acquire`].
pub struct JoinTicket {
    /// This reference made the 0→1 transition and must issue the join
    pub first: bool,
    /// Resolves once the first holder settles the join
    pub state: watch::Receiver<JoinState>,
}

/// Reference counts of swarm joins per discovery key.
///
/// Only the 0→1 transition should issue a network join and only 1→0 a leave,
/// so any number of sessions on one root key share one swarm membership.
/// Later holders wait on their ticket until the first holder settles the
/// join; a failed join drops every reference at once.
#[derive(Default)]
pub struct JoinTable {
    entries: HashMap<DiscoveryKey, JoinEntry>,
}

impl JoinTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference.
    pub fn acquire(&mut self, key: DiscoveryKey) -> JoinTicket {
        let entry = self.entries.entry(key).or_insert_with(|| JoinEntry {
            count: 0,
            state: watch::channel(JoinState::Pending).0,
        });
        entry.count += 1;
        JoinTicket {
            first: entry.count == 1,
            state: entry.state.subscribe(),
        }
    }

    /// Record the outcome of the network join.
    ///
    /// A failure removes the key with all of its references; returns how
    /// many were dropped that way.
    pub fn settle(&mut self, key: &DiscoveryKey, joined: bool) -> usize {
        if joined {
            if let Some(entry) = self.entries.get(key) {
                entry.state.send_replace(JoinState::Joined);
            }
            return 0;
        }
        match self.entries.remove(key) {
            Some(entry) => {
                entry.state.send_replace(JoinState::Failed);
                entry.count
            }
            None => 0,
        }
    }

    /// Drop a reference. Returns true on the 1→0 transition; releasing a key
    /// with no references is a no-op returning false.
    pub fn release(&mut self, key: &DiscoveryKey) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.count > 1 => {
                entry.count -= 1;
                false
            }
            Some(_) => {
                self.entries.remove(key);
                true
            }
            None => false,
        }
    }

    pub fn count(&self, key: &DiscoveryKey) -> usize {
        self.entries.get(key).map(|e| e.count).unwrap_or(0)
    }

    pub fn state(&self, key: &DiscoveryKey) -> Option<JoinState> {
        self.entries.get(key).map(|e| *e.state.borrow())
    }

    /// Whether the network join for `key` went through and is still held.
    pub fn is_joined(&self, key: &DiscoveryKey) -> bool {
        self.state(key) == Some(JoinState::Joined)
    }

    /// Remove every entry, returning the keys whose network join went
    /// through. Tickets still waiting see their sender dropped.
    pub fn drain(&mut self) -> Vec<DiscoveryKey> {
        self.entries
            .drain()
            .filter(|(_, entry)| *entry.state.borrow() == JoinState::Joined)
            .map(|(key, _)| key)
            .collect()
    }
}
