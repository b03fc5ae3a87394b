//! Event infrastructure for feedmux.
//!
//! Provides `MuxEvent` for monitoring and fault reporting, and `EventBus` for
//! subscriptions. Per-engine faults never propagate as errors past their
//! group; they surface here instead.

use crate::keys::{DiscoveryKey, FeedKey, RootKey};
use crate::transport::ConnectionId;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the muxer, its sessions and their engines.
///
/// Session lifecycle events carry the session name. Everything an engine
/// reports carries the discovery key of its group, since the engines on a
/// key serve every local session joined on it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MuxEvent {
    /// A session was created by `join`.
    #[serde(rename_all = "camelCase")]
    SessionJoined {
        session: String,
        root_key: RootKey,
        timestamp: f64,
    },
    /// A group started an engine for a peer connection.
    #[serde(rename_all = "camelCase")]
    PeerAttached {
        group: DiscoveryKey,
        connection_id: ConnectionId,
        timestamp: f64,
    },
    /// An announce went out on a membership channel.
    #[serde(rename_all = "camelCase")]
    AnnounceSent {
        group: DiscoveryKey,
        connection_id: ConnectionId,
        /// Number of keys in the announce.
        count: usize,
        /// Encoded size in bytes.
        size: usize,
        timestamp: f64,
    },
    /// An announce arrived on a membership channel.
    #[serde(rename_all = "camelCase")]
    AnnounceReceived {
        group: DiscoveryKey,
        connection_id: ConnectionId,
        count: usize,
        /// Keys in the announce not heard from this peer before.
        fresh: usize,
        timestamp: f64,
    },
    /// A remote feed finished replication setup and joined the group.
    #[serde(rename_all = "camelCase")]
    FeedLearned {
        group: DiscoveryKey,
        connection_id: ConnectionId,
        feed_key: FeedKey,
        timestamp: f64,
    },
    /// An engine reached steady state.
    #[serde(rename_all = "camelCase")]
    EngineSteady {
        group: DiscoveryKey,
        connection_id: ConnectionId,
        timestamp: f64,
    },
    /// An engine stopped (channel or connection teardown).
    #[serde(rename_all = "camelCase")]
    EngineClosed {
        group: DiscoveryKey,
        connection_id: ConnectionId,
        timestamp: f64,
    },
    /// An engine failed: its channel could not be opened, the peer sent a
    /// malformed announce, or the channel errored.
    #[serde(rename_all = "camelCase")]
    EngineFailed {
        group: DiscoveryKey,
        connection_id: ConnectionId,
        error: String,
        timestamp: f64,
    },
    /// Replication setup for one feed with one peer failed.
    #[serde(rename_all = "camelCase")]
    ReplicationFailed {
        group: DiscoveryKey,
        connection_id: ConnectionId,
        feed_key: FeedKey,
        error: String,
        timestamp: f64,
    },
    /// A session was closed by `leave` or `close`.
    #[serde(rename_all = "camelCase")]
    SessionClosed { session: String, timestamp: f64 },
}

impl MuxEvent {
    /// Event type name, matching the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            MuxEvent::SessionJoined { .. } => "sessionJoined",
            MuxEvent::PeerAttached { .. } => "peerAttached",
            MuxEvent::AnnounceSent { .. } => "announceSent",
            MuxEvent::AnnounceReceived { .. } => "announceReceived",
            MuxEvent::FeedLearned { .. } => "feedLearned",
            MuxEvent::EngineSteady { .. } => "engineSteady",
            MuxEvent::EngineClosed { .. } => "engineClosed",
            MuxEvent::EngineFailed { .. } => "engineFailed",
            MuxEvent::ReplicationFailed { .. } => "replicationFailed",
            MuxEvent::SessionClosed { .. } => "sessionClosed",
        }
    }
}

/// Milliseconds since Unix epoch, for event timestamps.
pub fn now_ms() -> f64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(MuxEvent) + Send + Sync>;

/// Event bus for publishing mux events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(MuxEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: MuxEvent) {
        // Clone the list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
