//! Group state: everything one muxer knows about one discovery key.
//!
//! Every session joined on the same root key is a handle onto one
//! `GroupShared`. The group owns the feed set and one engine per peer
//! connection, so a connection carries exactly one membership channel per
//! discovery key no matter how many local sessions asked for it. The peer
//! pairs channels by label, and a second local channel under the same label
//! would never find a partner.
//!
//! All state lives behind a single lock, so adding a feed, starting an engine
//! and recording an announce are atomic with respect to each other: a
//! connection that arrives while a feed is being added either gets the feed
//! in its initial announce or as a delta, never both and never neither.

use crate::config::MuxConfig;
use crate::engine::{Engine, EngineError, EnginePhase};
use crate::events::{now_ms, EventBus, MuxEvent};
use crate::feed::{FeedHandle, Replicator};
use crate::keys::{DiscoveryKey, FeedKey, RootKey};
use crate::protocol::session_label;
use crate::session::{SessionId, SessionStatus};
use crate::transport::{ConnectionId, PeerConnection, TransportError};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Result of recording an announce against one engine.
pub(crate) struct AnnounceOutcome {
    /// Keys not heard from this peer before
    pub fresh: usize,
    /// Fresh keys the group does not hold yet
    pub fetch: Vec<FeedKey>,
}

/// Per-connection engine state owned by the group.
struct EngineSlot {
    outbox: mpsc::UnboundedSender<Vec<FeedHandle>>,
    /// Keys we announced to this peer
    sent: HashSet<FeedKey>,
    /// Keys this peer announced to us
    remote_known: HashSet<FeedKey>,
    phase: EnginePhase,
    task: AbortHandle,
}

impl EngineSlot {
    /// Queue `feed` for this peer unless either side already announced it.
    fn queue(&mut self, feed: &FeedHandle) {
        let key = feed.key();
        if self.phase == EnginePhase::Closed
            || self.sent.contains(&key)
            || self.remote_known.contains(&key)
        {
            return;
        }
        // A send error means the engine already exited; its slot goes away
        // with the connection.
        if self.outbox.send(vec![Arc::clone(feed)]).is_ok() {
            self.sent.insert(key);
        }
    }
}

struct GroupState {
    /// Open sessions on this key
    members: HashSet<SessionId>,
    local: IndexMap<FeedKey, FeedHandle>,
    learned: IndexMap<FeedKey, FeedHandle>,
    engines: HashMap<ConnectionId, EngineSlot>,
    in_flight: usize,
    closed: bool,
}

impl GroupState {
    fn holds(&self, key: &FeedKey) -> bool {
        self.local.contains_key(key) || self.learned.contains_key(key)
    }

    /// Local feeds in insertion order, then learned feeds in learn order.
    fn union(&self) -> Vec<FeedHandle> {
        self.local
            .values()
            .chain(
                self.learned
                    .iter()
                    .filter(|(key, _)| !self.local.contains_key(*key))
                    .map(|(_, feed)| feed),
            )
            .cloned()
            .collect()
    }

    fn status(&self) -> SessionStatus {
        let feeds = self.local.len()
            + self
                .learned
                .keys()
                .filter(|key| !self.local.contains_key(*key))
                .count();
        SessionStatus {
            feeds,
            engines: self.engines.len(),
            settled_engines: self
                .engines
                .values()
                .filter(|slot| slot.phase.is_settled())
                .count(),
            in_flight: self.in_flight,
            closed: self.closed,
        }
    }
}

/// State shared by every session on one discovery key and by their engines.
pub(crate) struct GroupShared {
    root_key: RootKey,
    discovery_key: DiscoveryKey,
    /// Short discovery key, for log lines
    name: String,
    label: String,
    config: MuxConfig,
    replicator: Arc<dyn Replicator>,
    events: Arc<EventBus>,
    state: Mutex<GroupState>,
    status_tx: watch::Sender<SessionStatus>,
}

impl GroupShared {
    pub(crate) fn new(
        root_key: RootKey,
        config: MuxConfig,
        replicator: Arc<dyn Replicator>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let discovery_key = root_key.discovery_key();
        let (status_tx, _) = watch::channel(SessionStatus::default());
        Arc::new(Self {
            root_key,
            discovery_key,
            name: discovery_key.short(),
            label: session_label(&discovery_key),
            config,
            replicator,
            events,
            state: Mutex::new(GroupState {
                members: HashSet::new(),
                local: IndexMap::new(),
                learned: IndexMap::new(),
                engines: HashMap::new(),
                in_flight: 0,
                closed: false,
            }),
            status_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &GroupState) {
        self.status_tx.send_replace(state.status());
    }

    pub(crate) fn root_key(&self) -> RootKey {
        self.root_key
    }

    pub(crate) fn discovery_key(&self) -> &DiscoveryKey {
        &self.discovery_key
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub(crate) fn replicator(&self) -> &Arc<dyn Replicator> {
        &self.replicator
    }

    pub(crate) fn emit(&self, event: MuxEvent) {
        self.events.emit(event);
    }

    // ==================== Members ====================

    /// Register a session. Returns false once the group has closed.
    pub(crate) fn attach(&self, id: SessionId) -> bool {
        let mut state = self.lock();
        !state.closed && state.members.insert(id)
    }

    pub(crate) fn is_member(&self, id: SessionId) -> bool {
        self.lock().members.contains(&id)
    }

    /// Unregister a session; the last one out stops every engine.
    ///
    /// Returns false if `id` was not a member. Feeds the session added stay
    /// in the group for its remaining members.
    pub(crate) fn detach(&self, id: SessionId) -> bool {
        let slots: Vec<EngineSlot> = {
            let mut state = self.lock();
            if !state.members.remove(&id) {
                return false;
            }
            if !state.members.is_empty() {
                return true;
            }
            state.closed = true;
            let slots = state.engines.drain().map(|(_, slot)| slot).collect();
            self.publish(&state);
            slots
        };

        for slot in slots {
            slot.task.abort();
        }
        info!("[{}] Group closed", self.name);
        true
    }

    // ==================== Feeds ====================

    /// Add a local feed on behalf of `member`.
    ///
    /// Returns false if the member is gone or the key is already local.
    /// Otherwise the feed is queued as a delta to every connected peer that
    /// has neither been sent it nor announced it itself.
    pub(crate) fn add_feed(&self, member: SessionId, feed: FeedHandle) -> bool {
        let key = feed.key();
        let mut state = self.lock();
        if !state.members.contains(&member) {
            warn!("[{}] add_feed({}) from closed {}", self.name, key.short(), member);
            return false;
        }
        if state.local.contains_key(&key) {
            return false;
        }

        state.local.insert(key, Arc::clone(&feed));
        for slot in state.engines.values_mut() {
            slot.queue(&feed);
        }
        self.publish(&state);
        debug!(
            "[{}] {} added feed {} ({} peer(s))",
            self.name,
            member,
            key.short(),
            state.engines.len()
        );
        true
    }

    pub(crate) fn feeds(&self) -> Vec<FeedHandle> {
        self.lock().union()
    }

    pub(crate) fn holds(&self, key: &FeedKey) -> bool {
        self.lock().holds(key)
    }

    // ==================== Engines ====================

    /// Start an engine for a connection serving this discovery key.
    ///
    /// A second call for the same connection id is a no-op returning false.
    pub(crate) fn on_peer_connection(self: &Arc<Self>, connection: Arc<dyn PeerConnection>) -> bool {
        let connection_id = connection.id().clone();
        {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            if state.engines.contains_key(&connection_id) {
                debug!("[{}] Duplicate delivery of {}, ignoring", self.name, connection_id);
                return false;
            }

            let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
            let seed = state.union();
            let sent: HashSet<FeedKey> = seed.iter().map(|f| f.key()).collect();
            // Receiver is alive until the task below runs; the initial
            // announce is always first in the queue.
            let _ = outbox_tx.send(seed);

            let engine = Engine::new(Arc::clone(self), connection, outbox_rx);
            let task = tokio::spawn(engine.run()).abort_handle();

            state.engines.insert(
                connection_id.clone(),
                EngineSlot {
                    outbox: outbox_tx,
                    sent,
                    remote_known: HashSet::new(),
                    phase: EnginePhase::Init,
                    task,
                },
            );
            self.publish(&state);
        }

        info!("[{}] Peer attached: {}", self.name, connection_id);
        self.emit(MuxEvent::PeerAttached {
            group: self.discovery_key,
            connection_id,
            timestamp: now_ms(),
        });
        true
    }

    /// Tear down the engine bound to a closed connection.
    pub(crate) fn on_peer_closed(&self, connection_id: &ConnectionId) -> bool {
        let slot = {
            let mut state = self.lock();
            let slot = state.engines.remove(connection_id);
            self.publish(&state);
            slot
        };

        match slot {
            Some(slot) => {
                slot.task.abort();
                debug!("[{}] Peer detached: {}", self.name, connection_id);
                if slot.phase != EnginePhase::Closed {
                    self.emit(MuxEvent::EngineClosed {
                        group: self.discovery_key,
                        connection_id: connection_id.clone(),
                        timestamp: now_ms(),
                    });
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn engine_phase(&self, connection_id: &ConnectionId) -> Option<EnginePhase> {
        self.lock().engines.get(connection_id).map(|slot| slot.phase)
    }

    pub(crate) fn peer_count(&self) -> usize {
        self.lock().engines.len()
    }

    pub(crate) fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    // ==================== Engine callbacks ====================

    pub(crate) fn engine_phase_changed(&self, connection_id: &ConnectionId, phase: EnginePhase) {
        let mut state = self.lock();
        if let Some(slot) = state.engines.get_mut(connection_id) {
            slot.phase = phase;
        }
        self.publish(&state);
    }

    /// Mark keys as known by the peer and pick out the ones to fetch.
    ///
    /// Repeated keys, whether within one announce or across announces, are
    /// no-ops, as are keys the group already holds.
    pub(crate) fn record_announce(
        &self,
        connection_id: &ConnectionId,
        keys: &[FeedKey],
    ) -> AnnounceOutcome {
        let mut state = self.lock();
        let mut outcome = AnnounceOutcome {
            fresh: 0,
            fetch: Vec::new(),
        };
        if state.closed {
            return outcome;
        }

        let state = &mut *state;
        let Some(slot) = state.engines.get_mut(connection_id) else {
            return outcome;
        };
        for key in keys {
            if !slot.remote_known.insert(*key) {
                continue;
            }
            outcome.fresh += 1;
            if !state.local.contains_key(key) && !state.learned.contains_key(key) {
                outcome.fetch.push(*key);
            }
        }

        state.in_flight += outcome.fetch.len();
        self.publish(state);
        outcome
    }

    /// A fetch finished: expose the feed and relay it to the other peers.
    pub(crate) fn feed_replicated(&self, connection_id: &ConnectionId, feed: FeedHandle) {
        let key = feed.key();
        let learned = {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);

            let learned = !state.closed && !state.holds(&key);
            if learned {
                state.learned.insert(key, Arc::clone(&feed));
                for slot in state.engines.values_mut() {
                    slot.queue(&feed);
                }
            }
            self.publish(&state);
            learned
        };

        if learned {
            debug!("[{}] Learned feed {} from {}", self.name, key.short(), connection_id);
            self.emit(MuxEvent::FeedLearned {
                group: self.discovery_key,
                connection_id: connection_id.clone(),
                feed_key: key,
                timestamp: now_ms(),
            });
        }
    }

    /// A fetch failed. The key stays in the peer's known set; it is retried
    /// only if a future connection announces it again.
    pub(crate) fn replication_failed(
        &self,
        connection_id: &ConnectionId,
        key: FeedKey,
        error: &TransportError,
    ) {
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            self.publish(&state);
        }
        warn!(
            "[{}] Replication of {} from {} failed: {}",
            self.name,
            key.short(),
            connection_id,
            error
        );
        self.emit_replication_failed(connection_id, key, error);
    }

    pub(crate) fn offer_failed(
        &self,
        connection_id: &ConnectionId,
        key: FeedKey,
        error: &TransportError,
    ) {
        self.emit_replication_failed(connection_id, key, error);
    }

    fn emit_replication_failed(
        &self,
        connection_id: &ConnectionId,
        key: FeedKey,
        error: &TransportError,
    ) {
        self.emit(MuxEvent::ReplicationFailed {
            group: self.discovery_key,
            connection_id: connection_id.clone(),
            feed_key: key,
            error: error.to_string(),
            timestamp: now_ms(),
        });
    }

    /// The engine task for `connection_id` returned.
    pub(crate) fn engine_finished(&self, connection_id: &ConnectionId, error: Option<EngineError>) {
        {
            let mut state = self.lock();
            if let Some(slot) = state.engines.get_mut(connection_id) {
                slot.phase = EnginePhase::Closed;
            }
            self.publish(&state);
        }

        match error {
            Some(e) => {
                warn!("[{}] Engine for {} failed: {}", self.name, connection_id, e);
                self.emit(MuxEvent::EngineFailed {
                    group: self.discovery_key,
                    connection_id: connection_id.clone(),
                    error: e.to_string(),
                    timestamp: now_ms(),
                });
            }
            None => {
                debug!("[{}] Engine for {} closed", self.name, connection_id);
                self.emit(MuxEvent::EngineClosed {
                    group: self.discovery_key,
                    connection_id: connection_id.clone(),
                    timestamp: now_ms(),
                });
            }
        }
    }
}
