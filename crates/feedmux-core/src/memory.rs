//! In-process swarm, feeds and replicator.
//!
//! Everything here runs inside one process with no I/O, for tests and the
//! simulator:
//! - [`MemoryNetwork`] is the hub; each [`MemoryNetworker`] is one node on it
//! - [`MemoryConnection`] pairs logical channels by label, in open order
//! - [`MemoryStore`] and [`MemoryFeed`] stand in for a log store
//! - [`MemoryReplicator`] copies a feed's blocks across a channel

use crate::feed::{Feed, FeedHandle, Replicator};
use crate::keys::{DiscoveryKey, FeedKey};
use crate::transport::{
    Channel, ConnectionId, JoinOptions, Networker, PeerConnection, Result, SwarmEvent,
    TransportError,
};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::debug;

type NodeId = u64;

// ==================== Channels ====================

struct ChannelEnd {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

fn channel_pair() -> [Option<ChannelEnd>; 2] {
    let (tx0, rx0) = mpsc::unbounded_channel();
    let (tx1, rx1) = mpsc::unbounded_channel();
    [
        Some(ChannelEnd { tx: tx0, rx: rx1 }),
        Some(ChannelEnd { tx: tx1, rx: rx0 }),
    ]
}

/// Opens seen so far for one label, and pairs still waiting for one side.
#[derive(Default)]
struct LabelSlots {
    opened: [usize; 2],
    pending: HashMap<usize, [Option<ChannelEnd>; 2]>,
}

/// The shared medium behind both ends of one connection.
struct Pipe {
    closed: watch::Sender<bool>,
    labels: Mutex<HashMap<String, LabelSlots>>,
}

impl Pipe {
    fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            closed,
            labels: Mutex::new(HashMap::new()),
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn close(&self) {
        self.closed.send_replace(true);
        self.labels.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// The k-th open of a label on one side meets the k-th open on the other.
    fn open(&self, side: usize, label: &str) -> Result<MemoryChannel> {
        if self.is_closed() {
            return Err(TransportError::ChannelOpen {
                label: label.to_string(),
                reason: "connection closed".into(),
            });
        }

        let mut labels = self.labels.lock().unwrap_or_else(|e| e.into_inner());
        let slots = labels.entry(label.to_string()).or_default();
        let index = slots.opened[side];
        slots.opened[side] += 1;

        let pair = slots.pending.entry(index).or_insert_with(channel_pair);
        let end = pair[side].take();
        if pair.iter().all(Option::is_none) {
            slots.pending.remove(&index);
        }

        let end = end.ok_or_else(|| TransportError::ChannelOpen {
            label: label.to_string(),
            reason: "channel slot already taken".into(),
        })?;
        Ok(MemoryChannel {
            label: label.to_string(),
            tx: Mutex::new(Some(end.tx)),
            rx: tokio::sync::Mutex::new(end.rx),
            connection_closed: self.closed.subscribe(),
            closed: AtomicBool::new(false),
        })
    }
}

/// One end of a logical channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    label: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    connection_closed: watch::Receiver<bool>,
    closed: AtomicBool,
}

async fn wait_closed(mut rx: watch::Receiver<bool>) {
    // An error means the pipe itself is gone, which counts as closed
    let _ = rx.wait_for(|closed| *closed).await;
}

#[async_trait]
impl Channel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        if *self.connection_closed.borrow() {
            return Err(TransportError::ChannelClosed);
        }
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match tx.as_ref() {
            Some(tx) => tx
                .send(data.to_vec())
                .map_err(|_| TransportError::SendFailed(format!("{}: peer end dropped", self.label))),
            None => Err(TransportError::ChannelClosed),
        }
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            // Buffered messages are delivered before a connection close
            biased;
            msg = rx.recv() => Ok(msg),
            _ = wait_closed(self.connection_closed.clone()) => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }
}

// ==================== Connections ====================

/// One side of an in-memory connection between two nodes.
pub struct MemoryConnection {
    id: ConnectionId,
    initiator: bool,
    side: usize,
    pipe: Arc<Pipe>,
}

impl MemoryConnection {
    pub fn is_closed(&self) -> bool {
        self.pipe.is_closed()
    }
}

#[async_trait]
impl PeerConnection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn is_initiator(&self) -> bool {
        self.initiator
    }

    async fn open_channel(&self, label: &str) -> Result<Box<dyn Channel>> {
        let channel = self.pipe.open(self.side, label)?;
        Ok(Box::new(channel))
    }
}

struct Link {
    /// Node ids, in the same order as `ends`
    nodes: [NodeId; 2],
    ends: [Arc<MemoryConnection>; 2],
    keys: HashSet<DiscoveryKey>,
}

impl Link {
    fn end_for(&self, node: NodeId) -> Option<&Arc<MemoryConnection>> {
        self.nodes
            .iter()
            .position(|n| *n == node)
            .map(|side| &self.ends[side])
    }
}

#[derive(Default)]
struct NodeState {
    joined: HashSet<DiscoveryKey>,
    subscribers: Vec<mpsc::UnboundedSender<SwarmEvent>>,
    join_calls: usize,
}

impl NodeState {
    fn publish(&mut self, event: SwarmEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<NodeId, NodeState>,
    links: HashMap<(NodeId, NodeId), Link>,
    next_node: NodeId,
    next_connection: u64,
}

fn link_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    (a.min(b), a.max(b))
}

/// Hub connecting in-memory nodes.
///
/// Nodes that join the same discovery key are connected. Each node pair
/// shares one connection however many keys they have in common; the
/// connection is reported once per shared key.
#[derive(Default)]
pub struct MemoryNetwork {
    state: Mutex<NetworkState>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a node to the network.
    pub fn node(self: &Arc<Self>) -> Arc<MemoryNetworker> {
        let mut state = self.lock();
        let id = state.next_node;
        state.next_node += 1;
        state.nodes.insert(id, NodeState::default());
        Arc::new(MemoryNetworker {
            id,
            network: Arc::clone(self),
        })
    }

    /// Number of live connections on the whole network.
    pub fn connection_count(&self) -> usize {
        self.lock().links.len()
    }

    fn join(&self, node: NodeId, discovery_key: DiscoveryKey) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        let entry = state.nodes.entry(node).or_default();
        if !entry.joined.insert(discovery_key) {
            return Err(TransportError::AlreadyJoined(discovery_key));
        }
        entry.join_calls += 1;

        let peers: Vec<NodeId> = state
            .nodes
            .iter()
            .filter(|(id, n)| **id != node && n.joined.contains(&discovery_key))
            .map(|(id, _)| *id)
            .collect();

        for peer in peers {
            let link = state.links.entry(link_key(node, peer)).or_insert_with(|| {
                state.next_connection += 1;
                let id = ConnectionId::new(format!("mem-{}", state.next_connection));
                let pipe = Arc::new(Pipe::new());
                debug!("Connecting node {} to node {} as {}", node, peer, id);
                Link {
                    nodes: [node, peer],
                    ends: [
                        Arc::new(MemoryConnection {
                            id: id.clone(),
                            initiator: true,
                            side: 0,
                            pipe: Arc::clone(&pipe),
                        }),
                        Arc::new(MemoryConnection {
                            id,
                            initiator: false,
                            side: 1,
                            pipe,
                        }),
                    ],
                    keys: HashSet::new(),
                }
            });
            if !link.keys.insert(discovery_key) {
                continue;
            }

            for (side, n) in link.nodes.iter().enumerate() {
                let connection: Arc<dyn PeerConnection> = link.ends[side].clone();
                if let Some(node_state) = state.nodes.get_mut(n) {
                    node_state.publish(SwarmEvent::Connected {
                        connection,
                        discovery_key,
                    });
                }
            }
        }
        Ok(())
    }

    fn leave(&self, node: NodeId, discovery_key: &DiscoveryKey) {
        if let Some(entry) = self.lock().nodes.get_mut(&node) {
            entry.joined.remove(discovery_key);
        }
    }

    fn subscribe(&self, node: NodeId) -> mpsc::UnboundedReceiver<SwarmEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        for link in state.links.values() {
            if let Some(end) = link.end_for(node) {
                for discovery_key in &link.keys {
                    let _ = tx.send(SwarmEvent::Connected {
                        connection: end.clone(),
                        discovery_key: *discovery_key,
                    });
                }
            }
        }
        state.nodes.entry(node).or_default().subscribers.push(tx);
        rx
    }

    fn disconnect_all(&self, node: NodeId) -> usize {
        let mut state = self.lock();
        let keys: Vec<(NodeId, NodeId)> = state
            .links
            .keys()
            .filter(|(a, b)| *a == node || *b == node)
            .copied()
            .collect();

        for key in &keys {
            if let Some(link) = state.links.remove(key) {
                link.ends[0].pipe.close();
                let connection_id = link.ends[0].id.clone();
                debug!("Disconnecting {}", connection_id);
                for n in link.nodes {
                    if let Some(node_state) = state.nodes.get_mut(&n) {
                        node_state.publish(SwarmEvent::Closed {
                            connection_id: connection_id.clone(),
                        });
                    }
                }
            }
        }
        keys.len()
    }
}

/// One node on a [`MemoryNetwork`].
pub struct MemoryNetworker {
    id: NodeId,
    network: Arc<MemoryNetwork>,
}

impl MemoryNetworker {
    /// Close every connection this node has. Returns how many were closed.
    pub fn disconnect_all(&self) -> usize {
        self.network.disconnect_all(self.id)
    }

    /// Successful swarm joins issued by this node, over its lifetime.
    pub fn join_count(&self) -> usize {
        self.network
            .lock()
            .nodes
            .get(&self.id)
            .map(|n| n.join_calls)
            .unwrap_or(0)
    }

    pub fn joined_keys(&self) -> Vec<DiscoveryKey> {
        self.network
            .lock()
            .nodes
            .get(&self.id)
            .map(|n| n.joined.iter().copied().collect())
            .unwrap_or_default()
    }

    /// This node's end of its connection to `other`, if they are connected.
    pub fn connection_to(&self, other: &MemoryNetworker) -> Option<Arc<MemoryConnection>> {
        self.network
            .lock()
            .links
            .get(&link_key(self.id, other.id))
            .and_then(|link| link.end_for(self.id).cloned())
    }
}

#[async_trait]
impl Networker for MemoryNetworker {
    async fn join(&self, discovery_key: DiscoveryKey, _options: JoinOptions) -> Result<()> {
        self.network.join(self.id, discovery_key)
    }

    async fn leave(&self, discovery_key: DiscoveryKey) -> Result<()> {
        self.network.leave(self.id, &discovery_key);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<SwarmEvent> {
        self.network.subscribe(self.id)
    }
}

// ==================== Feeds ====================

/// Append-only log of byte blocks.
#[derive(Debug)]
pub struct MemoryFeed {
    key: FeedKey,
    blocks: RwLock<Vec<Vec<u8>>>,
}

impl MemoryFeed {
    pub fn new(key: FeedKey) -> Self {
        Self {
            key,
            blocks: RwLock::new(Vec::new()),
        }
    }

    /// Append a block, returning its index.
    pub fn append(&self, data: impl Into<Vec<u8>>) -> usize {
        let mut blocks = self.blocks.write().unwrap_or_else(|e| e.into_inner());
        blocks.push(data.into());
        blocks.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<Vec<u8>> {
        self.blocks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(index)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Vec<u8>> {
        self.blocks.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Take blocks we do not have yet; existing blocks are kept.
    fn import(&self, incoming: Vec<Vec<u8>>) {
        let mut blocks = self.blocks.write().unwrap_or_else(|e| e.into_inner());
        let have = blocks.len();
        blocks.extend(incoming.into_iter().skip(have));
    }
}

impl Feed for MemoryFeed {
    fn key(&self) -> FeedKey {
        self.key
    }
}

/// Feeds by key, in creation order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    feeds: RwLock<IndexMap<FeedKey, Arc<MemoryFeed>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a feed under a fresh random key.
    pub fn create(&self) -> Arc<MemoryFeed> {
        self.get_or_create(FeedKey::generate())
    }

    pub fn get(&self, key: &FeedKey) -> Option<Arc<MemoryFeed>> {
        self.feeds
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn get_or_create(&self, key: FeedKey) -> Arc<MemoryFeed> {
        let mut feeds = self.feeds.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            feeds
                .entry(key)
                .or_insert_with(|| Arc::new(MemoryFeed::new(key))),
        )
    }

    pub fn keys(&self) -> Vec<FeedKey> {
        self.feeds
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.feeds.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ==================== Replication ====================

#[derive(Serialize, Deserialize)]
struct FeedSnapshot {
    key: FeedKey,
    blocks: Vec<Vec<u8>>,
}

/// Replicates feeds between [`MemoryStore`]s by shipping a one-off block
/// snapshot from the offering side to the fetching side.
pub struct MemoryReplicator {
    store: Arc<MemoryStore>,
    failing: Mutex<HashSet<FeedKey>>,
    offers: Mutex<HashMap<FeedKey, usize>>,
    fetches: Mutex<HashMap<FeedKey, usize>>,
}

impl MemoryReplicator {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            failing: Mutex::new(HashSet::new()),
            offers: Mutex::new(HashMap::new()),
            fetches: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Make every later replication of `key` fail, offered or fetched.
    pub fn fail_key(&self, key: FeedKey) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key);
    }

    /// Times `key` was offered to a peer.
    pub fn offer_count(&self, key: &FeedKey) -> usize {
        count(&self.offers, key)
    }

    /// Times `key` was fetched from a peer, failed attempts included.
    pub fn fetch_count(&self, key: &FeedKey) -> usize {
        count(&self.fetches, key)
    }

    fn is_failing(&self, key: &FeedKey) -> bool {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    async fn offer(&self, local: FeedHandle, key: FeedKey, channel: &dyn Channel) -> Result<FeedHandle> {
        let snapshot = FeedSnapshot {
            key,
            blocks: self.store.get(&key).map(|f| f.snapshot()).unwrap_or_default(),
        };
        let data = bincode::serialize(&snapshot)
            .map_err(|e| TransportError::ReplicationSetup(e.to_string()))?;
        channel
            .send(&data)
            .await
            .map_err(|e| TransportError::ReplicationSetup(e.to_string()))?;
        Ok(local)
    }

    async fn fetch(&self, key: FeedKey, channel: &dyn Channel) -> Result<FeedHandle> {
        let data = channel
            .recv()
            .await
            .map_err(|e| TransportError::ReplicationSetup(e.to_string()))?
            .ok_or_else(|| {
                TransportError::ReplicationSetup(format!(
                    "channel closed before {} arrived",
                    key.short()
                ))
            })?;
        let snapshot: FeedSnapshot = bincode::deserialize(&data)
            .map_err(|e| TransportError::ReplicationSetup(e.to_string()))?;
        if snapshot.key != key {
            return Err(TransportError::ReplicationSetup(format!(
                "expected {}, peer sent {}",
                key.short(),
                snapshot.key.short()
            )));
        }

        let feed = self.store.get_or_create(key);
        feed.import(snapshot.blocks);
        Ok(feed)
    }
}

fn count(counts: &Mutex<HashMap<FeedKey, usize>>, key: &FeedKey) -> usize {
    counts
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(key)
        .copied()
        .unwrap_or(0)
}

fn bump(counts: &Mutex<HashMap<FeedKey, usize>>, key: FeedKey) {
    *counts
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .entry(key)
        .or_insert(0) += 1;
}

#[async_trait]
impl Replicator for MemoryReplicator {
    async fn begin_replication(
        &self,
        local: Option<FeedHandle>,
        key: FeedKey,
        channel: Box<dyn Channel>,
    ) -> Result<FeedHandle> {
        bump(if local.is_some() { &self.offers } else { &self.fetches }, key);

        if self.is_failing(&key) {
            let _ = channel.close().await;
            return Err(TransportError::ReplicationSetup(format!(
                "replication of {} refused",
                key.short()
            )));
        }

        match local {
            Some(feed) => self.offer(feed, key, channel.as_ref()).await,
            None => self.fetch(key, channel.as_ref()).await,
        }
    }
}
