//! Muxer: shares one networker among any number of group sessions.
//!
//! The muxer consumes the networker's connection events on a dispatch task
//! and routes each connection to the group whose discovery key it was
//! reported for. Sessions on the same root key share one group, and swarm
//! joins are reference counted per discovery key, so two sessions on the same
//! root key cost one join and one membership channel per connection.

use crate::config::MuxConfig;
use crate::events::{now_ms, EventBus, MuxEvent, Subscription};
use crate::feed::Replicator;
use crate::group::GroupShared;
use crate::keys::{DiscoveryKey, RootKey};
use crate::registry::{ConnectionRegistry, JoinState, JoinTable};
use crate::session::{GroupSession, SessionId, SessionOptions};
use crate::transport::{JoinOptions, Networker, SwarmEvent, TransportError};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Muxer is closed")]
    Closed,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Swarm join for {0} failed in a concurrent join")]
    JoinFailed(DiscoveryKey),

    #[error("{failed} of {total} swarm leaves failed, first: {first}")]
    Teardown {
        failed: usize,
        total: usize,
        first: TransportError,
    },
}

pub type Result<T> = std::result::Result<T, MuxError>;

struct MuxerState {
    sessions: IndexMap<SessionId, GroupSession>,
    groups: HashMap<DiscoveryKey, Arc<GroupShared>>,
    joins: JoinTable,
    connections: ConnectionRegistry,
    next_session: u64,
    closed: bool,
    dispatch: Option<JoinHandle<()>>,
}

struct MuxerInner {
    networker: Arc<dyn Networker>,
    replicator: Arc<dyn Replicator>,
    config: MuxConfig,
    events: Arc<EventBus>,
    state: Mutex<MuxerState>,
}

impl MuxerInner {
    fn lock(&self) -> MutexGuard<'_, MuxerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_swarm_event(&self, event: SwarmEvent) {
        match event {
            SwarmEvent::Connected {
                connection,
                discovery_key,
            } => {
                let group = {
                    let mut state = self.lock();
                    if state.closed {
                        return;
                    }
                    let fresh = state
                        .connections
                        .connection_seen(Arc::clone(&connection), discovery_key);
                    if !fresh {
                        debug!(
                            "Duplicate connection event for {} on {}",
                            connection.id(),
                            discovery_key.short()
                        );
                        return;
                    }
                    state.groups.get(&discovery_key).cloned()
                };

                match group {
                    Some(group) => {
                        debug!("Connection {} for {}", connection.id(), discovery_key.short());
                        group.on_peer_connection(connection);
                    }
                    None => debug!(
                        "Connection {} for {} has no group yet",
                        connection.id(),
                        discovery_key.short()
                    ),
                }
            }
            SwarmEvent::Closed { connection_id } => {
                let groups: Vec<Arc<GroupShared>> = {
                    let mut state = self.lock();
                    if state.connections.connection_closed(&connection_id).is_none() {
                        return;
                    }
                    state.groups.values().cloned().collect()
                };

                debug!("Connection {} closed", connection_id);
                for group in groups {
                    group.on_peer_closed(&connection_id);
                }
            }
        }
    }
}

impl Drop for MuxerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = state.dispatch.take() {
            task.abort();
        }
        state.groups.clear();
        for (_, session) in state.sessions.drain(..) {
            session.close();
        }
    }
}

async fn dispatch_loop(inner: Weak<MuxerInner>, mut rx: mpsc::UnboundedReceiver<SwarmEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_swarm_event(event);
    }
    debug!("Swarm event stream ended");
}

/// Entry point: join root keys, get sessions.
///
/// Must be created inside a tokio runtime; it spawns its dispatch task on
/// construction. Clones share the same state.
#[derive(Clone)]
pub struct Muxer {
    inner: Arc<MuxerInner>,
}

impl Muxer {
    pub fn new(networker: Arc<dyn Networker>, replicator: Arc<dyn Replicator>) -> Self {
        Self::with_config(networker, replicator, MuxConfig::default())
    }

    pub fn with_config(
        networker: Arc<dyn Networker>,
        replicator: Arc<dyn Replicator>,
        config: MuxConfig,
    ) -> Self {
        let rx = networker.subscribe();
        let inner = Arc::new(MuxerInner {
            networker,
            replicator,
            config,
            events: Arc::new(EventBus::new()),
            state: Mutex::new(MuxerState {
                sessions: IndexMap::new(),
                groups: HashMap::new(),
                joins: JoinTable::new(),
                connections: ConnectionRegistry::new(),
                next_session: 1,
                closed: false,
                dispatch: None,
            }),
        });

        let task = tokio::spawn(dispatch_loop(Arc::downgrade(&inner), rx));
        inner.lock().dispatch = Some(task);
        Self { inner }
    }

    pub fn config(&self) -> &MuxConfig {
        &self.inner.config
    }

    /// Event bus shared by the muxer and all of its sessions.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Subscribe to mux events. Drop the returned handle to unsubscribe.
    pub fn subscribe(&self, callback: impl Fn(MuxEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.events.subscribe(callback)
    }

    /// Join the group named by `root_key` and return a new session for it.
    ///
    /// Every call returns a distinct session, even for a root key that is
    /// already joined; sessions on one key share its group. Only the first
    /// session on a discovery key joins the swarm, and a duplicate-join error
    /// from the networker is tolerated. Later sessions wait for that join and
    /// fail with [`MuxError::JoinFailed`] if it does.
    pub async fn join(&self, root_key: RootKey, options: SessionOptions) -> Result<GroupSession> {
        let discovery_key = root_key.discovery_key();
        let (session, ticket) = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(MuxError::Closed);
            }
            let id = SessionId::new(state.next_session);
            state.next_session += 1;

            let group = state
                .groups
                .entry(discovery_key)
                .or_insert_with(|| {
                    GroupShared::new(
                        root_key,
                        self.inner.config.clone(),
                        Arc::clone(&self.inner.replicator),
                        Arc::clone(&self.inner.events),
                    )
                })
                .clone();
            let name = options.name.unwrap_or_else(|| id.to_string());
            let session = GroupSession::new(id, name, group);
            state.sessions.insert(id, session.clone());
            let ticket = state.joins.acquire(discovery_key);
            (session, ticket)
        };

        if ticket.first {
            self.join_swarm(&session).await?;
        } else {
            let mut join_state = ticket.state;
            let joined = matches!(
                join_state
                    .wait_for(|s| *s != JoinState::Pending)
                    .await
                    .map(|s| *s),
                Ok(JoinState::Joined)
            );
            if !joined {
                let closed = {
                    let mut state = self.inner.lock();
                    state.sessions.shift_remove(&session.id());
                    state.closed
                };
                session.close();
                return Err(if closed {
                    MuxError::Closed
                } else {
                    MuxError::JoinFailed(discovery_key)
                });
            }
        }

        let existing = {
            let state = self.inner.lock();
            if state.closed {
                // close() already closed the session and left the swarm
                return Err(MuxError::Closed);
            }
            state.connections.connections_for(&discovery_key)
        };

        info!(
            "[{}] Joined root {} ({} live connection(s))",
            session.name(),
            root_key.short(),
            existing.len()
        );
        self.inner.events.emit(MuxEvent::SessionJoined {
            session: session.name().to_string(),
            root_key,
            timestamp: now_ms(),
        });

        for connection in existing {
            session.on_peer_connection(connection);
        }
        Ok(session)
    }

    /// Issue the network join for the first session on a discovery key and
    /// settle the join table with the outcome.
    async fn join_swarm(&self, session: &GroupSession) -> Result<()> {
        let discovery_key = session.discovery_key();
        let joined = match self
            .inner
            .networker
            .join(discovery_key, JoinOptions::default())
            .await
        {
            Ok(()) => {
                info!("Joined swarm for {}", discovery_key.short());
                Ok(())
            }
            Err(TransportError::AlreadyJoined(_)) => {
                debug!("Swarm already joined for {}", discovery_key.short());
                Ok(())
            }
            Err(e) => Err(e),
        };

        match joined {
            Ok(()) => {
                let closed = {
                    let mut state = self.inner.lock();
                    if !state.closed {
                        state.joins.settle(&discovery_key, true);
                    }
                    state.closed
                };
                if closed {
                    // close() ran while the join was in flight and skipped it
                    if let Err(e) = self.inner.networker.leave(discovery_key).await {
                        warn!("Failed to leave swarm for {}: {}", discovery_key.short(), e);
                    }
                    return Err(MuxError::Closed);
                }
                Ok(())
            }
            Err(e) => {
                warn!("Failed to join swarm for {}: {}", discovery_key.short(), e);
                {
                    let mut state = self.inner.lock();
                    state.sessions.shift_remove(&session.id());
                    let dropped = state.joins.settle(&discovery_key, false);
                    state.groups.remove(&discovery_key);
                    if dropped > 1 {
                        debug!(
                            "{} waiting session(s) on {} will fail too",
                            dropped - 1,
                            discovery_key.short()
                        );
                    }
                }
                session.close();
                Err(e.into())
            }
        }
    }

    /// Close a session and release its swarm join. Idempotent.
    ///
    /// The swarm is left only when this was the last session on its
    /// discovery key.
    pub async fn leave(&self, session: &GroupSession) -> Result<()> {
        let discovery_key = session.discovery_key();
        let last = {
            let mut state = self.inner.lock();
            if state.sessions.shift_remove(&session.id()).is_none() {
                return Ok(());
            }
            let last = state.joins.release(&discovery_key);
            if last {
                state.groups.remove(&discovery_key);
            }
            last
        };

        session.close();
        if last {
            self.inner.networker.leave(discovery_key).await?;
            info!("Left swarm for {}", discovery_key.short());
        }
        Ok(())
    }

    /// Close every session, stop dispatching and leave every joined key.
    ///
    /// Teardown continues past individual leave failures; they are reported
    /// together afterwards.
    pub async fn close(&self) -> Result<()> {
        let (sessions, keys, dispatch) = {
            let mut state = self.inner.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.connections.clear();
            state.groups.clear();
            let sessions: Vec<GroupSession> = state.sessions.drain(..).map(|(_, s)| s).collect();
            (sessions, state.joins.drain(), state.dispatch.take())
        };

        if let Some(task) = dispatch {
            task.abort();
        }
        for session in &sessions {
            session.close();
        }

        let total = keys.len();
        let networker = &self.inner.networker;
        let results =
            futures::future::join_all(keys.into_iter().map(|key| networker.leave(key))).await;

        let mut errors = results.into_iter().filter_map(|r| r.err());
        info!("Muxer closed ({} session(s), {} key(s))", sessions.len(), total);
        match errors.next() {
            None => Ok(()),
            Some(first) => {
                let failed = 1 + errors.count();
                warn!("{} of {} swarm leaves failed: {}", failed, total, first);
                Err(MuxError::Teardown {
                    failed,
                    total,
                    first,
                })
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Open sessions in join order.
    pub fn sessions(&self) -> Vec<GroupSession> {
        self.inner.lock().sessions.values().cloned().collect()
    }

    /// Live connections known to the muxer, across all discovery keys.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Whether the swarm is joined for `discovery_key`.
    pub fn is_joined(&self, discovery_key: &DiscoveryKey) -> bool {
        self.inner.lock().joins.is_joined(discovery_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedHandle;
    use crate::keys::{FeedKey, KEY_LEN};
    use crate::transport::Channel;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Networker that never produces connections.
    #[derive(Default)]
    struct CountingNetworker {
        joins: AtomicUsize,
        leaves: AtomicUsize,
        join_delay: Duration,
        fail_joins: bool,
        fail_leaves: bool,
        tx: Mutex<Vec<mpsc::UnboundedSender<SwarmEvent>>>,
    }

    #[async_trait]
    impl Networker for CountingNetworker {
        async fn join(
            &self,
            _discovery_key: DiscoveryKey,
            _options: JoinOptions,
        ) -> crate::transport::Result<()> {
            self.joins.fetch_add(1, Ordering::SeqCst);
            if !self.join_delay.is_zero() {
                tokio::time::sleep(self.join_delay).await;
            }
            if self.fail_joins {
                return Err(TransportError::Other("join refused".into()));
            }
            Ok(())
        }

        async fn leave(&self, _discovery_key: DiscoveryKey) -> crate::transport::Result<()> {
            self.leaves.fetch_add(1, Ordering::SeqCst);
            if self.fail_leaves {
                return Err(TransportError::Other("leave refused".into()));
            }
            Ok(())
        }

        fn subscribe(&self) -> mpsc::UnboundedReceiver<SwarmEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.tx.lock().unwrap().push(tx);
            rx
        }
    }

    struct NoReplication;

    #[async_trait]
    impl Replicator for NoReplication {
        async fn begin_replication(
            &self,
            _local: Option<FeedHandle>,
            _key: FeedKey,
            _channel: Box<dyn Channel>,
        ) -> crate::transport::Result<FeedHandle> {
            Err(TransportError::ReplicationSetup("disabled".into()))
        }
    }

    fn muxer(networker: Arc<CountingNetworker>) -> Muxer {
        Muxer::new(networker, Arc::new(NoReplication))
    }

    fn root(n: u8) -> RootKey {
        RootKey::from_bytes([n; KEY_LEN])
    }

    #[tokio::test]
    async fn test_join_returns_distinct_sessions() {
        let net = Arc::new(CountingNetworker::default());
        let mux = muxer(Arc::clone(&net));

        let a = mux.join(root(1), SessionOptions::named("a")).await.unwrap();
        let b = mux.join(root(1), SessionOptions::default()).await.unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), "a");
        assert_eq!(b.name(), b.id().to_string());
        assert_eq!(net.joins.load(Ordering::SeqCst), 1);
        assert_eq!(mux.sessions().len(), 2);
    }

    #[tokio::test]
    async fn test_leave_releases_join_on_last_session() {
        let net = Arc::new(CountingNetworker::default());
        let mux = muxer(Arc::clone(&net));
        let dk = root(1).discovery_key();

        let a = mux.join(root(1), SessionOptions::default()).await.unwrap();
        let b = mux.join(root(1), SessionOptions::default()).await.unwrap();

        mux.leave(&a).await.unwrap();
        assert!(mux.is_joined(&dk));
        assert_eq!(net.leaves.load(Ordering::SeqCst), 0);

        // Idempotent
        mux.leave(&a).await.unwrap();
        assert_eq!(net.leaves.load(Ordering::SeqCst), 0);

        mux.leave(&b).await.unwrap();
        assert!(!mux.is_joined(&dk));
        assert_eq!(net.leaves.load(Ordering::SeqCst), 1);
        assert!(a.is_closed() && b.is_closed());
    }

    #[tokio::test]
    async fn test_failed_join_rolls_back() {
        let net = Arc::new(CountingNetworker {
            fail_joins: true,
            ..Default::default()
        });
        let mux = muxer(Arc::clone(&net));

        let err = mux.join(root(1), SessionOptions::default()).await.unwrap_err();
        assert!(matches!(err, MuxError::Transport(TransportError::Other(_))));
        assert!(mux.sessions().is_empty());
        assert!(!mux.is_joined(&root(1).discovery_key()));
    }

    #[tokio::test]
    async fn test_concurrent_join_waits_for_first() {
        let net = Arc::new(CountingNetworker {
            join_delay: Duration::from_millis(50),
            ..Default::default()
        });
        let mux = muxer(Arc::clone(&net));
        let dk = root(1).discovery_key();

        let (a, b) = tokio::join!(
            mux.join(root(1), SessionOptions::named("a")),
            mux.join(root(1), SessionOptions::named("b")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(mux.is_joined(&dk));
        assert_eq!(net.joins.load(Ordering::SeqCst), 1);
        assert!(!a.is_closed() && !b.is_closed());
        assert_eq!(mux.sessions().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_join_fails_concurrent_joiners() {
        let net = Arc::new(CountingNetworker {
            join_delay: Duration::from_millis(50),
            fail_joins: true,
            ..Default::default()
        });
        let mux = muxer(Arc::clone(&net));
        let dk = root(1).discovery_key();

        let (first, second) = tokio::join!(
            mux.join(root(1), SessionOptions::named("first")),
            mux.join(root(1), SessionOptions::named("second")),
        );

        assert!(matches!(
            first.unwrap_err(),
            MuxError::Transport(TransportError::Other(_))
        ));
        match second.unwrap_err() {
            MuxError::JoinFailed(key) => assert_eq!(key, dk),
            other => panic!("expected JoinFailed, got {:?}", other),
        }
        assert!(mux.sessions().is_empty());
        assert!(!mux.is_joined(&dk));
        assert_eq!(net.joins.load(Ordering::SeqCst), 1);

        // Nothing is left holding the key: the next join tries the network again
        assert!(mux.join(root(1), SessionOptions::default()).await.is_err());
        assert_eq!(net.joins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_leaves_every_key_once() {
        let net = Arc::new(CountingNetworker::default());
        let mux = muxer(Arc::clone(&net));

        let a = mux.join(root(1), SessionOptions::default()).await.unwrap();
        mux.join(root(1), SessionOptions::default()).await.unwrap();
        mux.join(root(2), SessionOptions::default()).await.unwrap();

        mux.close().await.unwrap();
        assert_eq!(net.leaves.load(Ordering::SeqCst), 2);
        assert!(a.is_closed());
        assert!(mux.is_closed());

        // Second close is a no-op
        mux.close().await.unwrap();
        assert_eq!(net.leaves.load(Ordering::SeqCst), 2);

        let err = mux.join(root(3), SessionOptions::default()).await.unwrap_err();
        assert!(matches!(err, MuxError::Closed));
    }

    #[tokio::test]
    async fn test_close_aggregates_leave_failures() {
        let net = Arc::new(CountingNetworker {
            fail_leaves: true,
            ..Default::default()
        });
        let mux = muxer(Arc::clone(&net));
        mux.join(root(1), SessionOptions::default()).await.unwrap();
        mux.join(root(2), SessionOptions::default()).await.unwrap();

        match mux.close().await {
            Err(MuxError::Teardown { failed, total, .. }) => {
                assert_eq!(failed, 2);
                assert_eq!(total, 2);
            }
            other => panic!("expected teardown error, got {:?}", other),
        }
        // Every leave was still attempted
        assert_eq!(net.leaves.load(Ordering::SeqCst), 2);
    }
}
