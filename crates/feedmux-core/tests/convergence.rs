//! Convergence tests for feedmux.
//!
//! Every test builds nodes on an in-memory network, each with its own store,
//! replicator and muxer, and waits on session status instead of sleeping.

use std::sync::Arc;
use std::time::{Duration, Instant};

use feedmux_core::memory::{MemoryNetwork, MemoryNetworker, MemoryReplicator, MemoryStore};
use feedmux_core::protocol::{self, session_label};
use feedmux_core::{
    Channel, EnginePhase, Feed, FeedKey, GroupSession, MuxConfig, MuxEvent, Muxer, Networker,
    PeerConnection, RootKey, SessionOptions, Subscription,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const KEY_A: RootKey = RootKey::from_bytes([1; 32]);
const KEY_B: RootKey = RootKey::from_bytes([2; 32]);
const WAIT: Duration = Duration::from_secs(10);

/// One peer: networker node, store, replicator and muxer.
struct TestNode {
    net: Arc<MemoryNetworker>,
    store: Arc<MemoryStore>,
    replicator: Arc<MemoryReplicator>,
    muxer: Muxer,
}

impl TestNode {
    fn new(network: &Arc<MemoryNetwork>) -> Self {
        let config = MuxConfig::default().with_announce_grace(Duration::from_millis(100));
        let net = network.node();
        let store = MemoryStore::new();
        let replicator = Arc::new(MemoryReplicator::new(Arc::clone(&store)));
        let muxer = Muxer::with_config(net.clone(), replicator.clone(), config);
        Self {
            net,
            store,
            replicator,
            muxer,
        }
    }

    async fn join(&self, root: RootKey, name: &str) -> GroupSession {
        self.muxer
            .join(root, SessionOptions::named(name))
            .await
            .expect("join failed")
    }

    /// Forward every mux event into a channel.
    fn events(&self) -> (Subscription, mpsc::UnboundedReceiver<MuxEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.muxer.subscribe(move |event| {
            let _ = tx.send(event);
        });
        (sub, rx)
    }
}

/// Wait until `session` holds `feeds` feeds and has nothing left in flight.
async fn converge(session: &GroupSession, feeds: usize) {
    let mut status = session.watch();
    timeout(WAIT, status.wait_for(|s| s.feeds == feeds && s.is_quiescent()))
        .await
        .unwrap_or_else(|_| {
            panic!(
                "{} did not converge to {} feeds: {:?}",
                session.name(),
                feeds,
                session.status()
            )
        })
        .expect("status channel closed");
}

async fn wait_event(
    rx: &mut mpsc::UnboundedReceiver<MuxEvent>,
    pred: impl Fn(&MuxEvent) -> bool,
) -> MuxEvent {
    timeout(WAIT, async {
        while let Some(event) = rx.recv().await {
            if pred(&event) {
                return event;
            }
        }
        panic!("event stream ended");
    })
    .await
    .expect("timed out waiting for event")
}

fn sorted(mut keys: Vec<FeedKey>) -> Vec<FeedKey> {
    keys.sort();
    keys
}

// ==================== Convergence ====================

#[tokio::test]
async fn test_two_stores_two_root_keys() {
    let network = MemoryNetwork::new();
    let node1 = TestNode::new(&network);
    let node2 = TestNode::new(&network);

    let base1 = node1.store.create();
    let base2a = node2.store.create();
    let base2b = node2.store.create();
    base1.append("hello");
    assert_eq!(base1.get(0).unwrap(), b"hello");

    let mux1a = node1.join(KEY_A, "m1a").await;
    let mux1b = node1.join(KEY_B, "m1b").await;
    let mux2a = node2.join(KEY_A, "mux2a").await;
    let mux2b = node2.join(KEY_B, "mux2b").await;

    // Node 1 adds the same feed to both groups, node 2 one feed to each
    mux1a.add_feed(base1.clone());
    mux1b.add_feed(base1.clone());
    mux2a.add_feed(base2a.clone());
    mux2b.add_feed(base2b.clone());

    for session in [&mux1a, &mux1b, &mux2a, &mux2b] {
        converge(session, 2).await;
    }

    let group_a = sorted(vec![base1.key(), base2a.key()]);
    let group_b = sorted(vec![base1.key(), base2b.key()]);
    assert_eq!(sorted(mux1a.feed_keys()), group_a);
    assert_eq!(sorted(mux2a.feed_keys()), group_a);
    assert_eq!(sorted(mux1b.feed_keys()), group_b);
    assert_eq!(sorted(mux2b.feed_keys()), group_b);

    // Blocks actually replicated
    assert!(mux2b.has_feed(&base1.key()));
    let replica = node2.store.get(&base1.key()).expect("base1 not in store 2");
    assert_eq!(replica.get(0).unwrap(), b"hello");

    // One physical connection carried both groups
    assert_eq!(network.connection_count(), 1);
}

#[tokio::test]
async fn test_three_nodes_converge() {
    let network = MemoryNetwork::new();
    let a = TestNode::new(&network);
    let b = TestNode::new(&network);
    let c = TestNode::new(&network);

    let x = a.store.create();
    let y = b.store.create();
    let z = b.store.create();

    let sa = a.join(KEY_A, "a").await;
    sa.add_feed(x.clone());
    let sb = b.join(KEY_A, "b").await;
    sb.add_feed(y.clone());
    sb.add_feed(z.clone());
    let sc = c.join(KEY_A, "c").await;

    let all = sorted(vec![x.key(), y.key(), z.key()]);
    for session in [&sa, &sb, &sc] {
        converge(session, 3).await;
        assert_eq!(sorted(session.feed_keys()), all);
    }

    // Local feeds come first, in insertion order
    assert_eq!(&sb.feed_keys()[..2], &[y.key(), z.key()]);
    assert_eq!(sc.peer_count(), 2);
}

#[tokio::test]
async fn test_feed_added_after_steady_is_sent_as_delta() {
    let network = MemoryNetwork::new();
    let a = TestNode::new(&network);
    let b = TestNode::new(&network);
    let c = TestNode::new(&network);

    let sa = a.join(KEY_A, "a").await;
    sa.add_feed(a.store.create());
    let sb = b.join(KEY_A, "b").await;
    sb.add_feed(b.store.create());
    let sc = c.join(KEY_A, "c").await;
    for session in [&sa, &sb, &sc] {
        converge(session, 2).await;
    }

    let (_sub, mut events) = a.events();
    let w = a.store.create();
    assert!(sa.add_feed(w.clone()));

    for session in [&sa, &sb, &sc] {
        converge(session, 3).await;
        assert!(session.has_feed(&w.key()));
    }

    // Each of a's engines sent exactly the new key
    for _ in 0..2 {
        let event = wait_event(&mut events, |e| matches!(e, MuxEvent::AnnounceSent { .. })).await;
        match event {
            MuxEvent::AnnounceSent { count, .. } => assert_eq!(count, 1),
            _ => unreachable!(),
        }
    }
}

// ==================== Scoping ====================

#[tokio::test]
async fn test_groups_sharing_a_connection_stay_separate() {
    let network = MemoryNetwork::new();
    let node1 = TestNode::new(&network);
    let node2 = TestNode::new(&network);

    let f1 = node1.store.create();
    let f2 = node1.store.create();
    let s1a = node1.join(KEY_A, "1a").await;
    let s1b = node1.join(KEY_B, "1b").await;
    s1a.add_feed(f1.clone());
    s1b.add_feed(f2.clone());

    let s2a = node2.join(KEY_A, "2a").await;
    let s2b = node2.join(KEY_B, "2b").await;

    converge(&s2a, 1).await;
    converge(&s2b, 1).await;
    assert_eq!(s2a.feed_keys(), vec![f1.key()]);
    assert_eq!(s2b.feed_keys(), vec![f2.key()]);
    assert!(!s2a.has_feed(&f2.key()));
}

#[tokio::test]
async fn test_later_session_attaches_to_live_connection() {
    let network = MemoryNetwork::new();
    let node1 = TestNode::new(&network);
    let node2 = TestNode::new(&network);

    let s1 = node1.join(KEY_A, "first").await;
    let s2 = node2.join(KEY_A, "peer").await;
    s2.add_feed(node2.store.create());
    converge(&s1, 1).await;

    // Same root, already joined: no new swarm join, existing connection reused
    let late = node1.join(KEY_A, "late").await;
    assert_eq!(late.peer_count(), 1);
    assert_eq!(node1.net.join_count(), 1);
    assert_ne!(late.id(), s1.id());
    converge(&late, 1).await;
    assert_eq!(late.feed_keys(), s2.feed_keys());
}

#[tokio::test]
async fn test_sessions_on_one_key_converge_with_each_other() {
    let network = MemoryNetwork::new();
    let node1 = TestNode::new(&network);
    let node2 = TestNode::new(&network);

    let x = node1.store.create();
    let y = node2.store.create();
    let a = node1.join(KEY_A, "a").await;
    let a2 = node1.join(KEY_A, "a2").await;
    let b = node2.join(KEY_A, "b").await;
    a.add_feed(x.clone());
    b.add_feed(y.clone());

    for session in [&a, &a2, &b] {
        converge(session, 2).await;
    }
    let all = sorted(vec![x.key(), y.key()]);
    assert_eq!(sorted(a2.feed_keys()), all);
    assert_eq!(sorted(b.feed_keys()), all);
    // One membership channel per connection, fetched once
    assert_eq!(a2.peer_count(), 1);
    assert_eq!(node1.replicator.fetch_count(&y.key()), 1);

    // A feed added through the second session reaches the peer
    let w = node1.store.create();
    assert!(a2.add_feed(w.clone()));
    converge(&b, 3).await;

    // The group outlives the session that opened it
    node1.muxer.leave(&a).await.unwrap();
    let v = node2.store.create();
    b.add_feed(v.clone());
    converge(&a2, 4).await;
    assert!(a2.has_feed(&v.key()));
    assert!(a.is_closed() && !a2.is_closed());
}

// ==================== Idempotence ====================

#[tokio::test]
async fn test_no_duplicate_replication() {
    let network = MemoryNetwork::new();
    let node1 = TestNode::new(&network);
    let node2 = TestNode::new(&network);

    let feed = node1.store.create();
    let s1 = node1.join(KEY_A, "1").await;
    assert!(s1.add_feed(feed.clone()));
    assert!(!s1.add_feed(feed.clone()));

    let s2 = node2.join(KEY_A, "2").await;
    converge(&s2, 1).await;
    converge(&s1, 1).await;

    // Adding again after convergence changes nothing, and adopting a
    // learned feed locally does not announce it back
    assert!(!s1.add_feed(feed.clone()));
    let learned = s2.feeds().pop().unwrap();
    assert!(s2.add_feed(learned));
    converge(&s2, 1).await;
    assert_eq!(s2.feeds().len(), 1);

    assert_eq!(node2.replicator.fetch_count(&feed.key()), 1);
    assert_eq!(node1.replicator.offer_count(&feed.key()), 1);
    assert_eq!(node1.replicator.fetch_count(&feed.key()), 0);
    assert_eq!(s1.feed_keys(), vec![feed.key()]);
}

// ==================== Faults ====================

#[tokio::test]
async fn test_malformed_announce_fails_only_its_engine() {
    let network = MemoryNetwork::new();
    let node1 = TestNode::new(&network);
    let (_sub, mut events) = node1.events();

    let f2 = node1.store.create();
    let sa = node1.join(KEY_A, "a").await;
    let sb = node1.join(KEY_B, "b").await;
    sb.add_feed(f2.clone());

    // A bare node that speaks the wire format by hand
    let raw = network.node();
    raw.join(KEY_A.discovery_key(), Default::default()).await.unwrap();
    raw.join(KEY_B.discovery_key(), Default::default()).await.unwrap();
    let conn = raw.connection_to(&node1.net).expect("not connected");

    let bad = conn.open_channel(&session_label(&KEY_A.discovery_key())).await.unwrap();
    bad.send(b"definitely not an announce").await.unwrap();

    let failed = wait_event(&mut events, |e| matches!(e, MuxEvent::EngineFailed { .. })).await;
    match failed {
        MuxEvent::EngineFailed { group, error, .. } => {
            assert_eq!(group, KEY_A.discovery_key());
            assert!(error.contains("Malformed announce"), "{}", error);
        }
        _ => unreachable!(),
    }
    assert_eq!(sa.engine_phase(conn.id()), Some(EnginePhase::Closed));

    // The other group on the same connection still talks
    let good = conn.open_channel(&session_label(&KEY_B.discovery_key())).await.unwrap();
    let initial = timeout(WAIT, good.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(protocol::decode(&initial, 16).unwrap(), vec![f2.key()]);
    good.send(&protocol::encode(&[]).unwrap()).await.unwrap();

    converge(&sb, 1).await;
    assert_eq!(sb.engine_phase(conn.id()), Some(EnginePhase::Steady));
    assert!(!sa.is_closed());
}

#[tokio::test]
async fn test_silent_peer_settles_after_grace() {
    let network = MemoryNetwork::new();
    let node1 = TestNode::new(&network);
    let grace = node1.muxer.config().announce_grace;
    let (_sub, mut events) = node1.events();

    let x = node1.store.create();
    let sa = node1.join(KEY_A, "a").await;
    sa.add_feed(x.clone());

    // A bare node that opens the membership channel and never announces
    let raw = network.node();
    let started = Instant::now();
    raw.join(KEY_A.discovery_key(), Default::default()).await.unwrap();
    let conn = raw.connection_to(&node1.net).expect("not connected");
    let channel = conn.open_channel(&session_label(&KEY_A.discovery_key())).await.unwrap();

    let initial = timeout(WAIT, channel.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(protocol::decode(&initial, 16).unwrap(), vec![x.key()]);

    wait_event(&mut events, |e| matches!(e, MuxEvent::EngineSteady { .. })).await;
    assert!(started.elapsed() >= grace);
    assert_eq!(sa.engine_phase(conn.id()), Some(EnginePhase::Steady));

    // Feeds added after Steady go out one delta each, in call order
    let later: Vec<_> = (0..3).map(|_| node1.store.create()).collect();
    for feed in &later {
        assert!(sa.add_feed(feed.clone()));
    }
    for feed in &later {
        let delta = timeout(WAIT, channel.recv()).await.unwrap().unwrap().unwrap();
        assert_eq!(protocol::decode(&delta, 16).unwrap(), vec![feed.key()]);
    }
}

#[tokio::test]
async fn test_replication_failure_is_reported() {
    let network = MemoryNetwork::new();
    let node1 = TestNode::new(&network);
    let node2 = TestNode::new(&network);
    let (_sub, mut events) = node2.events();

    let broken = node1.store.create();
    let fine = node1.store.create();
    node2.replicator.fail_key(broken.key());

    let s1 = node1.join(KEY_A, "1").await;
    s1.add_feed(broken.clone());
    s1.add_feed(fine.clone());
    let s2 = node2.join(KEY_A, "2").await;

    let failed = wait_event(&mut events, |e| matches!(e, MuxEvent::ReplicationFailed { .. })).await;
    match failed {
        MuxEvent::ReplicationFailed { feed_key, .. } => assert_eq!(feed_key, broken.key()),
        _ => unreachable!(),
    }

    converge(&s2, 1).await;
    assert_eq!(s2.feed_keys(), vec![fine.key()]);
    assert_eq!(s2.status().in_flight, 0);
}

#[tokio::test]
async fn test_disconnect_detaches_engines() {
    let network = MemoryNetwork::new();
    let node1 = TestNode::new(&network);
    let node2 = TestNode::new(&network);

    let s1 = node1.join(KEY_A, "1").await;
    s1.add_feed(node1.store.create());
    let s2 = node2.join(KEY_A, "2").await;
    converge(&s2, 1).await;

    assert_eq!(node1.net.disconnect_all(), 1);

    let mut status = s2.watch();
    timeout(WAIT, status.wait_for(|s| s.engines == 0))
        .await
        .expect("engine not detached")
        .unwrap();
    // Learned feeds stay
    assert_eq!(s2.feeds().len(), 1);
    assert_eq!(node2.muxer.connection_count(), 0);
}

// ==================== Lifecycle ====================

#[tokio::test]
async fn test_join_is_reference_counted() {
    let network = MemoryNetwork::new();
    let node = TestNode::new(&network);

    let first = node.join(KEY_A, "first").await;
    let second = node.join(KEY_A, "second").await;
    assert_eq!(node.net.join_count(), 1);

    node.muxer.leave(&first).await.unwrap();
    assert_eq!(node.net.joined_keys(), vec![KEY_A.discovery_key()]);

    node.muxer.leave(&second).await.unwrap();
    assert!(node.net.joined_keys().is_empty());

    // Joining again after the last leave joins the swarm again
    node.join(KEY_A, "third").await;
    assert_eq!(node.net.join_count(), 2);
}

#[tokio::test]
async fn test_close_tears_everything_down() {
    let network = MemoryNetwork::new();
    let node1 = TestNode::new(&network);
    let node2 = TestNode::new(&network);
    let (_sub, mut peer_events) = node2.events();

    let s1a = node1.join(KEY_A, "a").await;
    let s1b = node1.join(KEY_B, "b").await;
    s1a.add_feed(node1.store.create());
    let s2 = node2.join(KEY_A, "peer").await;
    converge(&s2, 1).await;

    node1.muxer.close().await.unwrap();

    assert!(s1a.is_closed() && s1b.is_closed());
    assert!(!s1a.add_feed(node1.store.create()));
    assert!(node1.net.joined_keys().is_empty());
    assert!(node1.muxer.sessions().is_empty());
    assert!(node1.muxer.join(KEY_A, SessionOptions::default()).await.is_err());

    // The peer's engine sees its channel end
    wait_event(&mut peer_events, |e| matches!(e, MuxEvent::EngineClosed { .. })).await;
    assert_eq!(s2.feeds().len(), 1);
}
