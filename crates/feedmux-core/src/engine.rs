//! Membership protocol engine: one per (group, peer connection).
//!
//! The engine converges two peers' feed sets for one root key:
//!
//! 1. On start it opens the group's channel on the connection and sends an
//!    announce of every feed the group holds (even an empty one, so the
//!    peer need not wait out its grace period)
//! 2. Each announce received marks its keys as known by the peer; keys the
//!    group lacks are fetched through the replicator on a per-feed
//!    sub-channel, then relayed to the group's other peers
//! 3. Feeds added later arrive through the outbox and go out as deltas,
//!    never as a full re-announce
//!
//! Every key we announce is also offered to the replicator, so the peer can
//! fetch it. Offers and fetches run as detached tasks and are left to the
//! replicator's lifecycle when the engine stops.

use crate::events::{now_ms, MuxEvent};
use crate::feed::FeedHandle;
use crate::keys::FeedKey;
use crate::protocol::{self, feed_label, ProtocolError};
use crate::group::GroupShared;
use crate::transport::{Channel, ConnectionId, PeerConnection, TransportError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Lifecycle phase of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EnginePhase {
    /// Created, membership channel not yet open
    Init,
    /// Initial announce sent, waiting to hear from the peer
    Announcing,
    /// Peer heard from (or grace period over); only deltas from here on
    Steady,
    /// Channel or connection gone; sends nothing more
    Closed,
}

impl EnginePhase {
    /// Steady and Closed engines have nothing left to converge.
    pub fn is_settled(&self) -> bool {
        matches!(self, EnginePhase::Steady | EnginePhase::Closed)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to open membership channel: {0}")]
    ChannelOpen(TransportError),

    #[error("Malformed announce: {0}")]
    MalformedAnnounce(ProtocolError),

    #[error("Failed to encode announce: {0}")]
    Encode(ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Runs the announce exchange for one connection.
pub(crate) struct Engine {
    group: Arc<GroupShared>,
    connection: Arc<dyn PeerConnection>,
    connection_id: ConnectionId,
    /// Batches of feeds to announce, queued by the group in add order
    outbox: mpsc::UnboundedReceiver<Vec<FeedHandle>>,
    phase: EnginePhase,
    initial_sent: bool,
    announces_received: usize,
    grace_elapsed: bool,
}

impl Engine {
    pub(crate) fn new(
        group: Arc<GroupShared>,
        connection: Arc<dyn PeerConnection>,
        outbox: mpsc::UnboundedReceiver<Vec<FeedHandle>>,
    ) -> Self {
        let connection_id = connection.id().clone();
        Self {
            group,
            connection,
            connection_id,
            outbox,
            phase: EnginePhase::Init,
            initial_sent: false,
            announces_received: 0,
            grace_elapsed: false,
        }
    }

    /// Drive the engine until its channel or connection goes away.
    pub(crate) async fn run(mut self) {
        let result = self.drive().await;
        self.phase = EnginePhase::Closed;
        self.group.engine_finished(&self.connection_id, result.err());
    }

    async fn drive(&mut self) -> Result<()> {
        let channel = self
            .connection
            .open_channel(self.group.label())
            .await
            .map_err(EngineError::ChannelOpen)?;
        debug!(
            "[{}] Opened {} on {}",
            self.group.name(),
            channel.label(),
            self.connection_id
        );

        let grace = tokio::time::sleep(self.group.config().announce_grace);
        tokio::pin!(grace);

        loop {
            tokio::select! {
                // Outbox first: the initial announce leaves before anything
                // received is processed, and deltas keep their order.
                biased;

                batch = self.outbox.recv() => match batch {
                    Some(batch) => self.send_announce(channel.as_ref(), batch).await?,
                    None => return Ok(()),
                },

                incoming = channel.recv() => match incoming? {
                    Some(data) => self.receive_announce(&data)?,
                    None => {
                        debug!("[{}] Channel closed by {}", self.group.name(), self.connection_id);
                        return Ok(());
                    }
                },

                _ = &mut grace, if !self.grace_elapsed => {
                    self.grace_elapsed = true;
                    self.maybe_steady();
                }
            }
        }
    }

    async fn send_announce(&mut self, channel: &dyn Channel, batch: Vec<FeedHandle>) -> Result<()> {
        if batch.is_empty() && self.initial_sent {
            return Ok(());
        }

        let keys: Vec<FeedKey> = batch.iter().map(|f| f.key()).collect();
        let data = protocol::encode(&keys).map_err(EngineError::Encode)?;
        channel.send(&data).await?;

        debug!(
            "[{}] Announced {} feed(s) to {}",
            self.group.name(),
            keys.len(),
            self.connection_id
        );
        self.group.emit(MuxEvent::AnnounceSent {
            group: *self.group.discovery_key(),
            connection_id: self.connection_id.clone(),
            count: keys.len(),
            size: data.len(),
            timestamp: now_ms(),
        });

        for feed in batch {
            self.spawn_offer(feed);
        }

        if !self.initial_sent {
            self.initial_sent = true;
            self.set_phase(EnginePhase::Announcing);
            self.maybe_steady();
        }
        Ok(())
    }

    fn receive_announce(&mut self, data: &[u8]) -> Result<()> {
        let keys = protocol::decode(data, self.group.config().max_announce_keys)
            .map_err(EngineError::MalformedAnnounce)?;

        let outcome = self.group.record_announce(&self.connection_id, &keys);
        debug!(
            "[{}] {} announced {} feed(s), {} new, fetching {}",
            self.group.name(),
            self.connection_id,
            keys.len(),
            outcome.fresh,
            outcome.fetch.len()
        );
        self.group.emit(MuxEvent::AnnounceReceived {
            group: *self.group.discovery_key(),
            connection_id: self.connection_id.clone(),
            count: keys.len(),
            fresh: outcome.fresh,
            timestamp: now_ms(),
        });

        for key in outcome.fetch {
            self.spawn_fetch(key);
        }

        self.announces_received += 1;
        self.maybe_steady();
        Ok(())
    }

    fn maybe_steady(&mut self) {
        if self.phase == EnginePhase::Announcing
            && self.initial_sent
            && (self.announces_received > 0 || self.grace_elapsed)
        {
            self.set_phase(EnginePhase::Steady);
            self.group.emit(MuxEvent::EngineSteady {
                group: *self.group.discovery_key(),
                connection_id: self.connection_id.clone(),
                timestamp: now_ms(),
            });
        }
    }

    fn set_phase(&mut self, phase: EnginePhase) {
        self.phase = phase;
        self.group.engine_phase_changed(&self.connection_id, phase);
    }

    /// Offer a feed we announced so the peer can fetch it.
    fn spawn_offer(&self, feed: FeedHandle) {
        let group = Arc::clone(&self.group);
        let connection = Arc::clone(&self.connection);
        let connection_id = self.connection_id.clone();
        let key = feed.key();
        let label = feed_label(self.group.discovery_key(), &key);

        tokio::spawn(async move {
            let result = match connection.open_channel(&label).await {
                Ok(channel) => group
                    .replicator()
                    .begin_replication(Some(feed), key, channel)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(
                    "[{}] Failed to offer {} to {}: {}",
                    group.name(),
                    key.short(),
                    connection_id,
                    e
                );
                group.offer_failed(&connection_id, key, &e);
            }
        });
    }

    /// Fetch a feed the peer announced and we lack.
    fn spawn_fetch(&self, key: FeedKey) {
        let group = Arc::clone(&self.group);
        let connection = Arc::clone(&self.connection);
        let connection_id = self.connection_id.clone();
        let label = feed_label(self.group.discovery_key(), &key);

        tokio::spawn(async move {
            let result = match connection.open_channel(&label).await {
                Ok(channel) => group.replicator().begin_replication(None, key, channel).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(feed) if feed.key() == key => group.feed_replicated(&connection_id, feed),
                Ok(feed) => {
                    let e = TransportError::ReplicationSetup(format!(
                        "replicator returned feed {} for {}",
                        feed.key().short(),
                        key.short()
                    ));
                    group.replication_failed(&connection_id, key, &e);
                }
                Err(e) => group.replication_failed(&connection_id, key, &e),
            }
        });
    }
}
