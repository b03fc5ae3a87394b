//! Feed capability and the replication collaborator.
//!
//! A feed is whatever the caller's log store hands out; this layer only needs
//! its key. Block exchange for a single feed belongs to the [`Replicator`].

use crate::keys::FeedKey;
use crate::transport::{Channel, Result};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// A replicable append-only log, owned by the caller.
pub trait Feed: Debug + Send + Sync {
    /// Stable identity of the feed.
    fn key(&self) -> FeedKey;
}

/// Shared reference to a feed. Never mutated by this crate.
pub type FeedHandle = Arc<dyn Feed>;

/// Per-feed replication, implemented by the log store.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Start replicating `key` over `channel`.
    ///
    /// `local` is `Some` when we hold the feed and are offering it, `None`
    /// when we are fetching it from the peer. Returns the handle the session
    /// should expose; fails with
    /// [`TransportError::ReplicationSetup`](crate::transport::TransportError::ReplicationSetup)
    /// when the channel is unusable or the feed cannot be fetched.
    async fn begin_replication(
        &self,
        local: Option<FeedHandle>,
        key: FeedKey,
        channel: Box<dyn Channel>,
    ) -> Result<FeedHandle>;
}
