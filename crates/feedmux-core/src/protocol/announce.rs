//! Announce message.
//!
//! The only message on a membership channel. It lists feed keys the sender
//! wants the receiver to know about, in the order they were added locally.
//! There is no request message: receiving an unknown key is the request.
//!
//! Wire format: bincode (fixed-int, little endian) of [`MuxMessage`], where
//! each key is a length-prefixed byte string. Keys are validated on decode so
//! a corrupt message is rejected as a whole.

use crate::keys::{FeedKey, KeyError};
use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum encoded message size (4MB) accepted from a peer.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Message too large: {0} bytes")]
    TooLarge(usize),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid feed key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("Too many keys in announce: {count} > {max}")]
    TooManyKeys { count: usize, max: usize },
}

/// Messages exchanged on a membership channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MuxMessage {
    /// Feed keys the sender holds for this group.
    Announce {
        /// Raw 32-byte keys
        keys: Vec<Vec<u8>>,
    },
}

impl MuxMessage {
    pub fn announce(keys: &[FeedKey]) -> Self {
        MuxMessage::Announce {
            keys: keys.iter().map(|k| k.as_bytes().to_vec()).collect(),
        }
    }
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_MESSAGE_SIZE as u64)
}

/// Encode an announce for `keys`.
pub fn encode(keys: &[FeedKey]) -> Result<Vec<u8>, ProtocolError> {
    wire_options()
        .serialize(&MuxMessage::announce(keys))
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Decode an announce, returning its keys in wire order.
///
/// Rejects oversized messages, trailing bytes, keys of the wrong length and
/// announces listing more than `max_keys` keys.
pub fn decode(data: &[u8], max_keys: usize) -> Result<Vec<FeedKey>, ProtocolError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge(data.len()));
    }

    let msg: MuxMessage = wire_options()
        .deserialize(data)
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;

    match msg {
        MuxMessage::Announce { keys } => {
            if keys.len() > max_keys {
                return Err(ProtocolError::TooManyKeys {
                    count: keys.len(),
                    max: max_keys,
                });
            }
            keys.iter()
                .map(|k| FeedKey::try_from_slice(k).map_err(ProtocolError::from))
                .collect()
        }
    }
}
