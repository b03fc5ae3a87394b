//! Fixed-length key types: root keys, feed keys and discovery keys.
//!
//! All three wrap 32 raw bytes and display as 64-character lowercase hex.
//! A [`RootKey`] names a replication group; it is never handed to the
//! networker directly. Instead it maps to a [`DiscoveryKey`] through a keyed
//! hash, and the discovery key is what gets announced on the swarm.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Length in bytes of every key type in this module.
pub const KEY_LEN: usize = 32;

/// Message hashed under the root key to derive its discovery key.
const DISCOVERY_CONTEXT: &[u8] = b"hypercore";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid key length: expected {len} bytes, got {0}", len = KEY_LEN)]
    InvalidLength(usize),
    #[error("Invalid key format: expected {} hex chars", KEY_LEN * 2)]
    InvalidFormat,
}

macro_rules! key_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; KEY_LEN]);

        impl $name {
            /// Wrap raw key bytes.
            pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
                Self(bytes)
            }

            /// Parse from a byte slice, rejecting anything that is not exactly
            /// [`KEY_LEN`] bytes long.
            pub fn try_from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
                let arr: [u8; KEY_LEN] = bytes
                    .try_into()
                    .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
                Ok(Self(arr))
            }

            /// Generate a random key.
            pub fn generate() -> Self {
                use rand::Rng;
                let mut bytes = [0u8; KEY_LEN];
                rand::rng().fill(&mut bytes);
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
                &self.0
            }

            /// First 8 hex chars, for log lines.
            pub fn short(&self) -> String {
                self.to_string()[..8].to_string()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl FromStr for $name {
            type Err = KeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_hex(s).map(Self)
            }
        }

        impl From<[u8; KEY_LEN]> for $name {
            fn from(bytes: [u8; KEY_LEN]) -> Self {
                Self(bytes)
            }
        }

        // Serialize as hex string, same as Display
        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

key_type!(
    /// Identifier of a replication group.
    RootKey
);

key_type!(
    /// Identifier of one replicable append-only log.
    ///
    /// Two feed handles with the same `FeedKey` are the same feed.
    FeedKey
);

key_type!(
    /// Swarm topic derived from a [`RootKey`].
    DiscoveryKey
);

impl RootKey {
    /// Derive the discovery key announced on the swarm for this group.
    ///
    /// Keyed BLAKE3 of a fixed context string, so peers can find each other
    /// without revealing the root key to the discovery layer.
    pub fn discovery_key(&self) -> DiscoveryKey {
        let hash = blake3::keyed_hash(&self.0, DISCOVERY_CONTEXT);
        DiscoveryKey(*hash.as_bytes())
    }
}

fn parse_hex(s: &str) -> Result<[u8; KEY_LEN], KeyError> {
    if s.len() != KEY_LEN * 2 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(KeyError::InvalidFormat);
    }

    let mut bytes = [0u8; KEY_LEN];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| KeyError::InvalidFormat)?;
    }
    Ok(bytes)
}
