//! Wire protocol for membership exchange.
//!
//! This module defines what travels over a session's logical channel:
//! - Channel labels scoping each root key (and each feed) on a connection
//! - The bincode-encoded announce message

pub mod announce;
pub mod label;

pub use announce::{decode, encode, MuxMessage, ProtocolError, MAX_MESSAGE_SIZE};
pub use label::{feed_label, session_label, PROTOCOL_VERSION};
