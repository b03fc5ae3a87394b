//! Channel labels.
//!
//! Every session gets its own label per connection so several root keys can
//! share one physical connection without cross-talk. Labels carry the
//! discovery key, never the root key.

use crate::keys::{DiscoveryKey, FeedKey};

/// Current protocol version.
///
/// Increment when making breaking changes to the announce format.
pub const PROTOCOL_VERSION: u32 = 1;

/// Label of the membership channel for one discovery key.
pub fn session_label(discovery_key: &DiscoveryKey) -> String {
    format!("feedmux/v{}/{}", PROTOCOL_VERSION, discovery_key)
}

/// Label of the sub-channel used to replicate one feed within one group.
pub fn feed_label(discovery_key: &DiscoveryKey, key: &FeedKey) -> String {
    format!("feedmux/v{}/{}/feed/{}", PROTOCOL_VERSION, discovery_key, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{RootKey, KEY_LEN};

    #[test]
    fn test_session_label_uses_discovery_key() {
        let root = RootKey::from_bytes([1; KEY_LEN]);
        let label = session_label(&root.discovery_key());

        assert!(label.starts_with("feedmux/v1/"));
        assert!(label.ends_with(&root.discovery_key().to_string()));
        assert!(!label.contains(&root.to_string()));
    }

    #[test]
    fn test_labels_are_scoped() {
        let a = RootKey::from_bytes([1; KEY_LEN]).discovery_key();
        let b = RootKey::from_bytes([2; KEY_LEN]).discovery_key();
        assert_ne!(session_label(&a), session_label(&b));
    }

    #[test]
    fn test_feed_label_differs_from_session_label() {
        let dk = DiscoveryKey::from_bytes([3; KEY_LEN]);
        let feed = feed_label(&dk, &FeedKey::from_bytes([3; KEY_LEN]));
        assert_ne!(feed, session_label(&dk));
        assert!(feed.starts_with(&session_label(&dk)));
        assert!(feed.contains("/feed/"));
    }

    #[test]
    fn test_feed_label_is_scoped_per_group() {
        let key = FeedKey::from_bytes([9; KEY_LEN]);
        let a = RootKey::from_bytes([1; KEY_LEN]).discovery_key();
        let b = RootKey::from_bytes([2; KEY_LEN]).discovery_key();
        assert_ne!(feed_label(&a, &key), feed_label(&b, &key));
    }
}
