//! Duplicate suppression: every JSON-RPC id ever sent or accepted.
//!
//! The relay offers no delivery-once guarantee and is asked to replay
//! missed frames after a reconnect, so the id set is the only thing
//! standing between the session and double delivery. Outbound ids are
//! recorded too, so a relay echo of our own frame is dropped.

use std::collections::HashSet;
use tracing::trace;

/// Set of message ids observed over the lifetime of a session.
///
/// Grows monotonically; a session's id space is 16 random bytes per
/// message, so in-memory growth is bounded by session traffic.
#[derive(Debug, Clone, Default)]
pub struct SeenMessages {
    ids: HashSet<String>,
}

impl SeenMessages {
    /// Create an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an id. Returns `false` if it was already present
    /// (duplicate or replay).
    pub fn record(&mut self, id: &str) -> bool {
        let fresh = self.ids.insert(id.to_string());
        if !fresh {
            trace!(id, "Duplicate message id");
        }
        fresh
    }

    /// Check whether an id has been seen without recording it.
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Number of recorded ids.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_record_accepts() {
        let mut seen = SeenMessages::new();
        assert!(seen.record("aabb"));
        assert!(seen.contains("aabb"));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_replay_rejected() {
        let mut seen = SeenMessages::new();
        assert!(seen.record("aabb"));
        assert!(!seen.record("aabb"));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_distinct_ids_accepted() {
        let mut seen = SeenMessages::new();
        assert!(seen.record("aa"));
        assert!(seen.record("bb"));
        assert_eq!(seen.len(), 2);
    }
}
