//! Chunk reassembly buffers.
//!
//! Large messages arrive as N independently encrypted parts sharing a
//! chunk-group id. A [`ChunkBuffer`] is created on the first part seen for
//! a group, sized to the advertised length, and removed once every slot is
//! filled (message emitted) or the group goes stale and is evicted.
//!
//! Ordering across groups is not guaranteed; reassembly keys strictly on
//! the group id, so interleaved sends from the peer cannot corrupt each
//! other.

use crate::core::config::CHUNK_BUFFER_TTL;
use crate::core::error::BridgeError;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// ── Single group ─────────────────────────────────────────────────────────────

/// Sparse slot buffer for one chunk group.
#[derive(Debug)]
pub struct ChunkBuffer {
    slots: Vec<Option<String>>,
    expected: u32,
    created_at: Instant,
    filled: u32,
}

impl ChunkBuffer {
    fn new(expected: u32) -> Self {
        Self {
            slots: (0..expected).map(|_| None).collect(),
            expected,
            created_at: Instant::now(),
            filled: 0,
        }
    }

    /// Number of parts advertised for this group.
    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Number of parts received so far.
    pub fn received(&self) -> u32 {
        self.filled
    }

    fn insert(&mut self, index: u32, part: String) -> Result<(), BridgeError> {
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or_else(|| {
                BridgeError::protocol(format!(
                    "chunk index {index} out of range (expected {})",
                    self.expected
                ))
            })?;
        if slot.is_some() {
            // Same index delivered twice under distinct outer ids; first wins.
            debug!(index, "Ignoring repeated chunk index");
            return Ok(());
        }
        *slot = Some(part);
        self.filled += 1;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.filled == self.expected
    }

    /// Concatenate all parts in index order. Caller must check completeness.
    fn assemble(self) -> String {
        let mut blob = String::new();
        for slot in self.slots {
            if let Some(part) = slot {
                blob.push_str(&part);
            }
        }
        blob
    }

    fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.created_at)
    }
}

// ── Accumulator ──────────────────────────────────────────────────────────────

/// Result of feeding one chunk into the accumulator.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// All parts received; the concatenated blob, group removed.
    Complete(String),
    /// Still waiting for more parts.
    Partial { received: u32, expected: u32 },
}

/// All in-flight chunk groups, keyed by group id.
#[derive(Debug)]
pub struct ChunkAccumulator {
    buffers: HashMap<String, ChunkBuffer>,
    ttl: Duration,
}

impl Default for ChunkAccumulator {
    fn default() -> Self {
        Self::new(CHUNK_BUFFER_TTL)
    }
}

impl ChunkAccumulator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            ttl,
        }
    }

    /// Feed one chunk. Creates the group buffer on first contact, enforces
    /// a consistent advertised length, and returns the assembled blob once
    /// the final part lands.
    ///
    /// A length that contradicts the existing buffer is fatal for the
    /// whole group: the buffer is dropped and an error returned.
    pub fn accept(
        &mut self,
        group_id: &str,
        index: u32,
        length: u32,
        part: String,
    ) -> Result<ChunkOutcome, BridgeError> {
        self.evict_stale();

        if length == 0 {
            return Err(BridgeError::protocol("chunk group with zero length"));
        }

        let buffer = self
            .buffers
            .entry(group_id.to_string())
            .or_insert_with(|| ChunkBuffer::new(length));

        if buffer.expected() != length {
            let expected = buffer.expected();
            self.buffers.remove(group_id);
            warn!(group_id, expected, received = length, "Chunk length mismatch, dropping group");
            return Err(BridgeError::protocol(format!(
                "chunk length mismatch for group {group_id}: buffer expects {expected}, chunk claims {length}"
            )));
        }

        buffer.insert(index, part)?;

        if buffer.is_complete() {
            // Remove before assembling so a completed group can never
            // re-trigger; replays of its parts are stopped upstream by
            // the envelope id dedup.
            let blob = self
                .buffers
                .remove(group_id)
                .map(ChunkBuffer::assemble)
                .unwrap_or_default();
            debug!(group_id, parts = length, "Chunk group complete");
            Ok(ChunkOutcome::Complete(blob))
        } else {
            Ok(ChunkOutcome::Partial {
                received: buffer.received(),
                expected: buffer.expected(),
            })
        }
    }

    /// Drop groups that have been waiting longer than the TTL.
    pub fn evict_stale(&mut self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.buffers.retain(|group_id, buffer| {
            let keep = buffer.age(now) < ttl;
            if !keep {
                warn!(
                    %group_id,
                    received = buffer.received(),
                    expected = buffer.expected(),
                    "Evicting stale chunk group"
                );
            }
            keep
        });
    }

    /// Number of in-flight groups.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    /// Drop all in-flight groups.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_chunk_group_completes_immediately() {
        let mut acc = ChunkAccumulator::default();
        match acc.accept("g1", 0, 1, "hello".into()).unwrap() {
            ChunkOutcome::Complete(blob) => assert_eq!(blob, "hello"),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut acc = ChunkAccumulator::default();
        assert!(matches!(
            acc.accept("g1", 2, 3, "c".into()).unwrap(),
            ChunkOutcome::Partial { received: 1, expected: 3 }
        ));
        assert!(matches!(
            acc.accept("g1", 0, 3, "a".into()).unwrap(),
            ChunkOutcome::Partial { received: 2, expected: 3 }
        ));
        match acc.accept("g1", 1, 3, "b".into()).unwrap() {
            ChunkOutcome::Complete(blob) => assert_eq!(blob, "abc"),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_length_mismatch_drops_group() {
        let mut acc = ChunkAccumulator::default();
        acc.accept("g1", 0, 3, "a".into()).unwrap();
        assert!(acc.accept("g1", 1, 4, "b".into()).is_err());
        assert_eq!(acc.pending(), 0, "mismatched group must be dropped");
    }

    #[test]
    fn test_index_out_of_range_rejected() {
        let mut acc = ChunkAccumulator::default();
        assert!(acc.accept("g1", 5, 3, "x".into()).is_err());
    }

    #[test]
    fn test_repeated_index_ignored() {
        let mut acc = ChunkAccumulator::default();
        acc.accept("g1", 0, 2, "first".into()).unwrap();
        assert!(matches!(
            acc.accept("g1", 0, 2, "second".into()).unwrap(),
            ChunkOutcome::Partial { received: 1, expected: 2 }
        ));
        match acc.accept("g1", 1, 2, "b".into()).unwrap() {
            ChunkOutcome::Complete(blob) => assert_eq!(blob, "firstb"),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_independent_groups_do_not_interfere() {
        let mut acc = ChunkAccumulator::default();
        acc.accept("g1", 0, 2, "a1".into()).unwrap();
        acc.accept("g2", 0, 2, "b1".into()).unwrap();
        assert_eq!(acc.pending(), 2);

        match acc.accept("g2", 1, 2, "b2".into()).unwrap() {
            ChunkOutcome::Complete(blob) => assert_eq!(blob, "b1b2"),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(acc.pending(), 1);
    }

    #[test]
    fn test_stale_groups_evicted() {
        let mut acc = ChunkAccumulator::new(Duration::from_millis(0));
        acc.accept("g1", 0, 2, "a".into()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        acc.evict_stale();
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut acc = ChunkAccumulator::default();
        assert!(acc.accept("g1", 0, 0, "x".into()).is_err());
    }
}
