//! Consistent hash ring mapping counter keys to shards.
//!
//! Every shard is placed on the ring at `virtual_nodes` positions, each
//! derived from `blake3("{shard}:{i}")`. A key belongs to the first position at
//! or after its own hash, wrapping around to the lowest position when it hashes
//! past the end of the ring.
//!
//! The hash is fixed and unseeded so placement is reproducible across restarts
//! and across processes sharing the same shard list.
//!
//! Two virtual nodes hashing to the same position is not guarded against: the
//! later insertion takes the position.

use crate::error::{CounterError, CounterResult};
use std::collections::{BTreeMap, BTreeSet};

/// Default number of virtual nodes placed per shard.
pub const DEFAULT_VIRTUAL_NODES: usize = 100;

/// Hash a string onto the ring.
///
/// Uses the first 8 bytes of the BLAKE3 digest, big-endian.
pub fn ring_hash(value: &str) -> u64 {
    let digest = blake3::hash(value.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(prefix)
}

/// Consistent hash ring with virtual nodes.
#[derive(Debug, Clone)]
pub struct HashRing {
    virtual_nodes: usize,
    /// Ring position -> shard, ordered by position
    positions: BTreeMap<u64, String>,
}

impl HashRing {
    /// Create an empty ring placing `virtual_nodes` positions per shard.
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes,
            positions: BTreeMap::new(),
        }
    }

    /// Build a ring from a list of shards.
    pub fn with_nodes<I, S>(nodes: I, virtual_nodes: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ring = Self::new(virtual_nodes);
        for node in nodes {
            ring.add_node(node.as_ref());
        }
        ring
    }

    /// Place a shard on the ring. Adding a shard twice is a no-op.
    pub fn add_node(&mut self, node: &str) {
        for i in 0..self.virtual_nodes {
            let position = ring_hash(&format!("{}:{}", node, i));
            self.positions.insert(position, node.to_string());
        }
    }

    /// Remove every position owned by `node`.
    pub fn remove_node(&mut self, node: &str) {
        self.positions.retain(|_, owner| owner != node);
    }

    /// Find the shard owning `key`.
    pub fn locate(&self, key: &str) -> CounterResult<&str> {
        let hash = ring_hash(key);
        self.positions
            .range(hash..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, node)| node.as_str())
            .ok_or(CounterError::RingEmpty)
    }

    /// Distinct shards currently on the ring, sorted.
    pub fn nodes(&self) -> Vec<String> {
        self.positions
            .values()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.positions.values().any(|owner| owner == node)
    }

    /// Number of virtual nodes on the ring.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_node_ring() -> HashRing {
        HashRing::with_nodes(["shard-a", "shard-b", "shard-c"], DEFAULT_VIRTUAL_NODES)
    }

    #[test]
    fn test_empty_ring_fails() {
        let ring = HashRing::default();
        assert!(matches!(ring.locate("page:1"), Err(CounterError::RingEmpty)));
    }

    #[test]
    fn test_deterministic() {
        let ring1 = three_node_ring();
        let ring2 = three_node_ring();
        for i in 0..500 {
            let key = format!("page:{}:visits", i);
            assert_eq!(ring1.locate(&key).unwrap(), ring2.locate(&key).unwrap());
        }
    }

    #[test]
    fn test_hash_is_stable() {
        // Placement must survive restarts, so the hash cannot change between builds
        assert_eq!(ring_hash("page:1"), ring_hash("page:1"));
        assert_ne!(ring_hash("page:1"), ring_hash("page:2"));
    }

    #[test]
    fn test_virtual_node_count() {
        let ring = three_node_ring();
        assert_eq!(ring.len(), 3 * DEFAULT_VIRTUAL_NODES);
        assert_eq!(ring.nodes(), vec!["shard-a", "shard-b", "shard-c"]);
    }

    #[test]
    fn test_add_node_twice_is_noop() {
        let mut ring = three_node_ring();
        ring.add_node("shard-a");
        assert_eq!(ring.len(), 3 * DEFAULT_VIRTUAL_NODES);
    }

    #[test]
    fn test_single_node_owns_everything() {
        let ring = HashRing::with_nodes(["only"], 10);
        for i in 0..100 {
            assert_eq!(ring.locate(&format!("key_{}", i)).unwrap(), "only");
        }
    }

    #[test]
    fn test_successor_rule_and_wraparound() {
        let ring = HashRing::with_nodes(["shard-a", "shard-b"], 4);
        let (&last_position, _) = ring.positions.iter().next_back().unwrap();
        let (_, first_owner) = ring.positions.iter().next().unwrap();

        for i in 0..2000 {
            let key = format!("key_{}", i);
            let hash = ring_hash(&key);
            let owner = ring.locate(&key).unwrap();
            if hash > last_position {
                assert_eq!(owner, first_owner);
            } else {
                let (_, expected) = ring.positions.range(hash..).next().unwrap();
                assert_eq!(owner, expected);
            }
        }
    }

    #[test]
    fn test_remove_node() {
        let mut ring = three_node_ring();
        ring.remove_node("shard-b");

        assert!(!ring.contains("shard-b"));
        assert_eq!(ring.len(), 2 * DEFAULT_VIRTUAL_NODES);
        for i in 0..1000 {
            assert_ne!(ring.locate(&format!("key_{}", i)).unwrap(), "shard-b");
        }
    }

    #[test]
    fn test_remove_unknown_node_is_noop() {
        let mut ring = three_node_ring();
        ring.remove_node("shard-z");
        assert_eq!(ring.len(), 3 * DEFAULT_VIRTUAL_NODES);
    }

    #[test]
    fn test_remove_last_node_empties_ring() {
        let mut ring = HashRing::with_nodes(["only"], 10);
        ring.remove_node("only");
        assert!(ring.is_empty());
        assert!(matches!(ring.locate("key"), Err(CounterError::RingEmpty)));
    }

    #[test]
    fn test_distribution() {
        let ring = HashRing::with_nodes(["shard-a", "shard-b", "shard-c", "shard-d"], 100);
        let num_keys = 20_000;
        let mut counts = std::collections::HashMap::new();

        for i in 0..num_keys {
            let key = format!("page:{}:visits", i);
            *counts.entry(ring.locate(&key).unwrap().to_string()).or_insert(0u32) += 1;
        }

        // 100 virtual nodes keep every shard within a generous band around 25%
        let expected = num_keys / 4;
        for (node, count) in counts {
            assert!(
                count > expected / 2 && count < expected * 3 / 2,
                "{} owns {} keys, expected ~{}",
                node,
                count,
                expected
            );
        }
    }
}
