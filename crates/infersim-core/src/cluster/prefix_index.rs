//! Cluster-wide prefix-cache index.
//!
//! Tracks which block hashes each instance has (probably) cached so routing
//! can score cache affinity without touching instance-local KV state. One
//! bounded LRU per instance: recording a hash inserts or refreshes it,
//! overflow silently evicts the least-recently-used entry.

use std::collections::{BTreeMap, HashMap};

use crate::hash::{self, BlockHash};
use crate::types::InstanceId;

struct InstanceLru {
    /// Hash → recency stamp.
    entries: HashMap<BlockHash, u64>,
    /// Recency stamp → hash, ordered oldest-first.
    order: BTreeMap<u64, BlockHash>,
    capacity: usize,
    next_stamp: u64,
}

impl InstanceLru {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            capacity,
            next_stamp: 0,
        }
    }

    fn touch(&mut self, hash: BlockHash) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        if let Some(old) = self.entries.insert(hash, stamp) {
            self.order.remove(&old);
        }
        self.order.insert(stamp, hash);
        if self.entries.len() > self.capacity {
            if let Some((&oldest, _)) = self.order.iter().next() {
                let evicted = self.order.remove(&oldest).expect("oldest entry exists");
                self.entries.remove(&evicted);
            }
        }
    }

    fn contains(&self, hash: &BlockHash) -> bool {
        self.entries.contains_key(hash)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Per-cluster map from (instance, block hash) to recency.
pub struct PrefixCacheIndex {
    block_size: usize,
    capacity_per_instance: usize,
    instances: HashMap<InstanceId, InstanceLru>,
}

impl PrefixCacheIndex {
    pub fn new(block_size: usize, capacity_per_instance: usize) -> Self {
        assert!(block_size > 0, "block size must be positive");
        assert!(capacity_per_instance > 0, "capacity must be positive");
        Self {
            block_size,
            capacity_per_instance,
            instances: HashMap::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Hash chain for the full blocks of `tokens`; the same function the KV
    /// caches use.
    pub fn compute_block_hashes(&self, tokens: &[u32]) -> Vec<BlockHash> {
        hash::block_hashes(tokens, self.block_size)
    }

    /// Insert-or-refresh `hashes` for an instance, evicting silently beyond
    /// capacity.
    pub fn record_blocks(&mut self, hashes: &[BlockHash], instance: InstanceId) {
        let lru = self
            .instances
            .entry(instance)
            .or_insert_with(|| InstanceLru::new(self.capacity_per_instance));
        for &h in hashes {
            lru.touch(h);
        }
    }

    /// Longest consecutive-from-start run of `hashes` present for `instance`.
    pub fn match_length(&self, hashes: &[BlockHash], instance: InstanceId) -> usize {
        match self.instances.get(&instance) {
            Some(lru) => hashes.iter().take_while(|h| lru.contains(h)).count(),
            None => 0,
        }
    }

    /// Distinct hashes currently tracked for an instance.
    pub fn instance_block_count(&self, instance: InstanceId) -> usize {
        self.instances.get(&instance).map_or(0, InstanceLru::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes(n: u32) -> Vec<BlockHash> {
        // Distinct, deterministic hashes.
        (0..n)
            .map(|i| hash::sequence_hash(&[i, i + 1, i + 2]))
            .collect()
    }

    #[test]
    fn record_then_match_returns_full_length() {
        let mut index = PrefixCacheIndex::new(16, 64);
        let hs = hashes(8);
        index.record_blocks(&hs, 0);
        assert_eq!(index.match_length(&hs, 0), 8);
        assert_eq!(index.match_length(&hs, 1), 0);
        assert_eq!(index.instance_block_count(0), 8);
    }

    #[test]
    fn match_stops_at_first_miss() {
        let mut index = PrefixCacheIndex::new(16, 64);
        let hs = hashes(6);
        index.record_blocks(&hs[..3], 0);
        // Hole at position 3: later entries don't extend the match.
        index.record_blocks(&hs[4..], 0);
        assert_eq!(index.match_length(&hs, 0), 3);
    }

    #[test]
    fn overflow_evicts_least_recently_used() {
        let mut index = PrefixCacheIndex::new(16, 4);
        let hs = hashes(6);
        index.record_blocks(&hs[..4], 0);
        // Refresh the first entry, then overflow by two.
        index.record_blocks(&hs[..1], 0);
        index.record_blocks(&hs[4..6], 0);
        // hs[1] and hs[2] were the oldest untouched entries.
        assert_eq!(index.instance_block_count(0), 4);
        assert_eq!(index.match_length(&hs[..1], 0), 1);
        assert_eq!(index.match_length(&hs[1..2], 0), 0);
        assert_eq!(index.match_length(&hs[2..3], 0), 0);
        assert_eq!(index.match_length(&hs[3..4], 0), 1);
    }

    #[test]
    fn short_sequences_produce_no_hashes() {
        let index = PrefixCacheIndex::new(16, 4);
        let tokens: Vec<u32> = (0..10).collect();
        assert!(index.compute_block_hashes(&tokens).is_empty());
        assert_eq!(index.compute_block_hashes(&(0..32).collect::<Vec<_>>()).len(), 2);
    }

    #[test]
    fn instances_are_isolated() {
        let mut index = PrefixCacheIndex::new(16, 8);
        let hs = hashes(4);
        index.record_blocks(&hs, 0);
        index.record_blocks(&hs[..2], 1);
        assert_eq!(index.match_length(&hs, 0), 4);
        assert_eq!(index.match_length(&hs, 1), 2);
    }
}
