//! Paged KV-block cache for one instance.
//!
//! A fixed pool of blocks, each holding up to `block_size` tokens. Full
//! blocks carry a hash of the entire token prefix up to their boundary so
//! identical prefixes across requests share blocks. Free blocks live on a
//! doubly-linked list: allocation pops the head, release pushes each block to
//! the tail in reverse chain order, so the blocks hashing the longest (least
//! reusable) prefixes are evicted first. A released block keeps its hash in
//! the prefix map until the block is popped for fresh use.

use std::collections::HashMap;

use tracing::debug;

use crate::hash::{self, BlockHash};
use crate::request::Request;
use crate::types::{BlockId, RequestId};

/// A single KV block.
#[derive(Debug, Clone)]
pub struct KvBlock {
    pub id: BlockId,
    pub ref_count: usize,
    pub in_use: bool,
    /// Set only while the block is full.
    pub hash: Option<BlockHash>,
    /// Token ids stored in this block, at most `block_size`.
    pub tokens: Vec<u32>,
    free_prev: Option<BlockId>,
    free_next: Option<BlockId>,
}

impl KvBlock {
    fn new(id: BlockId) -> Self {
        Self {
            id,
            ref_count: 0,
            in_use: false,
            hash: None,
            tokens: Vec::new(),
            free_prev: None,
            free_next: None,
        }
    }
}

/// Per-instance KV cache state.
pub struct KvCache {
    block_size: usize,
    blocks: Vec<KvBlock>,
    /// Request id → ordered block chain.
    request_blocks: HashMap<RequestId, Vec<BlockId>>,
    /// Prefix hash → block currently holding that prefix.
    hash_map: HashMap<BlockHash, BlockId>,
    free_head: Option<BlockId>,
    free_tail: Option<BlockId>,
    free_len: usize,
    used_blocks: usize,
}

impl KvCache {
    pub fn new(total_blocks: usize, block_size: usize) -> Self {
        assert!(total_blocks > 0, "block pool must be non-empty");
        assert!(block_size > 0, "block size must be positive");
        let blocks: Vec<KvBlock> = (0..total_blocks).map(KvBlock::new).collect();
        let mut cache = Self {
            block_size,
            blocks,
            request_blocks: HashMap::new(),
            hash_map: HashMap::new(),
            free_head: None,
            free_tail: None,
            free_len: 0,
            used_blocks: 0,
        };
        for id in 0..total_blocks {
            cache.push_free_tail(id);
        }
        cache
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn total_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn used_blocks(&self) -> usize {
        self.used_blocks
    }

    pub fn free_blocks(&self) -> usize {
        self.free_len
    }

    pub fn utilization(&self) -> f64 {
        self.used_blocks as f64 / self.blocks.len() as f64
    }

    /// Ordered block chain held by a request.
    pub fn request_block_ids(&self, request_id: &str) -> Option<&[BlockId]> {
        self.request_blocks.get(request_id).map(|v| v.as_slice())
    }

    /// Longest leading run of `hashes` present in the prefix map.
    pub fn matched_blocks(&self, hashes: &[BlockHash]) -> usize {
        hashes
            .iter()
            .take_while(|h| self.hash_map.contains_key(*h))
            .count()
    }

    /// Block ids for the longest cached full-block prefix of `tokens`,
    /// stopping at the first miss.
    pub fn cached_blocks_for(&self, tokens: &[u32]) -> Vec<BlockId> {
        hash::block_hashes(tokens, self.block_size)
            .iter()
            .map_while(|h| self.hash_map.get(h).copied())
            .collect()
    }

    /// Ensure the request's chain has capacity for tokens `[from, to)`.
    ///
    /// Leading blocks may be satisfied from `shared_prefix_hashes` (reusing a
    /// cached block bumps its refcount; a retained free block is pulled off
    /// the free list). The remainder comes from the free-list head. Returns
    /// `false` without mutating anything when the remaining demand exceeds
    /// the free supply.
    pub fn allocate(
        &mut self,
        request: &Request,
        from: usize,
        to: usize,
        shared_prefix_hashes: &[BlockHash],
    ) -> bool {
        debug_assert!(to > from, "empty allocation range");
        let held = self
            .request_blocks
            .get(request.id())
            .map_or(0, Vec::len);
        let needed_total = to.div_ceil(self.block_size);

        // Feasibility first so failure never leaves partial state behind.
        let mut reusable = Vec::new();
        let mut reused_from_free = 0;
        if held == 0 {
            for h in shared_prefix_hashes.iter().take(needed_total) {
                match self.hash_map.get(h) {
                    Some(&id) => {
                        if self.blocks[id].ref_count == 0 {
                            reused_from_free += 1;
                        }
                        reusable.push(id);
                    }
                    None => break,
                }
            }
        }
        let fresh_needed = needed_total.saturating_sub(held + reusable.len());
        if fresh_needed > self.free_len - reused_from_free {
            return false;
        }

        for id in reusable {
            if self.blocks[id].ref_count == 0 {
                self.unlink_free(id);
                self.used_blocks += 1;
            }
            self.blocks[id].ref_count += 1;
            self.blocks[id].in_use = true;
            self.request_blocks
                .entry(request.id().to_string())
                .or_default()
                .push(id);
        }

        for _ in 0..fresh_needed {
            let id = self.pop_free_head().expect("free supply checked above");
            let block = &mut self.blocks[id];
            if let Some(old) = block.hash.take() {
                // The retained prefix is gone once the block is repurposed.
                if self.hash_map.get(&old) == Some(&id) {
                    self.hash_map.remove(&old);
                }
            }
            block.tokens.clear();
            block.ref_count = 1;
            block.in_use = true;
            self.used_blocks += 1;
            self.request_blocks
                .entry(request.id().to_string())
                .or_default()
                .push(id);
        }

        self.fill_known_tokens(request, to);
        debug!(
            request = request.id(),
            from, to, fresh_needed, "allocated kv blocks"
        );
        true
    }

    /// Append one emitted token to the request's tail block, growing the
    /// chain from the free list when the tail is full.
    pub fn append_token(&mut self, request_id: &str, token: u32) -> bool {
        let Some(chain) = self.request_blocks.get(request_id) else {
            return false;
        };
        let needs_block = match chain.last() {
            Some(&tail) => self.blocks[tail].tokens.len() == self.block_size,
            None => true,
        };
        if needs_block {
            let Some(id) = self.pop_free_head() else {
                return false;
            };
            let block = &mut self.blocks[id];
            if let Some(old) = block.hash.take() {
                if self.hash_map.get(&old) == Some(&id) {
                    self.hash_map.remove(&old);
                }
            }
            block.tokens.clear();
            block.ref_count = 1;
            block.in_use = true;
            self.used_blocks += 1;
            self.request_blocks
                .get_mut(request_id)
                .expect("chain exists")
                .push(id);
        }
        let chain = self.request_blocks.get(request_id).expect("chain exists");
        let tail = *chain.last().expect("non-empty chain");
        self.blocks[tail].tokens.push(token);
        if self.blocks[tail].tokens.len() == self.block_size {
            self.seal_block(request_id, tail);
        }
        true
    }

    /// Release all blocks of a request in reverse chain order. Blocks whose
    /// refcount reaches zero go to the free-list tail with their hash
    /// retained in the prefix map.
    pub fn release(&mut self, request_id: &str) {
        let Some(chain) = self.request_blocks.remove(request_id) else {
            return;
        };
        for &id in chain.iter().rev() {
            let block = &mut self.blocks[id];
            assert!(block.ref_count > 0, "refcount underflow on block {id}");
            block.ref_count -= 1;
            if block.ref_count == 0 {
                block.in_use = false;
                self.used_blocks -= 1;
                self.push_free_tail(id);
            }
        }
        debug!(request = request_id, blocks = chain.len(), "released kv blocks");
    }

    /// Pool accounting must balance after every public call.
    pub fn check_accounting(&self) -> bool {
        self.used_blocks + self.free_len == self.blocks.len()
    }

    /// Write the request's already-known tokens (input plus decoded output)
    /// into the chain up to `to`, sealing blocks as they fill. Slots reserved
    /// for tokens not yet emitted stay empty.
    fn fill_known_tokens(&mut self, request: &Request, to: usize) {
        let chain = match self.request_blocks.get(request.id()) {
            Some(c) => c.clone(),
            None => return,
        };
        let mut filled = chain
            .iter()
            .map(|&id| self.blocks[id].tokens.len())
            .sum::<usize>();
        let known = request.input_len() + request.decoded;
        let target = to.min(known);
        while filled < target {
            let token = if filled < request.input_len() {
                request.input_tokens()[filled]
            } else {
                request.output_tokens()[filled - request.input_len()]
            };
            let block_id = chain[filled / self.block_size];
            debug_assert_eq!(self.blocks[block_id].tokens.len(), filled % self.block_size);
            self.blocks[block_id].tokens.push(token);
            filled += 1;
            if self.blocks[block_id].tokens.len() == self.block_size {
                self.seal_block(request.id(), block_id);
            }
        }
    }

    /// A block just filled: hash the whole prefix through it and publish the
    /// hash, unless the block was reused and already carries it.
    fn seal_block(&mut self, request_id: &str, block_id: BlockId) {
        if self.blocks[block_id].hash.is_some() {
            return;
        }
        let chain = self.request_blocks.get(request_id).expect("chain exists");
        let position = chain
            .iter()
            .position(|&b| b == block_id)
            .expect("block in chain");
        let mut prefix = Vec::with_capacity((position + 1) * self.block_size);
        for &b in &chain[..=position] {
            prefix.extend_from_slice(&self.blocks[b].tokens);
        }
        let digest = hash::sequence_hash(&prefix);
        self.blocks[block_id].hash = Some(digest);
        self.hash_map.insert(digest, block_id);
    }

    fn pop_free_head(&mut self) -> Option<BlockId> {
        let head = self.free_head?;
        self.unlink_free(head);
        Some(head)
    }

    fn unlink_free(&mut self, id: BlockId) {
        let (prev, next) = {
            let b = &self.blocks[id];
            (b.free_prev, b.free_next)
        };
        match prev {
            Some(p) => self.blocks[p].free_next = next,
            None => self.free_head = next,
        }
        match next {
            Some(n) => self.blocks[n].free_prev = prev,
            None => self.free_tail = prev,
        }
        self.blocks[id].free_prev = None;
        self.blocks[id].free_next = None;
        self.free_len -= 1;
    }

    fn push_free_tail(&mut self, id: BlockId) {
        self.blocks[id].free_prev = self.free_tail;
        self.blocks[id].free_next = None;
        match self.free_tail {
            Some(t) => self.blocks[t].free_next = Some(id),
            None => self.free_head = Some(id),
        }
        self.free_tail = Some(id);
        self.free_len += 1;
    }
}
