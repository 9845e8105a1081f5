//! Prefix hashing for KV-block deduplication.
//!
//! A block hash covers the *entire* token prefix up to a block boundary, not
//! just the block's own tokens, so two requests share a block only when
//! everything before it matches as well. The same function backs the
//! instance-local KV cache, the cluster prefix index and prefix-affinity
//! routing.

use sha2::{Digest, Sha256};

/// SHA-256 digest of a pipe-delimited decimal token prefix.
pub type BlockHash = [u8; 32];

/// Hash the full token sequence (used by prefix-affinity routing).
pub fn sequence_hash(tokens: &[u32]) -> BlockHash {
    let mut hasher = Sha256::new();
    feed(&mut hasher, tokens, 0);
    hasher.finalize().into()
}

/// Hash chain for every full block of `tokens`.
///
/// Returns exactly `tokens.len() / block_size` hashes; hash `i` covers
/// `tokens[0..(i + 1) * block_size]`. A sequence shorter than one block
/// produces no hashes.
pub fn block_hashes(tokens: &[u32], block_size: usize) -> Vec<BlockHash> {
    assert!(block_size > 0, "block size must be positive");
    let full_blocks = tokens.len() / block_size;
    let mut hashes = Vec::with_capacity(full_blocks);
    let mut hasher = Sha256::new();
    for block in 0..full_blocks {
        let start = block * block_size;
        feed(&mut hasher, &tokens[start..start + block_size], start);
        // Clone so the running hasher keeps absorbing the next block.
        hashes.push(hasher.clone().finalize().into());
    }
    hashes
}

fn feed(hasher: &mut Sha256, tokens: &[u32], offset: usize) {
    let mut buf = [0u8; 10];
    for (i, token) in tokens.iter().enumerate() {
        if offset + i > 0 {
            hasher.update(b"|");
        }
        let s = write_decimal(&mut buf, *token);
        hasher.update(s);
    }
}

fn write_decimal(buf: &mut [u8; 10], mut v: u32) -> &[u8] {
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (v % 10) as u8;
        v /= 10;
        if v == 0 {
            break;
        }
    }
    &buf[pos..]
}
