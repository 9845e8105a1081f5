//! Deterministic RNG partitioning.
//!
//! A single master seed is split into independent per-subsystem substreams so
//! that adding randomness to one subsystem never perturbs another. The
//! "workload" subsystem consumes the master seed directly (golden traces were
//! generated that way); every other subsystem derives its seed as
//! `seed XOR fnv1a64(name)`.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Substream name consumed verbatim as the master seed.
pub const WORKLOAD_SUBSYSTEM: &str = "workload";

/// Master-seed holder handing out per-subsystem RNG substreams.
#[derive(Debug, Clone, Copy)]
pub struct PartitionedRng {
    master_seed: u64,
}

impl PartitionedRng {
    pub fn new(master_seed: u64) -> Self {
        Self { master_seed }
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    /// Derive the seed for a named subsystem.
    pub fn subsystem_seed(&self, subsystem: &str) -> u64 {
        if subsystem == WORKLOAD_SUBSYSTEM {
            self.master_seed
        } else {
            self.master_seed ^ fnv1a64(subsystem.as_bytes())
        }
    }

    /// RNG substream for a named subsystem.
    pub fn substream(&self, subsystem: &str) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.subsystem_seed(subsystem))
    }

    /// RNG substream for a per-instance subsystem (`instance-{id}`).
    pub fn instance_substream(&self, instance_id: usize) -> ChaCha8Rng {
        self.substream(&format!("instance-{instance_id}"))
    }
}

/// 64-bit FNV-1a over a byte string.
fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
