// Pluggable hashing for key routing and ring placement.
//
// Every hasher here must be deterministic and process-independent:
// routing decisions and stored plan orderings are compared across
// restarts and across machines.

use std::hash::Hasher;

use fnv::FnvHasher;
use xxhash_rust::xxh32::xxh32;
use xxhash_rust::xxh64::xxh64;

/// Seed used when a key has to be re-routed after its assigned shard was
/// removed from the ring.
pub const FALLBACK_SEED: u32 = 0x9e37_79b9;

/// Hash of a logical key's canonical bytes to a 32-bit value.
///
/// Collisions are fine; routing uses the value modulo shard count or as a
/// ring position, never as a unique identity.
pub trait KeyHasher: Send + Sync {
    fn hash_key(&self, key: &[u8]) -> u32;

    /// Alternate hash used for the one-shot fallback re-route. The
    /// default derivation perturbs the primary hash; seeded hashers
    /// should override with a genuinely independent seed.
    fn hash_key_fallback(&self, key: &[u8]) -> u32 {
        self.hash_key(key).rotate_left(16) ^ FALLBACK_SEED
    }
}

/// Hash of a ring-node label (shard id + replica index).
pub trait RingHasher: Send + Sync {
    fn hash_label(&self, label: &str) -> u32;
}

/// Default key hasher: xxHash32 with a configurable seed.
#[derive(Debug, Clone, Copy)]
pub struct Xxh32KeyHasher {
    seed: u32,
}

impl Xxh32KeyHasher {
    pub fn new(seed: u32) -> Self {
        Self { seed }
    }
}

impl Default for Xxh32KeyHasher {
    fn default() -> Self {
        Self { seed: 0 }
    }
}

impl KeyHasher for Xxh32KeyHasher {
    fn hash_key(&self, key: &[u8]) -> u32 {
        xxh32(key, self.seed)
    }

    fn hash_key_fallback(&self, key: &[u8]) -> u32 {
        xxh32(key, self.seed ^ FALLBACK_SEED)
    }
}

/// Default ring hasher: FNV-1a folded to 32 bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fnv1aRingHasher;

impl RingHasher for Fnv1aRingHasher {
    fn hash_label(&self, label: &str) -> u32 {
        let mut hasher = FnvHasher::default();
        hasher.write(label.as_bytes());
        let h = hasher.finish();
        ((h >> 32) ^ h) as u32
    }
}

/// Stable 64-bit digest of canonical key bytes.
///
/// Used to order migration plan moves deterministically; the output must
/// not depend on process, locale or bitness, so this is a fixed-seed
/// xxHash64 over the canonical byte form.
pub fn stable_key_hash(key: &[u8]) -> u64 {
    xxh64(key, 0)
}
