// Consistent-hash ring. Built once per topology change as an immutable
// sorted snapshot and published with a single atomic reference swap;
// readers never observe a half-built ring.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::core::{Shard, ShardId};
use crate::error::{diag, ShardError, ShardErrorKind, ShardResult};
use crate::hashing::RingHasher;

/// One virtual node: the hashed ring position and the index of its shard
/// in the snapshot's shard table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RingEntry {
    pub hash: u32,
    pub shard_index: usize,
}

/// Immutable ring state: sorted virtual nodes plus the backing shards.
pub(crate) struct RingSnapshot<S> {
    entries: Vec<RingEntry>,
    shards: Vec<Shard<S>>,
}

impl<S> RingSnapshot<S> {
    fn build(shards: Vec<Shard<S>>, replication_factor: u32, hasher: &dyn RingHasher) -> Self {
        let mut entries = Vec::with_capacity(shards.len() * replication_factor as usize);
        for (shard_index, shard) in shards.iter().enumerate() {
            for replica in 0..replication_factor {
                let label = format!("{}#{}", shard.id(), replica);
                entries.push(RingEntry {
                    hash: hasher.hash_label(&label),
                    shard_index,
                });
            }
        }
        // Sort by position; the index tiebreak keeps rebuilds stable when
        // two labels collide on a hash.
        entries.sort_by(|a, b| a.hash.cmp(&b.hash).then(a.shard_index.cmp(&b.shard_index)));
        Self { entries, shards }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub(crate) fn shards(&self) -> &[Shard<S>] {
        &self.shards
    }

    pub(crate) fn shard_by_id(&self, id: &ShardId) -> Option<&Shard<S>> {
        self.shards.iter().find(|s| s.id() == id)
    }

    /// First virtual node at or after `hash`, wrapping to the start.
    pub(crate) fn lookup(&self, hash: u32) -> Option<&Shard<S>> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = self.entries.partition_point(|e| e.hash < hash);
        let entry = if idx == self.entries.len() {
            &self.entries[0]
        } else {
            &self.entries[idx]
        };
        self.shards.get(entry.shard_index)
    }
}

impl<S> std::fmt::Debug for RingSnapshot<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingSnapshot")
            .field("entries", &self.entries.len())
            .field("shards", &self.shards.len())
            .finish()
    }
}

/// Ring holder: many lock-free readers, one serialized mutator.
pub(crate) struct Ring<S> {
    snapshot: ArcSwap<RingSnapshot<S>>,
    mutator: Mutex<()>,
    replication_factor: u32,
    hasher: Arc<dyn RingHasher>,
}

impl<S> Ring<S> {
    pub(crate) fn new(
        shards: Vec<Shard<S>>,
        replication_factor: u32,
        hasher: Arc<dyn RingHasher>,
    ) -> Self {
        let snapshot = RingSnapshot::build(shards, replication_factor, hasher.as_ref());
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            mutator: Mutex::new(()),
            replication_factor,
            hasher,
        }
    }

    pub(crate) fn load(&self) -> Arc<RingSnapshot<S>> {
        self.snapshot.load_full()
    }

    /// Insert a shard and publish a rebuilt snapshot. Fails if the id is
    /// already on the ring.
    pub(crate) fn add_shard(&self, shard: Shard<S>) -> ShardResult<()> {
        let _guard = self.mutator.lock();
        let current = self.snapshot.load_full();
        if current.shard_by_id(shard.id()).is_some() {
            return Err(ShardError::new(
                ShardErrorKind::DuplicateShardId,
                "shard is already part of the ring",
            )
            .with_diagnostic(diag::SHARD_ID, shard.id()));
        }
        let mut shards: Vec<Shard<S>> = current.shards.to_vec();
        let id = shard.id().clone();
        shards.push(shard);
        let next = RingSnapshot::build(shards, self.replication_factor, self.hasher.as_ref());
        info!(shard_id = %id, ring_entries = next.entries.len(), "added shard to ring");
        self.snapshot.store(Arc::new(next));
        Ok(())
    }

    /// Remove a shard's virtual nodes and publish a rebuilt snapshot.
    /// Returns false when the id was not on the ring.
    pub(crate) fn remove_shard(&self, shard_id: &ShardId) -> bool {
        let _guard = self.mutator.lock();
        let current = self.snapshot.load_full();
        if current.shard_by_id(shard_id).is_none() {
            return false;
        }
        let shards: Vec<Shard<S>> = current
            .shards
            .iter()
            .filter(|s| s.id() != shard_id)
            .cloned()
            .collect();
        let next = RingSnapshot::build(shards, self.replication_factor, self.hasher.as_ref());
        warn!(shard_id = %shard_id, remaining = next.shards.len(), "removed shard from ring");
        self.snapshot.store(Arc::new(next));
        true
    }
}

impl<S> std::fmt::Debug for Ring<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("replication_factor", &self.replication_factor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::Fnv1aRingHasher;

    fn shard(id: &str) -> Shard<()> {
        Shard::new(id, || ())
    }

    fn ring(ids: &[&str], rf: u32) -> Ring<()> {
        Ring::new(
            ids.iter().map(|id| shard(id)).collect(),
            rf,
            Arc::new(Fnv1aRingHasher),
        )
    }

    #[test]
    fn lookup_wraps_around() {
        let ring = ring(&["s1", "s2"], 8);
        let snapshot = ring.load();
        // u32::MAX is past every entry; the lookup must wrap to index 0.
        assert!(snapshot.lookup(u32::MAX).is_some());
        assert!(snapshot.lookup(0).is_some());
    }

    #[test]
    fn readers_keep_their_snapshot_across_mutation() {
        let ring = ring(&["s1", "s2"], 16);
        let before = ring.load();
        assert!(ring.remove_shard(&ShardId::new("s2")));

        assert!(before.shard_by_id(&ShardId::new("s2")).is_some());
        assert!(ring.load().shard_by_id(&ShardId::new("s2")).is_none());
    }

    #[test]
    fn add_rejects_duplicate_ids() {
        let ring = ring(&["s1"], 4);
        let err = ring.add_shard(shard("s1")).unwrap_err();
        assert_eq!(err.kind(), ShardErrorKind::DuplicateShardId);
    }

    #[test]
    fn remove_unknown_shard_is_false() {
        let ring = ring(&["s1"], 4);
        assert!(!ring.remove_shard(&ShardId::new("nope")));
    }
}
