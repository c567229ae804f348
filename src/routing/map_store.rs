// Key→shard assignment store. Routers write through first-writer-wins
// CAS; the migration swapper is the only mutator of existing entries.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::RwLock;

use crate::core::{KeyMove, ShardId, ShardKey, TopologySnapshot};
use crate::error::{diag, ShardError, ShardErrorKind, ShardResult};

/// Result of an assignment attempt. `created` is true for exactly one
/// caller per key; everyone else observes the winner's shard id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignOutcome {
    pub created: bool,
    pub shard_id: ShardId,
}

/// Lazily consumed point-in-time enumeration of map entries.
///
/// The snapshot is taken when `enumerate` returns; concurrent writes are
/// not reflected. Cancellation is cooperative: stop iterating.
#[derive(Debug)]
pub struct MapEnumeration<K> {
    entries: std::vec::IntoIter<(ShardKey<K>, ShardId)>,
}

impl<K> Iterator for MapEnumeration<K> {
    type Item = (ShardKey<K>, ShardId);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }
}

impl<K> ExactSizeIterator for MapEnumeration<K> {
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Persistent key→shard assignment map with atomic CAS semantics.
///
/// All operations are synchronous: routers sit on the hot path and never
/// suspend. Implementations must make `try_assign`/`try_get_or_add`
/// linearizable per key.
pub trait ShardMapStore<K>: Send + Sync {
    /// Read-only lookup.
    fn try_get(&self, key: &ShardKey<K>) -> Option<ShardId>;

    /// Atomic: if no entry exists, create and return `(created=true,
    /// provided)`; otherwise return `(created=false, existing)`.
    fn try_assign(&self, key: &ShardKey<K>, shard_id: &ShardId) -> AssignOutcome;

    /// Single-lookup variant; the factory is invoked at most once even
    /// under contention. A factory failure surfaces as
    /// `AssignmentFailed` and leaves no entry behind.
    fn try_get_or_add(
        &self,
        key: &ShardKey<K>,
        factory: &dyn Fn() -> ShardResult<ShardId>,
    ) -> ShardResult<AssignOutcome>;

    /// Point-in-time enumeration. When `max_keys` is given and the map
    /// holds more entries, fails with `TopologyOverflow` carrying the
    /// observed and allowed counts.
    fn enumerate(&self, max_keys: Option<usize>) -> ShardResult<MapEnumeration<K>>;

    /// Replace the mapping for each move from `source` to `target` with
    /// per-key compare-and-set semantics. A key already at its target is
    /// treated as applied, which makes retries idempotent. Partial
    /// failure is retryable per key, never per batch: applied keys stay
    /// applied.
    fn swap(&self, moves: &[KeyMove<K>]) -> ShardResult<()>;
}

/// In-memory reference store. One lock, linearizable per key by
/// construction; good for development, tests and single-process hosts.
#[derive(Debug)]
pub struct InMemoryShardMapStore<K> {
    entries: RwLock<HashMap<ShardKey<K>, ShardId>>,
}

impl<K> InMemoryShardMapStore<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Build a topology snapshot from the current assignments. The shard
    /// set is the set of assigned shard ids; routers carry the live set.
    pub fn snapshot(&self, version: u64) -> TopologySnapshot<K> {
        let entries = self.entries.read();
        TopologySnapshot::new(
            version,
            entries.iter().map(|(k, v)| (k.clone(), v.clone())),
            entries.values().cloned(),
        )
    }
}

impl<K> Default for InMemoryShardMapStore<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> ShardMapStore<K> for InMemoryShardMapStore<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    fn try_get(&self, key: &ShardKey<K>) -> Option<ShardId> {
        self.entries.read().get(key).cloned()
    }

    fn try_assign(&self, key: &ShardKey<K>, shard_id: &ShardId) -> AssignOutcome {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(existing) => AssignOutcome {
                created: false,
                shard_id: existing.clone(),
            },
            None => {
                entries.insert(key.clone(), shard_id.clone());
                AssignOutcome {
                    created: true,
                    shard_id: shard_id.clone(),
                }
            }
        }
    }

    fn try_get_or_add(
        &self,
        key: &ShardKey<K>,
        factory: &dyn Fn() -> ShardResult<ShardId>,
    ) -> ShardResult<AssignOutcome> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(key) {
            return Ok(AssignOutcome {
                created: false,
                shard_id: existing.clone(),
            });
        }
        let shard_id = factory().map_err(|err| {
            ShardError::new(ShardErrorKind::AssignmentFailed, "assignment factory failed")
                .with_diagnostic(diag::OPERATION, "try_get_or_add")
                .with_source(anyhow::Error::new(err))
        })?;
        entries.insert(key.clone(), shard_id.clone());
        Ok(AssignOutcome {
            created: true,
            shard_id,
        })
    }

    fn enumerate(&self, max_keys: Option<usize>) -> ShardResult<MapEnumeration<K>> {
        let entries = self.entries.read();
        if let Some(max) = max_keys {
            if entries.len() > max {
                return Err(ShardError::new(
                    ShardErrorKind::TopologyOverflow,
                    "shard map exceeds the enumeration key budget",
                )
                .with_diagnostic(diag::KEY_COUNT, entries.len())
                .with_diagnostic(diag::MAX_KEY_COUNT, max));
            }
        }
        let snapshot: Vec<_> = entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(MapEnumeration {
            entries: snapshot.into_iter(),
        })
    }

    fn swap(&self, moves: &[KeyMove<K>]) -> ShardResult<()> {
        let mut entries = self.entries.write();
        let mut conflicts = 0_usize;
        for mv in moves {
            match entries.get_mut(&mv.key) {
                Some(current) if *current == mv.source => {
                    *current = mv.target.clone();
                }
                Some(current) if *current == mv.target => {
                    // Already applied; swap retries are idempotent.
                }
                _ => {
                    conflicts += 1;
                }
            }
        }
        if conflicts > 0 {
            return Err(ShardError::new(
                ShardErrorKind::Store,
                "swap compare-and-set lost for some keys",
            )
            .with_diagnostic(diag::OPERATION, "swap")
            .with_diagnostic("conflict_count", conflicts)
            .with_diagnostic(diag::KEY_COUNT, moves.len()));
        }
        Ok(())
    }
}
