// Key→shard routers. Both strategies share one resolve path: consult the
// assignment store first, and only compute a placement for keys that have
// never been routed (or whose shard has left the topology).

use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::core::{KeyBytes, KeyMove, Shard, ShardId, ShardKey, TopologySnapshot};
use crate::error::{diag, ShardError, ShardErrorKind, ShardResult};
use crate::hashing::{Fnv1aRingHasher, KeyHasher, RingHasher, Xxh32KeyHasher};
use crate::metrics::{noop_metrics, Counter, Histogram, MetricsHandle, MetricsSink};
use crate::routing::map_store::ShardMapStore;
use crate::routing::ring::Ring;

/// Maximum virtual nodes per shard.
pub const MAX_REPLICATION_FACTOR: u32 = 10_000;
/// Default virtual nodes per shard.
pub const DEFAULT_REPLICATION_FACTOR: u32 = 100;

/// Synchronous hot-path routing capability.
pub trait ShardRouter<K, S>: Send + Sync {
    /// Map a key to its shard, assigning it on first sight.
    fn route(&self, key: &ShardKey<K>) -> ShardResult<Shard<S>>;

    /// Current shard handles, in registration order.
    fn shards(&self) -> Vec<Shard<S>>;

    fn shard_count(&self) -> usize {
        self.shards().len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub shard_count: usize,
    pub replication_factor: u32,
    pub ring_entries: usize,
}

fn validate_shards<S>(shards: &[Shard<S>]) -> ShardResult<()> {
    if shards.is_empty() {
        return Err(ShardError::new(
            ShardErrorKind::EmptyTopology,
            "router requires at least one shard",
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for shard in shards {
        if shard.id().is_empty() {
            return Err(ShardError::new(
                ShardErrorKind::RoutingConfig,
                "shard id must be a non-empty string",
            ));
        }
        if !seen.insert(shard.id().clone()) {
            return Err(ShardError::new(
                ShardErrorKind::DuplicateShardId,
                "duplicate shard id in topology",
            )
            .with_diagnostic(diag::SHARD_ID, shard.id()));
        }
    }
    Ok(())
}

/// Shared resolve path. `find_live` maps an assigned id to a live handle;
/// `compute` produces a placement, with `fallback=true` meaning the
/// one-shot re-hash used after a shard removal.
fn resolve<K, S>(
    store: &Arc<dyn ShardMapStore<K>>,
    metrics: &MetricsHandle,
    key: &ShardKey<K>,
    find_live: impl Fn(&ShardId) -> Option<Shard<S>>,
    compute: impl Fn(bool) -> ShardResult<Shard<S>>,
) -> ShardResult<Shard<S>>
where
    K: Clone + Eq + Hash,
{
    let started = Instant::now();

    if let Some(existing) = store.try_get(key) {
        if let Some(shard) = find_live(&existing) {
            metrics.incr(Counter::RouteHit, 1);
            metrics.observe(Histogram::RouteLatency, started.elapsed());
            return Ok(shard);
        }
        // Assigned shard left the topology: re-route once with the
        // fallback hash and move the assignment over.
        return reroute(store, metrics, key, &existing, &find_live, &compute, started);
    }

    let computed = compute(false)?;
    let target_id = computed.id().clone();
    let outcome = store.try_get_or_add(key, &|| Ok(target_id.clone()))?;
    if outcome.created {
        // Exactly one concurrent caller gets here per key.
        metrics.incr(Counter::RouteMiss, 1);
        metrics.incr(Counter::RouteHit, 1);
        metrics.observe(Histogram::RouteLatency, started.elapsed());
        debug!(shard_id = %target_id, "assigned new key");
        return Ok(computed);
    }

    // Lost the assignment race; follow the winner.
    if let Some(shard) = find_live(&outcome.shard_id) {
        metrics.incr(Counter::RouteHit, 1);
        metrics.observe(Histogram::RouteLatency, started.elapsed());
        return Ok(shard);
    }
    reroute(store, metrics, key, &outcome.shard_id, &find_live, &compute, started)
}

fn reroute<K, S>(
    store: &Arc<dyn ShardMapStore<K>>,
    metrics: &MetricsHandle,
    key: &ShardKey<K>,
    dead: &ShardId,
    find_live: &impl Fn(&ShardId) -> Option<Shard<S>>,
    compute: &impl Fn(bool) -> ShardResult<Shard<S>>,
    started: Instant,
) -> ShardResult<Shard<S>>
where
    K: Clone + Eq + Hash,
{
    let replacement = compute(true)?;
    let mv = KeyMove::new(key.clone(), dead.clone(), replacement.id().clone())?;
    match store.swap(std::slice::from_ref(&mv)) {
        Ok(()) => {
            metrics.incr(Counter::RouteMiss, 1);
            metrics.incr(Counter::RouteHit, 1);
            metrics.observe(Histogram::RouteLatency, started.elapsed());
            debug!(from = %dead, to = %replacement.id(), "re-routed key off removed shard");
            Ok(replacement)
        }
        Err(_) => {
            // Another router moved the key first; trust the new mapping.
            if let Some(current) = store.try_get(key) {
                if let Some(shard) = find_live(&current) {
                    metrics.incr(Counter::RouteHit, 1);
                    metrics.observe(Histogram::RouteLatency, started.elapsed());
                    return Ok(shard);
                }
            }
            Err(ShardError::new(
                ShardErrorKind::NoAvailableShard,
                "no live shard for key after fallback re-route",
            )
            .with_diagnostic(diag::SHARD_ID, dead))
        }
    }
}

/// Modulo router: `shard_index = hash(key) % shard_count`.
///
/// Valid only while the shard set is static; there is no topology
/// mutation surface here on purpose.
pub struct ModuloRouter<K, S> {
    shards: Vec<Shard<S>>,
    store: Arc<dyn ShardMapStore<K>>,
    key_hasher: Arc<dyn KeyHasher>,
    metrics: MetricsHandle,
}

impl<K, S> ModuloRouter<K, S>
where
    K: KeyBytes + Clone + Eq + Hash + Send + Sync,
    S: Send + Sync,
{
    pub fn new(shards: Vec<Shard<S>>, store: Arc<dyn ShardMapStore<K>>) -> ShardResult<Self> {
        validate_shards(&shards)?;
        Ok(Self {
            shards,
            store,
            key_hasher: Arc::new(Xxh32KeyHasher::default()),
            metrics: MetricsHandle::new(noop_metrics()),
        })
    }

    pub fn with_key_hasher(mut self, hasher: Arc<dyn KeyHasher>) -> Self {
        self.key_hasher = hasher;
        self
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = MetricsHandle::new(sink);
        self
    }
}

impl<K, S> ShardRouter<K, S> for ModuloRouter<K, S>
where
    K: KeyBytes + Clone + Eq + Hash + Send + Sync,
    S: Send + Sync,
{
    fn route(&self, key: &ShardKey<K>) -> ShardResult<Shard<S>> {
        resolve(
            &self.store,
            &self.metrics,
            key,
            |id| self.shards.iter().find(|s| s.id() == id).cloned(),
            |_fallback| {
                let hash = self.key_hasher.hash_key(&key.key_bytes());
                let index = hash as usize % self.shards.len();
                Ok(self.shards[index].clone())
            },
        )
    }

    fn shards(&self) -> Vec<Shard<S>> {
        self.shards.clone()
    }
}

impl<K, S> std::fmt::Debug for ModuloRouter<K, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuloRouter")
            .field("shards", &self.shards.len())
            .finish()
    }
}

/// Consistent-hash router with `replication_factor` virtual nodes per
/// shard and a lock-free ring snapshot for readers. The only router that
/// supports topology mutation.
pub struct ConsistentHashRouter<K, S> {
    ring: Ring<S>,
    store: Arc<dyn ShardMapStore<K>>,
    key_hasher: Arc<dyn KeyHasher>,
    replication_factor: u32,
    metrics: MetricsHandle,
}

impl<K, S> ConsistentHashRouter<K, S>
where
    K: KeyBytes + Clone + Eq + Hash + Send + Sync,
    S: Send + Sync,
{
    pub fn new(
        shards: Vec<Shard<S>>,
        store: Arc<dyn ShardMapStore<K>>,
        replication_factor: u32,
    ) -> ShardResult<Self> {
        validate_shards(&shards)?;
        if replication_factor == 0 || replication_factor > MAX_REPLICATION_FACTOR {
            return Err(ShardError::new(
                ShardErrorKind::RoutingConfig,
                "replication factor out of range",
            )
            .with_diagnostic("replication_factor", replication_factor)
            .with_diagnostic("max", MAX_REPLICATION_FACTOR));
        }
        let shard_count = shards.len();
        let router = Self {
            ring: Ring::new(shards, replication_factor, Arc::new(Fnv1aRingHasher)),
            store,
            key_hasher: Arc::new(Xxh32KeyHasher::default()),
            replication_factor,
            metrics: MetricsHandle::new(noop_metrics()),
        };
        info!(
            shard_count,
            replication_factor, "consistent-hash router initialized"
        );
        Ok(router)
    }

    pub fn with_default_replication(
        shards: Vec<Shard<S>>,
        store: Arc<dyn ShardMapStore<K>>,
    ) -> ShardResult<Self> {
        Self::new(shards, store, DEFAULT_REPLICATION_FACTOR)
    }

    pub fn with_key_hasher(mut self, hasher: Arc<dyn KeyHasher>) -> Self {
        self.key_hasher = hasher;
        self
    }

    pub fn with_ring_hasher(self, hasher: Arc<dyn RingHasher>) -> Self {
        let shards = self.ring.load().shards().to_vec();
        Self {
            ring: Ring::new(shards, self.replication_factor, hasher),
            ..self
        }
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = MetricsHandle::new(sink);
        self
    }

    /// Insert a shard: `replication_factor` new ring entries, published
    /// as one snapshot swap. In-flight readers keep the old snapshot.
    pub fn add_shard(&self, shard: Shard<S>) -> ShardResult<()> {
        self.ring.add_shard(shard)
    }

    /// Remove a shard. Keys mapped to it re-route on their next route
    /// call via the fallback path.
    pub fn remove_shard(&self, shard_id: &ShardId) -> bool {
        self.ring.remove_shard(shard_id)
    }

    pub fn stats(&self) -> RouterStats {
        let snapshot = self.ring.load();
        RouterStats {
            shard_count: snapshot.shards().len(),
            replication_factor: self.replication_factor,
            ring_entries: snapshot.shards().len() * self.replication_factor as usize,
        }
    }

    /// Point-in-time topology snapshot: current assignments plus the
    /// live shard set. Input for the migration planner.
    pub fn topology_snapshot(&self, version: u64) -> ShardResult<TopologySnapshot<K>> {
        let assignments = self.store.enumerate(None)?;
        let snapshot = self.ring.load();
        Ok(TopologySnapshot::new(
            version,
            assignments,
            snapshot.shards().iter().map(|s| s.id().clone()),
        ))
    }

    fn ring_target(&self, key: &ShardKey<K>, fallback: bool) -> ShardResult<Shard<S>> {
        let snapshot = self.ring.load();
        let bytes = key.key_bytes();
        let hash = if fallback {
            self.key_hasher.hash_key_fallback(&bytes)
        } else {
            self.key_hasher.hash_key(&bytes)
        };
        snapshot.lookup(hash).cloned().ok_or_else(|| {
            ShardError::new(ShardErrorKind::NoAvailableShard, "ring has no shards")
                .with_diagnostic(diag::KEY_HASH, hash)
                .with_diagnostic(diag::SHARD_COUNT, snapshot.shards().len())
        })
    }
}

impl<K, S> ShardRouter<K, S> for ConsistentHashRouter<K, S>
where
    K: KeyBytes + Clone + Eq + Hash + Send + Sync,
    S: Send + Sync,
{
    fn route(&self, key: &ShardKey<K>) -> ShardResult<Shard<S>> {
        resolve(
            &self.store,
            &self.metrics,
            key,
            |id| self.ring.load().shard_by_id(id).cloned(),
            |fallback| self.ring_target(key, fallback),
        )
    }

    fn shards(&self) -> Vec<Shard<S>> {
        self.ring.load().shards().to_vec()
    }
}

impl<K, S> std::fmt::Debug for ConsistentHashRouter<K, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistentHashRouter")
            .field("replication_factor", &self.replication_factor)
            .finish()
    }
}
