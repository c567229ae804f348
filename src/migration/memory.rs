// Reference in-memory collaborators: a per-shard KV backend, a data
// mover with scriptable fault injection, the three verification
// strategies, and map swappers. Meant for development and tests; real
// deployments supply their own backends.

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use fnv::FnvHasher;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::{KeyMove, ShardId, ShardKey};
use crate::error::{diag, ShardError, ShardErrorKind};
use crate::migration::traits::{DataMover, MapSwapper, MoveFault, VerificationStrategy, VerifyOutcome};
use crate::routing::map_store::ShardMapStore;

/// Canonical byte form for JSON-like documents: UTF-8, minified, property
/// order as declared by the value. Stored checksums stay comparable as
/// long as hosts funnel documents through this helper.
pub fn canonical_json_bytes(value: &serde_json::Value) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(value)
}

/// In-memory multi-shard KV backend the reference mover and verifiers
/// operate against.
#[derive(Debug)]
pub struct InMemoryShardSet<K> {
    shards: RwLock<HashMap<ShardId, HashMap<ShardKey<K>, Vec<u8>>>>,
}

impl<K> InMemoryShardSet<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    pub fn new() -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, shard_id: &ShardId, key: ShardKey<K>, value: Vec<u8>) {
        self.shards
            .write()
            .entry(shard_id.clone())
            .or_default()
            .insert(key, value);
    }

    pub fn get(&self, shard_id: &ShardId, key: &ShardKey<K>) -> Option<Vec<u8>> {
        self.shards
            .read()
            .get(shard_id)
            .and_then(|kv| kv.get(key).cloned())
    }

    pub fn key_count(&self, shard_id: &ShardId) -> usize {
        self.shards
            .read()
            .get(shard_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Corrupt a stored value in place. Test hook for verification
    /// mismatches.
    pub fn poison(&self, shard_id: &ShardId, key: &ShardKey<K>, value: Vec<u8>) {
        self.shards
            .write()
            .entry(shard_id.clone())
            .or_default()
            .insert(key.clone(), value);
    }
}

impl<K> Default for InMemoryShardSet<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFault {
    Transient,
    Permanent,
}

fn scripted_error(kind: ScriptedFault, operation: &str) -> MoveFault {
    let err = ShardError::new(
        ShardErrorKind::Migration,
        format!("scripted {operation} fault"),
    )
    .with_diagnostic(diag::OPERATION, operation);
    match kind {
        ScriptedFault::Transient => MoveFault::Transient(err),
        ScriptedFault::Permanent => MoveFault::Permanent(err),
    }
}

/// Reference mover: copies bytes between shards of an `InMemoryShardSet`,
/// with an optional per-key fault script consumed one entry per attempt.
pub struct InMemoryDataMover<K> {
    store: Arc<InMemoryShardSet<K>>,
    faults: Mutex<HashMap<ShardKey<K>, VecDeque<ScriptedFault>>>,
    copy_attempts: Mutex<HashMap<ShardKey<K>, u32>>,
}

impl<K> InMemoryDataMover<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    pub fn new(store: Arc<InMemoryShardSet<K>>) -> Self {
        Self {
            store,
            faults: Mutex::new(HashMap::new()),
            copy_attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Script the next `times` copy attempts for `key` to fail transiently.
    pub fn fail_transient(&self, key: &ShardKey<K>, times: usize) {
        self.faults
            .lock()
            .entry(key.clone())
            .or_default()
            .extend(std::iter::repeat(ScriptedFault::Transient).take(times));
    }

    /// Script the next copy attempt for `key` to fail permanently.
    pub fn fail_permanent(&self, key: &ShardKey<K>) {
        self.faults
            .lock()
            .entry(key.clone())
            .or_default()
            .push_back(ScriptedFault::Permanent);
    }

    pub fn copy_attempts(&self, key: &ShardKey<K>) -> u32 {
        self.copy_attempts.lock().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl<K> DataMover<K> for InMemoryDataMover<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    async fn copy(&self, key_move: &KeyMove<K>) -> Result<(), MoveFault> {
        *self
            .copy_attempts
            .lock()
            .entry(key_move.key.clone())
            .or_insert(0) += 1;

        if let Some(fault) = self
            .faults
            .lock()
            .get_mut(&key_move.key)
            .and_then(VecDeque::pop_front)
        {
            return Err(scripted_error(fault, "copy"));
        }

        let value = self
            .store
            .get(&key_move.source, &key_move.key)
            .ok_or_else(|| {
                MoveFault::Permanent(
                    ShardError::new(ShardErrorKind::Migration, "source key missing")
                        .with_diagnostic(diag::PHASE, "copy")
                        .with_diagnostic(diag::SOURCE_SHARD_ID, &key_move.source)
                        .with_diagnostic(diag::TARGET_SHARD_ID, &key_move.target),
                )
            })?;
        // Overwrite semantics keep repeated copies idempotent.
        self.store
            .insert(&key_move.target, key_move.key.clone(), value);
        Ok(())
    }
}

impl<K> std::fmt::Debug for InMemoryDataMover<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDataMover").finish()
    }
}

/// Full equality: fetch both sides and compare bytes.
pub struct FullEqualityVerifier<K> {
    store: Arc<InMemoryShardSet<K>>,
}

impl<K> FullEqualityVerifier<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    pub fn new(store: Arc<InMemoryShardSet<K>>) -> Self {
        Self { store }
    }

    fn fetch_pair(&self, key_move: &KeyMove<K>) -> Result<(Vec<u8>, Vec<u8>), MoveFault> {
        let source = self
            .store
            .get(&key_move.source, &key_move.key)
            .ok_or_else(|| missing_side(key_move, "source"))?;
        let target = self
            .store
            .get(&key_move.target, &key_move.key)
            .ok_or_else(|| missing_side(key_move, "target"))?;
        Ok((source, target))
    }
}

fn missing_side<K>(key_move: &KeyMove<K>, side: &str) -> MoveFault {
    MoveFault::Permanent(
        ShardError::new(
            ShardErrorKind::Migration,
            format!("{side} value missing during verification"),
        )
        .with_diagnostic(diag::PHASE, "verify")
        .with_diagnostic(diag::SOURCE_SHARD_ID, &key_move.source)
        .with_diagnostic(diag::TARGET_SHARD_ID, &key_move.target),
    )
}

#[async_trait]
impl<K> VerificationStrategy<K> for FullEqualityVerifier<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    async fn verify(&self, key_move: &KeyMove<K>) -> Result<VerifyOutcome, MoveFault> {
        let (source, target) = self.fetch_pair(key_move)?;
        Ok(if source == target {
            VerifyOutcome::Equal
        } else {
            VerifyOutcome::Mismatch
        })
    }
}

impl<K> std::fmt::Debug for FullEqualityVerifier<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullEqualityVerifier").finish()
    }
}

/// Stable hash verification: FNV-1a over the canonical byte form of each
/// side. Cheaper than full equality when values are large; collisions are
/// the accepted trade (this is data verification, not cryptography).
pub struct StableHashVerifier<K> {
    store: Arc<InMemoryShardSet<K>>,
}

impl<K> StableHashVerifier<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    pub fn new(store: Arc<InMemoryShardSet<K>>) -> Self {
        Self { store }
    }

    pub fn digest(bytes: &[u8]) -> u64 {
        let mut hasher = FnvHasher::default();
        hasher.write(bytes);
        hasher.finish()
    }
}

#[async_trait]
impl<K> VerificationStrategy<K> for StableHashVerifier<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    async fn verify(&self, key_move: &KeyMove<K>) -> Result<VerifyOutcome, MoveFault> {
        let source = self
            .store
            .get(&key_move.source, &key_move.key)
            .ok_or_else(|| missing_side(key_move, "source"))?;
        let target = self
            .store
            .get(&key_move.target, &key_move.key)
            .ok_or_else(|| missing_side(key_move, "target"))?;
        Ok(if Self::digest(&source) == Self::digest(&target) {
            VerifyOutcome::Equal
        } else {
            VerifyOutcome::Mismatch
        })
    }
}

impl<K> std::fmt::Debug for StableHashVerifier<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StableHashVerifier").finish()
    }
}

/// Sample-then-escalate: most keys get the cheap strategy; a seeded
/// sample (and every cheap-path mismatch) escalates to the expensive one
/// before a verdict is returned.
pub struct SampleThenEscalateVerifier<K> {
    cheap: Arc<dyn VerificationStrategy<K>>,
    expensive: Arc<dyn VerificationStrategy<K>>,
    sample_rate: f64,
    rng: Mutex<StdRng>,
}

impl<K> SampleThenEscalateVerifier<K> {
    pub fn new(
        cheap: Arc<dyn VerificationStrategy<K>>,
        expensive: Arc<dyn VerificationStrategy<K>>,
        sample_rate: f64,
        seed: u64,
    ) -> Self {
        Self {
            cheap,
            expensive,
            sample_rate: sample_rate.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

#[async_trait]
impl<K> VerificationStrategy<K> for SampleThenEscalateVerifier<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    async fn verify(&self, key_move: &KeyMove<K>) -> Result<VerifyOutcome, MoveFault> {
        let sampled = self.rng.lock().random_bool(self.sample_rate);
        if sampled {
            return self.expensive.verify(key_move).await;
        }
        match self.cheap.verify(key_move).await? {
            VerifyOutcome::Equal => Ok(VerifyOutcome::Equal),
            // Never fail a key on the cheap path alone.
            VerifyOutcome::Mismatch => self.expensive.verify(key_move).await,
        }
    }
}

impl<K> std::fmt::Debug for SampleThenEscalateVerifier<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleThenEscalateVerifier")
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

/// Swapper backed by a shard map store: per-key CAS, idempotent for keys
/// already at their target. CAS conflicts are transient: a later run
/// (or retry) re-reads and converges.
pub struct StoreMapSwapper<K> {
    store: Arc<dyn ShardMapStore<K>>,
}

impl<K> StoreMapSwapper<K> {
    pub fn new(store: Arc<dyn ShardMapStore<K>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<K> MapSwapper<K> for StoreMapSwapper<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    async fn swap(&self, batch: &[KeyMove<K>]) -> Result<(), MoveFault> {
        self.store.swap(batch).map_err(MoveFault::Transient)
    }
}

impl<K> std::fmt::Debug for StoreMapSwapper<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreMapSwapper").finish()
    }
}

/// Wraps another swapper with a scripted fault sequence, consumed one
/// entry per `swap` call. Simulates partial batch failure for tests.
pub struct FaultInjectingSwapper<K> {
    inner: Arc<dyn MapSwapper<K>>,
    script: Mutex<VecDeque<ScriptedFault>>,
}

impl<K> FaultInjectingSwapper<K> {
    pub fn new(inner: Arc<dyn MapSwapper<K>>) -> Self {
        Self {
            inner,
            script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_fault(&self, fault: ScriptedFault) {
        self.script.lock().push_back(fault);
    }
}

#[async_trait]
impl<K> MapSwapper<K> for FaultInjectingSwapper<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    async fn swap(&self, batch: &[KeyMove<K>]) -> Result<(), MoveFault> {
        if let Some(fault) = self.script.lock().pop_front() {
            return Err(scripted_error(fault, "swap"));
        }
        self.inner.swap(batch).await
    }
}

impl<K> std::fmt::Debug for FaultInjectingSwapper<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjectingSwapper").finish()
    }
}
