// Pluggable migration collaborators. The executor owns scheduling and
// the state machine; movers, verifiers and swappers own the actual data
// and classify their own failures as transient or permanent.

use async_trait::async_trait;

use crate::core::KeyMove;
use crate::error::ShardError;

/// Failure classification used by the executor's retry policy: transient
/// failures (timeouts, network, write conflicts) are retried with
/// exponential backoff; everything else is permanent.
#[derive(Debug)]
pub enum MoveFault {
    Transient(ShardError),
    Permanent(ShardError),
}

impl MoveFault {
    pub fn transient(err: ShardError) -> Self {
        MoveFault::Transient(err)
    }

    pub fn permanent(err: ShardError) -> Self {
        MoveFault::Permanent(err)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, MoveFault::Transient(_))
    }

    pub fn into_error(self) -> ShardError {
        match self {
            MoveFault::Transient(err) | MoveFault::Permanent(err) => err,
        }
    }
}

/// Verification result for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Equal,
    /// Source and target differ. Permanent unless the executor is
    /// configured to force the swap through.
    Mismatch,
}

/// Copies one key's data from its source shard to its target shard.
///
/// Must be idempotent: repeating `copy` for an already-copied key leaves
/// the target equivalent.
#[async_trait]
pub trait DataMover<K>: Send + Sync {
    async fn copy(&self, key_move: &KeyMove<K>) -> Result<(), MoveFault>;
}

/// Checks that a copied key's target data matches its source.
#[async_trait]
pub trait VerificationStrategy<K>: Send + Sync {
    async fn verify(&self, key_move: &KeyMove<K>) -> Result<VerifyOutcome, MoveFault>;
}

/// Applies the authoritative mapping change for a batch of verified keys.
///
/// Atomicity is per key, never per batch: implementations that cannot do
/// a multi-key atomic swap apply an independent compare-and-set per key,
/// and a partially applied batch is valid iff every applied key is done.
#[async_trait]
pub trait MapSwapper<K>: Send + Sync {
    async fn swap(&self, batch: &[KeyMove<K>]) -> Result<(), MoveFault>;
}
