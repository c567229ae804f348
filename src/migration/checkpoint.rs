// Per-key migration state and the durable checkpoint that makes a run
// resumable. Checkpoints are replaced wholesale; the executor is the sole
// writer for a plan id during a run.

use std::collections::HashMap;
use std::hash::Hash;
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::core::ShardKey;
use crate::error::{diag, ShardError, ShardErrorKind, ShardResult};

/// Per-key migration state. Progression is strictly monotonic; Done and
/// Failed are terminal and Failed is the only alternative exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyMoveState {
    Planned,
    Copying,
    Copied,
    Verifying,
    Verified,
    Swapping,
    Done,
    Failed,
}

impl KeyMoveState {
    /// Position in the forward progression. Failed sits outside the
    /// happy path and compares as terminal.
    pub fn rank(&self) -> u8 {
        match self {
            KeyMoveState::Planned => 0,
            KeyMoveState::Copying => 1,
            KeyMoveState::Copied => 2,
            KeyMoveState::Verifying => 3,
            KeyMoveState::Verified => 4,
            KeyMoveState::Swapping => 5,
            KeyMoveState::Done => 6,
            KeyMoveState::Failed => 7,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, KeyMoveState::Done | KeyMoveState::Failed)
    }

    /// Whether `next` is a legal forward step from `self`. Re-entering
    /// the same non-terminal state is allowed (transient retries).
    pub fn can_advance_to(&self, next: KeyMoveState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == KeyMoveState::Failed {
            return true;
        }
        next.rank() >= self.rank()
    }
}

/// Durable snapshot of a run's per-key states.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize + Eq + Hash",
    deserialize = "K: DeserializeOwned + Eq + Hash"
))]
pub struct Checkpoint<K: Eq + Hash> {
    pub plan_id: Uuid,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub states: HashMap<ShardKey<K>, KeyMoveState>,
    pub last_processed_index: usize,
}

impl<K: Clone + Eq + Hash> Checkpoint<K> {
    pub fn new(plan_id: Uuid) -> Self {
        Self {
            plan_id,
            version: 0,
            updated_at: Utc::now(),
            states: HashMap::new(),
            last_processed_index: 0,
        }
    }
}

/// Durable store for checkpoints, keyed by plan id. Persist is
/// all-or-nothing; overwrites are last-writer-wins. Both boundaries take
/// defensive copies so neither side can alias the other's state.
#[async_trait]
pub trait CheckpointStore<K: Eq + Hash>: Send + Sync {
    async fn load(&self, plan_id: Uuid) -> ShardResult<Option<Checkpoint<K>>>;
    async fn persist(&self, checkpoint: &Checkpoint<K>) -> ShardResult<()>;
}

/// In-memory store for tests and single-process hosts.
#[derive(Debug)]
pub struct InMemoryCheckpointStore<K: Eq + Hash> {
    checkpoints: Mutex<HashMap<Uuid, Checkpoint<K>>>,
}

impl<K: Eq + Hash> InMemoryCheckpointStore<K> {
    pub fn new() -> Self {
        Self {
            checkpoints: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash> Default for InMemoryCheckpointStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K> CheckpointStore<K> for InMemoryCheckpointStore<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    async fn load(&self, plan_id: Uuid) -> ShardResult<Option<Checkpoint<K>>> {
        // Clone out: callers get their own copy, not a shared alias.
        Ok(self.checkpoints.lock().get(&plan_id).cloned())
    }

    async fn persist(&self, checkpoint: &Checkpoint<K>) -> ShardResult<()> {
        self.checkpoints
            .lock()
            .insert(checkpoint.plan_id, checkpoint.clone());
        Ok(())
    }
}

/// File-backed store: one JSON document per plan id, written to a temp
/// file and renamed into place so a crash mid-write never leaves a torn
/// checkpoint behind.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> ShardResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            ShardError::new(
                ShardErrorKind::Store,
                format!("failed to create checkpoint directory: {e}"),
            )
            .with_diagnostic(diag::OPERATION, "create_dir")
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, plan_id: Uuid) -> PathBuf {
        self.dir.join(format!("{plan_id}.json"))
    }
}

#[async_trait]
impl<K> CheckpointStore<K> for FileCheckpointStore
where
    K: Clone + Eq + Hash + Send + Sync + Serialize + DeserializeOwned,
{
    async fn load(&self, plan_id: Uuid) -> ShardResult<Option<Checkpoint<K>>> {
        let path = self.path_for(plan_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).map_err(|e| {
            ShardError::new(ShardErrorKind::Store, format!("failed to read checkpoint: {e}"))
                .with_diagnostic(diag::OPERATION, "load")
                .with_diagnostic(diag::PLAN_ID, plan_id)
        })?;
        let checkpoint = serde_json::from_slice(&bytes).map_err(|e| {
            ShardError::new(
                ShardErrorKind::Store,
                format!("failed to decode checkpoint: {e}"),
            )
            .with_diagnostic(diag::OPERATION, "load")
            .with_diagnostic(diag::PLAN_ID, plan_id)
        })?;
        Ok(Some(checkpoint))
    }

    async fn persist(&self, checkpoint: &Checkpoint<K>) -> ShardResult<()> {
        let path = self.path_for(checkpoint.plan_id);
        let tmp = self.dir.join(format!("{}.json.tmp", checkpoint.plan_id));
        let bytes = serde_json::to_vec(checkpoint).map_err(|e| {
            ShardError::new(
                ShardErrorKind::Store,
                format!("failed to encode checkpoint: {e}"),
            )
            .with_diagnostic(diag::OPERATION, "persist")
            .with_diagnostic(diag::PLAN_ID, checkpoint.plan_id)
        })?;
        let io_err = |e: std::io::Error| {
            ShardError::new(
                ShardErrorKind::Store,
                format!("failed to write checkpoint: {e}"),
            )
            .with_diagnostic(diag::OPERATION, "persist")
            .with_diagnostic(diag::PLAN_ID, checkpoint.plan_id)
        };
        let mut file = std::fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        std::fs::rename(&tmp, &path).map_err(io_err)?;
        debug!(plan_id = %checkpoint.plan_id, version = checkpoint.version, "checkpoint persisted");
        Ok(())
    }
}
