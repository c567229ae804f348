// Migration plan: an immutable, deterministically ordered list of key
// moves identified by a stable plan id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::KeyMove;

/// Immutable after creation. The plan id is the resume handle: executing
/// the same plan id against the same checkpoint store continues where the
/// previous run stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan<K> {
    pub plan_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub moves: Vec<KeyMove<K>>,
}

impl<K> MigrationPlan<K> {
    pub fn new(moves: Vec<KeyMove<K>>) -> Self {
        Self {
            plan_id: Uuid::new_v4(),
            created_at: Utc::now(),
            moves,
        }
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }
}

/// Dry-run output: what a plan would contain, without allocating it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanStats {
    /// Keys inspected in the `from` snapshot.
    pub examined: usize,
    /// Keys whose assignment differs between the snapshots.
    pub moves: usize,
}
