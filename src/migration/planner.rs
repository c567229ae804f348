// Migration planner: diff two topology snapshots into an ordered plan.
// Ordering is (source shard, target shard, stable key hash), so the same
// pair of snapshots always yields the same plan on any machine.

use std::hash::Hash;

use tracing::info;

use crate::core::{KeyBytes, KeyMove, ShardId, ShardKey, TopologySnapshot};
use crate::hashing::stable_key_hash;
use crate::migration::plan::{MigrationPlan, PlanStats};

#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationPlanner;

impl MigrationPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Plan the moves that take `from` to `to`.
    ///
    /// Keys only present in one snapshot are ignored: removal is the
    /// host's concern and provisioning is not rebalancing.
    pub fn plan<K>(
        &self,
        from: &TopologySnapshot<K>,
        to: &TopologySnapshot<K>,
    ) -> MigrationPlan<K>
    where
        K: KeyBytes + Clone + Eq + Hash,
    {
        let moves = self.collect_moves(from.iter().map(|(k, s)| (k.clone(), s.clone())), to);
        let plan = MigrationPlan::new(moves);
        info!(
            plan_id = %plan.plan_id,
            examined = from.key_count(),
            moves = plan.len(),
            "migration plan created"
        );
        plan
    }

    /// Segmented variant: consumes `from` as a lazy enumeration in
    /// `segment_size` chunks instead of holding the whole snapshot. The
    /// move ordering is identical to `plan`.
    pub fn plan_segmented<K, I>(
        &self,
        from: I,
        to: &TopologySnapshot<K>,
        segment_size: usize,
    ) -> MigrationPlan<K>
    where
        K: KeyBytes + Clone + Eq + Hash,
        I: IntoIterator<Item = (ShardKey<K>, ShardId)>,
    {
        let segment_size = segment_size.max(1);
        let mut moves = Vec::new();
        let mut segment = Vec::with_capacity(segment_size);
        for entry in from {
            segment.push(entry);
            if segment.len() == segment_size {
                moves.extend(self.collect_moves(segment.drain(..), to));
            }
        }
        if !segment.is_empty() {
            moves.extend(self.collect_moves(segment.drain(..), to));
        }
        Self::sort_moves(&mut moves);
        MigrationPlan::new(moves)
    }

    /// Count-only mode: no move list is allocated.
    pub fn dry_run<K>(&self, from: &TopologySnapshot<K>, to: &TopologySnapshot<K>) -> PlanStats
    where
        K: Clone + Eq + Hash,
    {
        let mut stats = PlanStats::default();
        for (key, source) in from.iter() {
            stats.examined += 1;
            if let Some(target) = to.assignment(key) {
                if target != source {
                    stats.moves += 1;
                }
            }
        }
        stats
    }

    fn collect_moves<K>(
        &self,
        from: impl Iterator<Item = (ShardKey<K>, ShardId)>,
        to: &TopologySnapshot<K>,
    ) -> Vec<KeyMove<K>>
    where
        K: KeyBytes + Clone + Eq + Hash,
    {
        let mut moves: Vec<KeyMove<K>> = from
            .filter_map(|(key, source)| {
                let target = to.assignment(&key)?;
                if *target == source {
                    return None;
                }
                Some(KeyMove {
                    key,
                    source,
                    target: target.clone(),
                })
            })
            .collect();
        Self::sort_moves(&mut moves);
        moves
    }

    fn sort_moves<K: KeyBytes>(moves: &mut [KeyMove<K>]) {
        moves.sort_by(|a, b| {
            a.source
                .cmp(&b.source)
                .then_with(|| a.target.cmp(&b.target))
                .then_with(|| {
                    stable_key_hash(&a.key.key_bytes()).cmp(&stable_key_hash(&b.key.key_bytes()))
                })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> ShardKey<String> {
        ShardKey::new(s.to_string())
    }

    fn snapshot(entries: &[(&str, &str)], shards: &[&str]) -> TopologySnapshot<String> {
        TopologySnapshot::new(
            0,
            entries
                .iter()
                .map(|(k, s)| (key(k), ShardId::new(*s))),
            shards.iter().map(|s| ShardId::new(*s)),
        )
    }

    #[test]
    fn plans_only_reassigned_keys() {
        let from = snapshot(
            &[("a", "s1"), ("b", "s1"), ("c", "s2"), ("gone", "s1")],
            &["s1", "s2"],
        );
        let to = snapshot(
            &[("a", "s2"), ("b", "s1"), ("c", "s2"), ("new", "s2")],
            &["s1", "s2"],
        );

        let plan = MigrationPlanner::new().plan(&from, &to);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.moves[0].key, key("a"));
        assert_eq!(plan.moves[0].source, ShardId::new("s1"));
        assert_eq!(plan.moves[0].target, ShardId::new("s2"));
    }

    #[test]
    fn move_ordering_is_deterministic() {
        let entries: Vec<(String, String)> = (0..200)
            .map(|i| (format!("k{i}"), "s1".to_string()))
            .collect();
        let from = TopologySnapshot::new(
            0,
            entries
                .iter()
                .map(|(k, s)| (ShardKey::new(k.clone()), ShardId::new(s.clone()))),
            [ShardId::new("s1")],
        );
        let to = TopologySnapshot::new(
            1,
            entries
                .iter()
                .map(|(k, _)| (ShardKey::new(k.clone()), ShardId::new("s2"))),
            [ShardId::new("s2")],
        );

        let planner = MigrationPlanner::new();
        let a = planner.plan(&from, &to);
        let b = planner.plan(&from, &to);
        assert_eq!(a.moves, b.moves);
        assert_ne!(a.plan_id, b.plan_id);
    }

    #[test]
    fn segmented_plan_matches_full_plan() {
        let entries: Vec<(ShardKey<String>, ShardId)> = (0..57)
            .map(|i| (key(&format!("k{i}")), ShardId::new("s1")))
            .collect();
        let from = TopologySnapshot::new(0, entries.clone(), [ShardId::new("s1")]);
        let to = TopologySnapshot::new(
            1,
            entries
                .iter()
                .map(|(k, _)| (k.clone(), ShardId::new("s2"))),
            [ShardId::new("s2")],
        );

        let planner = MigrationPlanner::new();
        let full = planner.plan(&from, &to);
        let segmented = planner.plan_segmented(entries, &to, 10);
        assert_eq!(full.moves, segmented.moves);
    }

    #[test]
    fn dry_run_counts_without_allocating_moves() {
        let from = snapshot(&[("a", "s1"), ("b", "s2"), ("c", "s1")], &["s1", "s2"]);
        let to = snapshot(&[("a", "s2"), ("b", "s2"), ("c", "s2")], &["s2"]);

        let stats = MigrationPlanner::new().dry_run(&from, &to);
        assert_eq!(stats.examined, 3);
        assert_eq!(stats.moves, 2);
    }
}
