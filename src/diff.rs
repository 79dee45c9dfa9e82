//! Compares current and planned replica lists.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::NotFound;
use crate::plan::ReassignmentPlan;
use crate::selection::PartitionSelection;
use crate::topology::{BrokerId, PartitionId, TopologySnapshot};

/// What a plan changes for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveDelta {
    pub topic: String,
    pub partition: PartitionId,

    pub old_replicas: Vec<BrokerId>,
    pub new_replicas: Vec<BrokerId>,

    /// Brokers receiving a new replica, in new-replica order.
    pub added_brokers: Vec<BrokerId>,

    /// Brokers losing their replica, in old-replica order.
    pub removed_brokers: Vec<BrokerId>,

    pub leader_changed: bool,

    /// True if the replica list differs in length, order or membership.
    pub any_change: bool,

    pub moved_replica_count: usize,

    /// `moved_replica_count` times the replica size.
    pub estimated_bytes: u64,
}

impl MoveDelta {
    fn new(
        topic: &str,
        partition: PartitionId,
        old_replicas: &[BrokerId],
        new_replicas: &[BrokerId],
        replica_size: u64,
    ) -> Self {
        let added_brokers: Vec<BrokerId> = new_replicas
            .iter()
            .copied()
            .filter(|id| !old_replicas.contains(id))
            .collect();
        let removed_brokers: Vec<BrokerId> = old_replicas
            .iter()
            .copied()
            .filter(|id| !new_replicas.contains(id))
            .collect();
        let leader_changed = new_replicas.first() != old_replicas.first();
        let moved_replica_count = added_brokers.len();

        Self {
            topic: topic.to_string(),
            partition,
            old_replicas: old_replicas.to_vec(),
            new_replicas: new_replicas.to_vec(),
            added_brokers,
            removed_brokers,
            leader_changed,
            any_change: leader_changed || old_replicas != new_replicas,
            moved_replica_count,
            estimated_bytes: moved_replica_count as u64 * replica_size,
        }
    }
}

/// Compute the delta of every selected partition.
///
/// Selected partitions absent from `plan` are reported as unchanged.
pub fn compute_moved_replicas(
    selection: &PartitionSelection,
    plan: &ReassignmentPlan,
    snapshot: &TopologySnapshot,
) -> Result<Vec<MoveDelta>, NotFound> {
    selection
        .iter()
        .map(|(topic, partition_id)| {
            let partition = snapshot.partition(topic, partition_id)?;
            let new_replicas = plan
                .replicas(topic, partition_id)
                .unwrap_or(partition.replicas.as_slice());

            Ok(MoveDelta::new(
                topic,
                partition_id,
                &partition.replicas,
                new_replicas,
                partition.size_bytes,
            ))
        })
        .collect()
}

/// Return a copy of `plan` without partitions whose new replica list equals the current one.
///
/// Topics left without partitions are dropped. Partitions missing from `snapshot` or whose replica count drifted
/// from the plan are kept.
pub fn remove_redundant_reassignments(
    plan: &ReassignmentPlan,
    snapshot: &TopologySnapshot,
) -> ReassignmentPlan {
    let mut dropped = 0usize;
    let kept: ReassignmentPlan = plan
        .iter()
        .filter(|(topic, partition, replicas)| {
            let redundant = match snapshot.partition(topic, *partition) {
                Ok(current) => current.replicas.as_slice() == *replicas,
                Err(_) => false,
            };
            if redundant {
                dropped += 1;
            }
            !redundant
        })
        .map(|(topic, partition, replicas)| (topic, partition, replicas.to_vec()))
        .collect();

    if dropped > 0 {
        debug!(dropped, kept = kept.len(), "Removed redundant reassignments");
    }

    kept
}

/// Aggregate data movement of a set of deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveSummary {
    /// Partitions with any change.
    pub partitions: usize,
    pub moved_replicas: usize,
    pub leader_changes: usize,
    pub estimated_bytes: u64,

    /// Bytes each broker is expected to receive.
    pub inbound_bytes: BTreeMap<BrokerId, u64>,

    /// Bytes each broker is expected to serve, attributed to the current leader.
    pub outbound_bytes: BTreeMap<BrokerId, u64>,
}

impl MoveSummary {
    pub fn from_deltas<'a>(deltas: impl IntoIterator<Item = &'a MoveDelta>) -> Self {
        let mut summary = Self::default();

        for delta in deltas.into_iter().filter(|d| d.any_change) {
            summary.partitions += 1;
            summary.moved_replicas += delta.moved_replica_count;
            summary.estimated_bytes += delta.estimated_bytes;
            if delta.leader_changed {
                summary.leader_changes += 1;
            }

            if delta.moved_replica_count == 0 {
                continue;
            }
            let per_replica = delta.estimated_bytes / delta.moved_replica_count as u64;
            for id in &delta.added_brokers {
                *summary.inbound_bytes.entry(*id).or_default() += per_replica;
            }
            if let Some(source) = delta.old_replicas.first() {
                *summary.outbound_bytes.entry(*source).or_default() += delta.estimated_bytes;
            }
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    use crate::topology::{Broker, Partition, Topic};

    fn snapshot() -> TopologySnapshot {
        TopologySnapshot::new(
            (1..=5).map(|id| Broker::new(id, None)),
            [
                Topic::new(
                    "orders",
                    [
                        Partition::new(0, vec![1, 2, 3]).with_size(100),
                        Partition::new(1, vec![2, 3, 1]).with_size(200),
                    ],
                ),
                Topic::new("payments", [Partition::new(0, vec![1, 2, 3])]),
            ],
        )
    }

    #[test]
    fn test_single_replica_move() {
        let snapshot = snapshot();
        let selection: PartitionSelection = [("orders", 0)].into_iter().collect();
        let plan: ReassignmentPlan = [("orders", 0, vec![1, 2, 4])].into_iter().collect();

        let deltas = compute_moved_replicas(&selection, &plan, &snapshot).unwrap();

        assert_eq!(deltas.len(), 1);
        let delta = &deltas[0];
        assert_eq!(delta.added_brokers, vec![4]);
        assert_eq!(delta.removed_brokers, vec![3]);
        assert!(!delta.leader_changed);
        assert!(delta.any_change);
        assert_eq!(delta.moved_replica_count, 1);
        assert_eq!(delta.estimated_bytes, 100);
    }

    #[test]
    fn test_reorder_is_a_change_without_movement() {
        let snapshot = snapshot();
        let selection: PartitionSelection = [("orders", 1)].into_iter().collect();
        let plan: ReassignmentPlan = [("orders", 1, vec![3, 2, 1])].into_iter().collect();

        let delta = compute_moved_replicas(&selection, &plan, &snapshot).unwrap().remove(0);
        assert!(delta.leader_changed);
        assert!(delta.any_change);
        assert_eq!(delta.moved_replica_count, 0);
        assert_eq!(delta.estimated_bytes, 0);
    }

    #[test]
    fn test_unplanned_partition_is_unchanged() {
        let snapshot = snapshot();
        let selection: PartitionSelection = [("orders", 0)].into_iter().collect();

        let delta = compute_moved_replicas(&selection, &ReassignmentPlan::new(), &snapshot)
            .unwrap()
            .remove(0);
        assert!(!delta.any_change);
        assert!(delta.added_brokers.is_empty());
    }

    #[test]
    fn test_missing_partition() {
        let snapshot = snapshot();
        let selection: PartitionSelection = [("orders", 9)].into_iter().collect();
        assert_eq!(
            compute_moved_replicas(&selection, &ReassignmentPlan::new(), &snapshot).unwrap_err(),
            NotFound::partition("orders", 9)
        );
    }

    #[test]
    fn test_remove_redundant_drops_empty_topics() {
        let snapshot = snapshot();
        let plan: ReassignmentPlan = [
            ("orders", 0, vec![1, 2, 3]),
            ("orders", 1, vec![2, 3, 4]),
            ("payments", 0, vec![1, 2, 3]),
        ]
        .into_iter()
        .collect();

        let kept = remove_redundant_reassignments(&plan, &snapshot);

        assert_eq!(kept.len(), 1);
        assert_eq!(kept.replicas("orders", 1), Some(&[2, 3, 4][..]));
        assert_eq!(kept.topics().collect::<Vec<_>>(), vec!["orders"]);
        assert!(kept.partitions("payments").is_none());

        // input untouched
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn test_remove_redundant_keeps_drifted_partitions() {
        let snapshot = snapshot();
        let plan: ReassignmentPlan = [("orders", 0, vec![1, 2]), ("ghost", 0, vec![1])].into_iter().collect();

        assert_eq!(remove_redundant_reassignments(&plan, &snapshot), plan);
    }

    #[test]
    fn test_summary() {
        let snapshot = snapshot();
        let selection: PartitionSelection = [("orders", 0), ("orders", 1), ("payments", 0)].into_iter().collect();
        let plan: ReassignmentPlan = [
            ("orders", 0, vec![4, 5, 3]),
            ("orders", 1, vec![3, 2, 1]),
            ("payments", 0, vec![1, 2, 3]),
        ]
        .into_iter()
        .collect();

        let deltas = compute_moved_replicas(&selection, &plan, &snapshot).unwrap();
        let summary = MoveSummary::from_deltas(&deltas);

        assert_eq!(summary.partitions, 2);
        assert_eq!(summary.moved_replicas, 2);
        assert_eq!(summary.leader_changes, 2);
        assert_eq!(summary.estimated_bytes, 200);
        assert_eq!(summary.inbound_bytes, BTreeMap::from([(4, 100), (5, 100)]));
        assert_eq!(summary.outbound_bytes, BTreeMap::from([(1, 200)]));
    }

    fn arb_replicas() -> impl Strategy<Value = Vec<BrokerId>> {
        prop::sample::subsequence((1..=6).collect::<Vec<BrokerId>>(), 1..=4).prop_shuffle()
    }

    proptest! {
        #[test]
        fn test_redundancy_removal_is_idempotent(
            current in prop::collection::vec(arb_replicas(), 1..6),
            planned in prop::collection::vec(arb_replicas(), 1..6),
        ) {
            let snapshot = TopologySnapshot::new(
                (1..=6).map(|id| Broker::new(id, None)),
                [Topic::new(
                    "t",
                    current.iter().enumerate().map(|(p, r)| Partition::new(p as i32, r.clone())),
                )],
            );
            let plan: ReassignmentPlan = planned
                .iter()
                .enumerate()
                .map(|(p, r)| ("t", p as i32, r.clone()))
                .collect();

            let once = remove_redundant_reassignments(&plan, &snapshot);
            let twice = remove_redundant_reassignments(&once, &snapshot);
            prop_assert_eq!(&once, &twice);

            // kept partitions are untouched
            for (topic, partition, replicas) in once.iter() {
                prop_assert_eq!(plan.replicas(topic, partition), Some(replicas));
            }
        }

        #[test]
        fn test_equal_length_moves_are_symmetric(old in arb_replicas(), new in arb_replicas()) {
            let delta = MoveDelta::new("t", 0, &old, &new, 1);
            if old.len() == new.len() {
                prop_assert_eq!(delta.added_brokers.len(), delta.removed_brokers.len());
            }
            prop_assert_eq!(delta.any_change, old != new);
        }
    }
}
