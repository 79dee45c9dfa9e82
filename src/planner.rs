//! Computes new replica lists for a selection of partitions over a set of target brokers.
//!
//! Replicas are placed greedily, partition by partition in (topic, partition) order. Every slot goes to the target
//! broker with the fewest replicas assigned so far in this plan, which keeps all targets within one assignment of each
//! other. Ties prefer a failure domain the partition does not use yet, then a broker that already hosts the partition
//! (no data has to move), then the lowest broker id.
//!
//! When the targets span at least as many failure domains as a topic's replication factor, candidates are restricted
//! to failure domains the partition does not use yet, so every replica lands on a distinct rack.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::InputError;
use crate::plan::ReassignmentPlan;
use crate::selection::PartitionSelection;
use crate::topology::{BrokerId, FailureDomain, Partition, TopologySnapshot};

#[derive(Debug, Clone, Copy)]
pub struct AssignmentPlanner<'a> {
    snapshot: &'a TopologySnapshot,
}

impl<'a> AssignmentPlanner<'a> {
    pub fn new(snapshot: &'a TopologySnapshot) -> Self {
        Self { snapshot }
    }

    /// Check that a plan can be computed for `selection` over `targets`.
    ///
    /// Fails with [`InputError::InsufficientBrokers`] when fewer targets than the largest replication factor among
    /// the selected topics are given.
    pub fn validate(
        &self,
        selection: &PartitionSelection,
        targets: &[BrokerId],
    ) -> Result<(), InputError> {
        if targets.is_empty() {
            return Err(InputError::NoTargetBrokers);
        }

        let mut seen = BTreeSet::new();
        for id in targets {
            if !seen.insert(*id) {
                return Err(InputError::DuplicateTargetBroker(*id));
            }
            self.snapshot.broker(*id)?;
        }

        selection.validate(self.snapshot)?;

        let required = self.required_brokers(selection)?;
        if targets.len() < required {
            return Err(InputError::InsufficientBrokers {
                required,
                available: targets.len(),
            });
        }

        Ok(())
    }

    /// Largest replication factor among the selected topics.
    pub fn required_brokers(&self, selection: &PartitionSelection) -> Result<usize, InputError> {
        selection.topics().try_fold(0, |required, topic| {
            Ok(required.max(self.snapshot.topic(topic)?.replication_factor))
        })
    }

    /// Compute a plan covering exactly the selected partitions.
    pub fn plan(
        &self,
        selection: &PartitionSelection,
        targets: &[BrokerId],
    ) -> Result<ReassignmentPlan, InputError> {
        self.validate(selection, targets)?;

        let targets: Vec<BrokerId> = targets.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        let domains = self.snapshot.rack_count(&targets);
        let mut load = Load::new(&targets);
        let mut plan = ReassignmentPlan::new();

        for (topic_name, partition_id) in selection.iter() {
            let topic = self.snapshot.topic(topic_name)?;
            let partition = self.snapshot.partition(topic_name, partition_id)?;
            let rack_aware = domains >= topic.replication_factor;

            let replicas = self.assign(partition, topic.replication_factor, &targets, rack_aware, &mut load);
            plan.insert(topic_name, partition_id, replicas);
        }

        debug!(
            partitions = plan.len(),
            targets = targets.len(),
            domains,
            "Computed reassignment plan",
        );

        Ok(plan)
    }

    fn assign(
        &self,
        partition: &Partition,
        replication_factor: usize,
        targets: &[BrokerId],
        rack_aware: bool,
        load: &mut Load,
    ) -> Vec<BrokerId> {
        let current: BTreeSet<BrokerId> = partition
            .replicas
            .iter()
            .copied()
            .filter(|id| !partition.offline_replicas.contains(id))
            .collect();

        let mut chosen: Vec<BrokerId> = Vec::with_capacity(replication_factor);
        let mut used: BTreeSet<FailureDomain<'_>> = BTreeSet::new();

        for _ in 0..replication_factor {
            let candidates = targets.iter().copied().filter(|id| !chosen.contains(id));
            let fresh_domain = |id: &BrokerId| !used.contains(&self.snapshot.failure_domain(*id));

            let pick = if rack_aware && targets.iter().any(|id| !chosen.contains(id) && fresh_domain(id)) {
                candidates
                    .filter(fresh_domain)
                    .min_by_key(|id| (load.replicas(*id), !current.contains(id), *id))
            } else {
                candidates.min_by_key(|id| {
                    (
                        load.replicas(*id),
                        !fresh_domain(id),
                        !current.contains(id),
                        *id,
                    )
                })
            };

            let Some(id) = pick else { break };
            used.insert(self.snapshot.failure_domain(id));
            chosen.push(id);
        }

        let replicas = order_replicas(partition, chosen, load);
        load.record(&replicas);
        replicas
    }
}

/// Put the leader first.
///
/// A partition keeping its exact replica set keeps its order so it does not move at all. Otherwise the leader is
/// the chosen broker leading the fewest partitions so far, preferring the current leader.
fn order_replicas(partition: &Partition, mut chosen: Vec<BrokerId>, load: &Load) -> Vec<BrokerId> {
    let same_set = chosen.len() == partition.replicas.len()
        && chosen.iter().all(|id| partition.replicas.contains(id));
    if same_set {
        return partition.replicas.clone();
    }

    let leader = chosen
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| (load.leaders(**id), **id != partition.leader_id, **id))
        .map(|(idx, _)| idx);
    if let Some(idx) = leader {
        let id = chosen.remove(idx);
        chosen.insert(0, id);
    }
    chosen
}

/// Replica and leader assignments per target broker within one plan.
#[derive(Debug)]
struct Load {
    replicas: BTreeMap<BrokerId, usize>,
    leaders: BTreeMap<BrokerId, usize>,
}

impl Load {
    fn new(targets: &[BrokerId]) -> Self {
        Self {
            replicas: targets.iter().map(|id| (*id, 0)).collect(),
            leaders: targets.iter().map(|id| (*id, 0)).collect(),
        }
    }

    fn replicas(&self, id: BrokerId) -> usize {
        self.replicas.get(&id).copied().unwrap_or_default()
    }

    fn leaders(&self, id: BrokerId) -> usize {
        self.leaders.get(&id).copied().unwrap_or_default()
    }

    fn record(&mut self, replicas: &[BrokerId]) {
        for id in replicas {
            *self.replicas.entry(*id).or_default() += 1;
        }
        if let Some(leader) = replicas.first() {
            *self.leaders.entry(*leader).or_default() += 1;
        }
    }
}
