//! Replication throttles scoped to the replicas a reassignment moves.
//!
//! Applying a throttle is two strictly sequential phases: first the leader/follower byte rate on every broker, then
//! the per-topic lists of throttled `partition:broker` pairs. Resetting runs the mirror image with deletions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::client::{AlterConfigsRequest, ClusterControl, ConfigEntry, ConfigOp, ConfigResource};
use crate::error::{FailedResource, InputError, NotFound, PartialApplyError, Result};
use crate::plan::ReassignmentPlan;
use crate::topology::{BrokerId, PartitionId, TopologySnapshot};
use crate::tracker::ReassignmentState;

/// Broker-scoped leader replication rate in bytes/sec.
pub const LEADER_THROTTLED_RATE: &str = "leader.replication.throttled.rate";

/// Broker-scoped follower replication rate in bytes/sec.
pub const FOLLOWER_THROTTLED_RATE: &str = "follower.replication.throttled.rate";

/// Topic-scoped list of throttled leader replicas.
pub const LEADER_THROTTLED_REPLICAS: &str = "leader.replication.throttled.replicas";

/// Topic-scoped list of throttled follower replicas.
pub const FOLLOWER_THROTTLED_REPLICAS: &str = "follower.replication.throttled.replicas";

/// A `partitionId:brokerId` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThrottledReplica {
    pub partition: PartitionId,
    pub broker: BrokerId,
}

impl ThrottledReplica {
    pub fn new(partition: PartitionId, broker: BrokerId) -> Self {
        Self { partition, broker }
    }
}

impl Display for ThrottledReplica {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.partition, self.broker)
    }
}

impl FromStr for ThrottledReplica {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (partition, broker) = s.split_once(':').unwrap_or((s, ""));
        Ok(Self {
            partition: partition.trim().parse()?,
            broker: broker.trim().parse()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicThrottle {
    /// Every replica that may serve the copy.
    pub leader_replicas: BTreeSet<ThrottledReplica>,

    /// Only replicas that are brand-new to their partition.
    pub follower_replicas: BTreeSet<ThrottledReplica>,
}

/// Throttle scope of a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThrottleSpec {
    pub topics: BTreeMap<String, TopicThrottle>,
}

impl ThrottleSpec {
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn topic_names(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    /// Brokers acting as a source or a destination of any moved replica.
    pub fn participating_brokers(&self) -> BTreeSet<BrokerId> {
        self.topics
            .values()
            .flat_map(|t| t.leader_replicas.iter().chain(&t.follower_replicas))
            .map(|r| r.broker)
            .collect()
    }
}

/// Compute the throttle scope of every partition `plan` changes.
pub fn compute_throttle_spec(
    plan: &ReassignmentPlan,
    snapshot: &TopologySnapshot,
) -> Result<ThrottleSpec, NotFound> {
    let mut spec = ThrottleSpec::default();

    for (topic, partition_id, new_replicas) in plan.iter() {
        let old_replicas = &snapshot.partition(topic, partition_id)?.replicas;
        if old_replicas.as_slice() == new_replicas {
            continue;
        }

        let throttle = spec.topics.entry(topic.to_string()).or_default();
        throttle.leader_replicas.extend(
            old_replicas
                .iter()
                .map(|broker| ThrottledReplica::new(partition_id, *broker)),
        );
        throttle.follower_replicas.extend(
            new_replicas
                .iter()
                .filter(|broker| !old_replicas.contains(broker))
                .map(|broker| ThrottledReplica::new(partition_id, *broker)),
        );
    }

    Ok(spec)
}

/// Comma-joined `partitionId:brokerId` list.
pub fn format_throttled_replicas<'a>(replicas: impl IntoIterator<Item = &'a ThrottledReplica>) -> String {
    replicas
        .into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parsed value of a `*.replication.throttled.replicas` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottledReplicas {
    /// `*`: every replica of the topic.
    All,
    Listed(BTreeSet<ThrottledReplica>),
}

impl ThrottledReplicas {
    /// Parse a config value. Malformed entries are skipped.
    pub fn parse(value: &str) -> Self {
        if value.trim() == "*" {
            return Self::All;
        }

        Self::Listed(
            value
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .filter_map(|entry| match entry.parse() {
                    Ok(replica) => Some(replica),
                    Err(_) => {
                        debug!(entry, "Skipping malformed throttled replica");
                        None
                    }
                })
                .collect(),
        )
    }

    pub fn contains(&self, replica: &ThrottledReplica) -> bool {
        match self {
            Self::All => true,
            Self::Listed(replicas) => replicas.contains(replica),
        }
    }
}

/// Whether any in-flight replica of `state` is covered by the topic's throttle config.
///
/// Sources of a moving partition are matched against the leader list, replicas being added against the follower
/// list.
pub fn is_throttled(config: &[ConfigEntry], state: &ReassignmentState) -> bool {
    let lookup = |key: &str| {
        config
            .iter()
            .find(|e| e.name == key)
            .and_then(|e| e.value.as_deref())
            .map(ThrottledReplicas::parse)
    };
    let leaders = lookup(LEADER_THROTTLED_REPLICAS);
    let followers = lookup(FOLLOWER_THROTTLED_REPLICAS);

    state.partitions.iter().any(|(partition, in_flight)| {
        let sources = in_flight
            .replicas
            .iter()
            .filter(|b| !in_flight.adding_replicas.contains(b));
        let leader_hit = leaders.as_ref().map_or(false, |list| {
            sources
                .into_iter()
                .any(|b| list.contains(&ThrottledReplica::new(*partition, *b)))
        });
        let follower_hit = followers.as_ref().map_or(false, |list| {
            in_flight
                .adding_replicas
                .iter()
                .any(|b| list.contains(&ThrottledReplica::new(*partition, *b)))
        });

        leader_hit || follower_hit
    })
}

/// Applies and reverts throttle configuration on the cluster.
#[derive(Debug, Clone)]
pub struct ThrottleController {
    client: Arc<dyn ClusterControl>,
}

/// A rate of 0 would stop replication altogether.
pub(crate) fn check_rate(max_bytes_per_sec: u64) -> Result<(), InputError> {
    if max_bytes_per_sec == 0 {
        return Err(InputError::InvalidThrottleRate);
    }
    Ok(())
}

impl ThrottleController {
    pub fn new(client: Arc<dyn ClusterControl>) -> Self {
        Self { client }
    }

    /// Throttle replication of the replicas in `spec` to `max_bytes_per_sec` on every broker in the cluster.
    pub async fn apply(&self, spec: &ThrottleSpec, max_bytes_per_sec: u64) -> Result<()> {
        check_rate(max_bytes_per_sec)?;
        let brokers = self.cluster_brokers().await?;
        self.apply_to_brokers(spec, &brokers, max_bytes_per_sec).await
    }

    /// Ids of every broker currently in the cluster.
    pub async fn cluster_brokers(&self) -> Result<Vec<BrokerId>> {
        let brokers = self.client.describe_cluster().await?;
        Ok(brokers.into_iter().map(|b| b.node_id).collect())
    }

    /// Throttle replication of the replicas in `spec` to `max_bytes_per_sec`, setting the rates on `brokers`.
    ///
    /// The broker-rate phase must succeed before topic scoping starts. Config applied by a phase that succeeded stays
    /// in place when a later phase fails.
    pub async fn apply_to_brokers(
        &self,
        spec: &ThrottleSpec,
        brokers: &[BrokerId],
        max_bytes_per_sec: u64,
    ) -> Result<()> {
        check_rate(max_bytes_per_sec)?;

        let rate = max_bytes_per_sec.to_string();
        let broker_requests = brokers
            .iter()
            .map(|broker| AlterConfigsRequest {
                resource: ConfigResource::Broker(*broker),
                ops: vec![
                    ConfigOp::set(LEADER_THROTTLED_RATE, rate.clone()),
                    ConfigOp::set(FOLLOWER_THROTTLED_RATE, rate.clone()),
                ],
            })
            .collect();

        let failed = self.alter(broker_requests).await;
        if !failed.is_empty() {
            return Err(PartialApplyError { failed }.into());
        }
        info!(
            brokers = brokers.len(),
            max_bytes_per_sec,
            "Applied broker replication throttle",
        );

        let topic_requests = spec
            .topics
            .iter()
            .map(|(topic, throttle)| {
                let mut ops = vec![];
                if !throttle.leader_replicas.is_empty() {
                    ops.push(ConfigOp::set(
                        LEADER_THROTTLED_REPLICAS,
                        format_throttled_replicas(&throttle.leader_replicas),
                    ));
                }
                if !throttle.follower_replicas.is_empty() {
                    ops.push(ConfigOp::set(
                        FOLLOWER_THROTTLED_REPLICAS,
                        format_throttled_replicas(&throttle.follower_replicas),
                    ));
                }
                AlterConfigsRequest {
                    resource: ConfigResource::Topic(topic.clone()),
                    ops,
                }
            })
            .filter(|r| !r.ops.is_empty())
            .collect::<Vec<_>>();

        if topic_requests.is_empty() {
            return Ok(());
        }

        let topics = topic_requests.len();
        let failed = self.alter(topic_requests).await;
        if !failed.is_empty() {
            return Err(PartialApplyError { failed }.into());
        }
        info!(topics, "Applied topic replication throttle");

        Ok(())
    }

    /// Remove throttle config from `topics` and then from `brokers`.
    ///
    /// Both phases always run; failures are collected and reported together.
    pub async fn reset(&self, topics: &[String], brokers: &[BrokerId]) -> Result<(), PartialApplyError> {
        let topic_requests = topics
            .iter()
            .map(|topic| AlterConfigsRequest {
                resource: ConfigResource::Topic(topic.clone()),
                ops: vec![
                    ConfigOp::delete(LEADER_THROTTLED_REPLICAS),
                    ConfigOp::delete(FOLLOWER_THROTTLED_REPLICAS),
                ],
            })
            .collect::<Vec<_>>();
        let broker_requests = brokers
            .iter()
            .map(|broker| AlterConfigsRequest {
                resource: ConfigResource::Broker(*broker),
                ops: vec![
                    ConfigOp::delete(LEADER_THROTTLED_RATE),
                    ConfigOp::delete(FOLLOWER_THROTTLED_RATE),
                ],
            })
            .collect::<Vec<_>>();

        let mut failed = vec![];
        if !topic_requests.is_empty() {
            failed.extend(self.alter(topic_requests).await);
        }
        if !broker_requests.is_empty() {
            failed.extend(self.alter(broker_requests).await);
        }

        if failed.is_empty() {
            info!(
                topics = topics.len(),
                brokers = brokers.len(),
                "Removed replication throttle",
            );
            Ok(())
        } else {
            Err(PartialApplyError { failed })
        }
    }

    /// Send one batch of config patches and return the resources that were not updated.
    async fn alter(&self, requests: Vec<AlterConfigsRequest>) -> Vec<FailedResource> {
        let resources: Vec<ConfigResource> = requests.iter().map(|r| r.resource.clone()).collect();

        let failed: Vec<FailedResource> = match self.client.alter_configs(requests).await {
            Ok(results) => {
                let mut returned = BTreeSet::new();
                let mut failed = vec![];
                for r in results {
                    returned.insert(r.resource.clone());
                    if let Some(message) = r.error {
                        failed.push(FailedResource {
                            resource: r.resource,
                            message,
                        });
                    }
                }

                // a patch without a result cannot be assumed applied
                failed.extend(
                    resources
                        .into_iter()
                        .filter(|resource| !returned.contains(resource))
                        .map(|resource| FailedResource {
                            resource,
                            message: "no result returned".to_string(),
                        }),
                );
                failed
            }
            Err(e) => resources
                .into_iter()
                .map(|resource| FailedResource {
                    resource,
                    message: e.to_string(),
                })
                .collect(),
        };

        for f in &failed {
            warn!(resource=%f.resource, error=%f.message, "Throttle config update failed");
        }

        failed
    }
}
