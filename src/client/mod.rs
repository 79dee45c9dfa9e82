//! The cluster-control surface the reassignment core plans for and observes.
//!
//! Transport is not part of this crate: anything that can answer the requests of [`ClusterControl`] (a Kafka admin
//! client, a REST gateway, the [`memory::InMemoryCluster`] double) can drive planning, throttling and tracking.

use std::fmt::{Debug, Display, Formatter};

use async_trait::async_trait;

pub mod error;
pub mod memory;

use crate::topology::{BrokerId, PartitionId};
use error::Result;

/// A broker as reported by `DescribeCluster`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMetadata {
    /// The broker ID.
    pub node_id: BrokerId,

    /// The broker hostname.
    pub host: String,

    /// The broker port.
    pub port: i32,

    /// The rack of the broker, or `None` if it has not been assigned to a rack.
    pub rack: Option<String>,
}

/// A topic as reported by `DescribeTopics`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    /// The topic name.
    pub name: String,

    /// True if the topic is internal.
    pub is_internal: bool,

    /// Each partition in the topic.
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    /// The partition index.
    pub partition_index: PartitionId,

    /// The ID of the leader broker.
    pub leader_id: BrokerId,

    /// The set of all nodes that host this partition, preferred leader first.
    pub replica_nodes: Vec<BrokerId>,

    /// The set of offline replicas of this partition.
    pub offline_replicas: Vec<BrokerId>,
}

/// On-disk size of one replica as reported by `DescribeLogDirs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaLogDir {
    pub broker_id: BrokerId,
    pub topic: String,
    pub partition: PartitionId,
    pub size_bytes: u64,
}

/// One entry of an `AlterPartitionReassignments` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassignmentRequest {
    pub topic: String,
    pub partition: PartitionId,

    /// The replicas to place the partition on, or `None` to cancel a pending reassignment.
    pub replicas: Option<Vec<BrokerId>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassignmentResult {
    pub topic: String,
    pub partition: PartitionId,

    /// The error message, or `None` if the partition was accepted.
    pub error: Option<String>,
}

/// An in-flight reassignment as reported by `ListPartitionReassignments`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OngoingReassignment {
    pub topic: String,
    pub partition: PartitionId,

    /// The current replica set.
    pub replicas: Vec<BrokerId>,

    /// The set of replicas we are currently adding.
    pub adding_replicas: Vec<BrokerId>,

    /// The set of replicas we are currently removing.
    pub removing_replicas: Vec<BrokerId>,
}

/// Error code returned when cancelling a partition that has no reassignment in flight.
pub const NO_REASSIGNMENT_IN_PROGRESS: &str = "NO_REASSIGNMENT_IN_PROGRESS";

/// The target of an `AlterConfigs` patch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConfigResource {
    Broker(BrokerId),
    Topic(String),
}

impl Display for ConfigResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Broker(id) => write!(f, "broker {id}"),
            Self::Topic(name) => write!(f, "topic '{name}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOp {
    Set { key: String, value: String },

    /// Removes the key. Deleting an absent key is a no-op.
    Delete { key: String },
}

impl ConfigOp {
    pub fn set(key: &str, value: impl Into<String>) -> Self {
        Self::Set {
            key: key.to_string(),
            value: value.into(),
        }
    }

    pub fn delete(key: &str) -> Self {
        Self::Delete {
            key: key.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlterConfigsRequest {
    pub resource: ConfigResource,
    pub ops: Vec<ConfigOp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlterConfigsResult {
    pub resource: ConfigResource,

    /// The error message, or `None` if the patch was applied.
    pub error: Option<String>,
}

/// A config key of a topic as reported by `DescribeConfigs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub name: String,
    pub value: Option<String>,
}

/// Operations consumed from the cluster-control collaborator.
#[async_trait]
pub trait ClusterControl: Debug + Send + Sync {
    async fn describe_cluster(&self) -> Result<Vec<BrokerMetadata>>;

    async fn describe_topics(&self) -> Result<Vec<TopicMetadata>>;

    async fn describe_log_dirs(&self) -> Result<Vec<ReplicaLogDir>>;

    /// Submit reassignments. A request with `replicas = None` cancels the pending reassignment of that partition.
    async fn alter_partition_reassignments(
        &self,
        requests: Vec<ReassignmentRequest>,
    ) -> Result<Vec<ReassignmentResult>>;

    async fn list_partition_reassignments(&self) -> Result<Vec<OngoingReassignment>>;

    async fn alter_configs(
        &self,
        requests: Vec<AlterConfigsRequest>,
    ) -> Result<Vec<AlterConfigsResult>>;

    async fn describe_topic_config(&self, topic: &str) -> Result<Vec<ConfigEntry>>;
}
