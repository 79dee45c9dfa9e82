//! Reassignment plans and their wire format.
//!
//! On the wire a plan reads
//!
//! ```json
//! { "topics": [{ "topicName": "orders", "partitions": [{ "partitionId": 0, "replicas": [1, 2, 3] }] }] }
//! ```
//!
//! where `"replicas": null` cancels the pending reassignment of that partition.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::{ReassignmentRequest, ReassignmentResult};
use crate::error::{FailedPartition, SubmissionError};
use crate::topology::{BrokerId, PartitionId};

/// New replica lists keyed by topic and partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassignmentPlan {
    topics: BTreeMap<String, BTreeMap<PartitionId, Vec<BrokerId>>>,
}

impl ReassignmentPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, topic: impl Into<String>, partition: PartitionId, replicas: Vec<BrokerId>) {
        self.topics
            .entry(topic.into())
            .or_default()
            .insert(partition, replicas);
    }

    pub fn replicas(&self, topic: &str, partition: PartitionId) -> Option<&[BrokerId]> {
        self.topics
            .get(topic)
            .and_then(|p| p.get(&partition))
            .map(Vec::as_slice)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn partitions(&self, topic: &str) -> Option<&BTreeMap<PartitionId, Vec<BrokerId>>> {
        self.topics.get(topic)
    }

    /// Every `(topic, partition, replicas)` entry ordered by topic and partition.
    pub fn iter(&self) -> impl Iterator<Item = (&str, PartitionId, &[BrokerId])> {
        self.topics.iter().flat_map(|(topic, partitions)| {
            partitions
                .iter()
                .map(move |(p, replicas)| (topic.as_str(), *p, replicas.as_slice()))
        })
    }

    /// Number of partitions in the plan.
    pub fn len(&self) -> usize {
        self.topics.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Brokers that appear in any new replica list.
    pub fn brokers(&self) -> impl Iterator<Item = BrokerId> + '_ {
        self.iter()
            .flat_map(|(_, _, replicas)| replicas.iter().copied())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
    }

    pub fn to_wire(&self) -> WirePlan {
        WirePlan {
            topics: self
                .topics
                .iter()
                .map(|(topic, partitions)| WireTopic {
                    topic_name: topic.clone(),
                    partitions: partitions
                        .iter()
                        .map(|(p, replicas)| WirePartition {
                            partition_id: *p,
                            replicas: Some(replicas.clone()),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, PlanFormatError> {
        Ok(serde_json::to_string(&self.to_wire())?)
    }

    pub fn from_json(json: &str) -> Result<Self, PlanFormatError> {
        Self::try_from(serde_json::from_str::<WirePlan>(json)?)
    }
}

impl<S> FromIterator<(S, PartitionId, Vec<BrokerId>)> for ReassignmentPlan
where
    S: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (S, PartitionId, Vec<BrokerId>)>>(iter: I) -> Self {
        let mut plan = Self::new();
        for (topic, partition, replicas) in iter {
            plan.insert(topic, partition, replicas);
        }
        plan
    }
}

#[derive(Debug, Error)]
pub enum PlanFormatError {
    #[error("Malformed plan: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Partition '{topic}'/{partition} has no replicas; cancellations are not plans")]
    MissingReplicas { topic: String, partition: PartitionId },

    #[error("Partition '{topic}'/{partition} appears more than once")]
    DuplicatePartition { topic: String, partition: PartitionId },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePlan {
    pub topics: Vec<WireTopic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTopic {
    pub topic_name: String,
    pub partitions: Vec<WirePartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePartition {
    pub partition_id: PartitionId,
    pub replicas: Option<Vec<BrokerId>>,
}

impl WirePlan {
    /// A request that aborts the pending reassignment of `partitions` and restores their original assignment.
    pub fn cancellation(topic: impl Into<String>, partitions: impl IntoIterator<Item = PartitionId>) -> Self {
        Self {
            topics: vec![WireTopic {
                topic_name: topic.into(),
                partitions: partitions
                    .into_iter()
                    .map(|partition_id| WirePartition {
                        partition_id,
                        replicas: None,
                    })
                    .collect(),
            }],
        }
    }

    pub fn into_requests(self) -> Vec<ReassignmentRequest> {
        self.topics
            .into_iter()
            .flat_map(|t| {
                let topic = t.topic_name;
                t.partitions.into_iter().map(move |p| ReassignmentRequest {
                    topic: topic.clone(),
                    partition: p.partition_id,
                    replicas: p.replicas,
                })
            })
            .collect()
    }
}

impl TryFrom<WirePlan> for ReassignmentPlan {
    type Error = PlanFormatError;

    fn try_from(wire: WirePlan) -> Result<Self, Self::Error> {
        let mut plan = Self::new();
        for topic in wire.topics {
            for partition in topic.partitions {
                let replicas = partition
                    .replicas
                    .ok_or_else(|| PlanFormatError::MissingReplicas {
                        topic: topic.topic_name.clone(),
                        partition: partition.partition_id,
                    })?;

                if plan.replicas(&topic.topic_name, partition.partition_id).is_some() {
                    return Err(PlanFormatError::DuplicatePartition {
                        topic: topic.topic_name,
                        partition: partition.partition_id,
                    });
                }
                plan.insert(topic.topic_name.clone(), partition.partition_id, replicas);
            }
        }
        Ok(plan)
    }
}

/// Turn per-partition submission results into an outcome. Any rejected partition fails the whole submission.
pub(crate) fn check_submission(results: Vec<ReassignmentResult>) -> Result<(), SubmissionError> {
    let failed: Vec<_> = results
        .into_iter()
        .filter_map(|r| {
            r.error.map(|message| FailedPartition {
                topic: r.topic,
                partition: r.partition,
                message,
            })
        })
        .collect();

    if failed.is_empty() {
        Ok(())
    } else {
        Err(SubmissionError::Rejected { failed })
    }
}
