//! Error taxonomy of the reassignment core.
//!
//! Planner and selection problems surface as [`InputError`] before anything is sent to the cluster. Everything that
//! talks to the cluster reports either a batch error naming the failed resources ([`PartialApplyError`],
//! [`SubmissionError`]) or a [`TrackingError`] that the tracker logs and retries on its next tick.

use std::fmt::{Display, Formatter};

use thiserror::Error;

use crate::client::ConfigResource;
use crate::topology::{BrokerId, PartitionId};

pub use crate::client::error::Error as ClientError;

/// Something that can be looked up in a topology snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {
    Broker(BrokerId),
    Topic(String),
    Partition { topic: String, partition: PartitionId },
}

impl Display for Resource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Broker(id) => write!(f, "broker {id}"),
            Self::Topic(name) => write!(f, "topic '{name}'"),
            Self::Partition { topic, partition } => write!(f, "partition '{topic}'/{partition}"),
        }
    }
}

/// A lookup for a broker, topic or partition that is not part of the current topology.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0} not found")]
pub struct NotFound(pub Resource);

impl NotFound {
    pub fn broker(id: BrokerId) -> Self {
        Self(Resource::Broker(id))
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self(Resource::Topic(name.into()))
    }

    pub fn partition(topic: impl Into<String>, partition: PartitionId) -> Self {
        Self(Resource::Partition {
            topic: topic.into(),
            partition,
        })
    }
}

/// Invalid operator input. Blocks progression and is reported before any cluster call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("Not enough target brokers: select at least {required} brokers ({available} selected)")]
    InsufficientBrokers { required: usize, available: usize },

    #[error("No target brokers selected")]
    NoTargetBrokers,

    #[error("Broker {0} is selected more than once")]
    DuplicateTargetBroker(BrokerId),

    #[error("No partitions selected")]
    EmptySelection,

    #[error("Unknown resource: {0}")]
    NotFound(#[from] NotFound),

    #[error("No reassignment plan has been computed")]
    NoPlan,

    #[error("Throttle rate must be greater than zero")]
    InvalidThrottleRate,
}

/// A config resource that could not be updated, with the cluster's reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedResource {
    pub resource: ConfigResource,
    pub message: String,
}

impl Display for FailedResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.resource, self.message)
    }
}

/// Some broker or topic config patches failed while applying or resetting a throttle.
///
/// Patches that succeeded are left in place.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Failed to update throttle config for {}", join(.failed))]
pub struct PartialApplyError {
    pub failed: Vec<FailedResource>,
}

impl PartialApplyError {
    pub fn resources(&self) -> impl Iterator<Item = &ConfigResource> {
        self.failed.iter().map(|f| &f.resource)
    }
}

/// A partition the cluster refused to reassign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPartition {
    pub topic: String,
    pub partition: PartitionId,
    pub message: String,
}

impl Display for FailedPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({})", self.topic, self.partition, self.message)
    }
}

/// The reassignment submission failed. Per-partition rejections fail the whole submission.
#[derive(Debug, Clone, Error)]
pub enum SubmissionError {
    #[error("Reassignment rejected for {}", join(.failed))]
    Rejected { failed: Vec<FailedPartition> },

    #[error("Reassignment request failed: {0}")]
    Request(#[from] ClientError),
}

/// One poll cycle of the tracker failed.
#[derive(Debug, Clone, Error)]
pub enum TrackingError {
    #[error("Cannot list active reassignments: {0}")]
    ListReassignments(#[source] ClientError),

    #[error("Cannot describe log dirs: {0}")]
    DescribeLogDirs(#[source] ClientError),
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    PartialApply(#[from] PartialApplyError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error(transparent)]
    Tracking(#[from] TrackingError),

    #[error("Cluster request failed: {0}")]
    Client(#[from] ClientError),
}

impl From<NotFound> for Error {
    fn from(e: NotFound) -> Self {
        Self::Input(InputError::NotFound(e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn join<T: Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
