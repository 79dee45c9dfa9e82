//! Deterministic in-process cluster.
//!
//! Reassignments submitted to an [`InMemoryCluster`] stay in flight until the test completes them with
//! [`InMemoryCluster::complete_reassignment`]; progress is driven through [`InMemoryCluster::set_log_dir_size`].
//! Failures can be injected per config resource, per submitted partition and per poll.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::error::{Error, Result};
use super::{
    AlterConfigsRequest, AlterConfigsResult, BrokerMetadata, ClusterControl, ConfigEntry, ConfigOp,
    ConfigResource, OngoingReassignment, PartitionMetadata, ReassignmentRequest, ReassignmentResult,
    ReplicaLogDir, TopicMetadata, NO_REASSIGNMENT_IN_PROGRESS,
};
use crate::error::NotFound;
use crate::topology::{BrokerId, PartitionId};

#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
}

#[derive(Debug, Default)]
struct ClusterState {
    brokers: BTreeMap<BrokerId, BrokerMetadata>,
    topics: BTreeMap<String, TopicMetadata>,
    log_dirs: BTreeMap<(BrokerId, String, PartitionId), u64>,
    reassignments: BTreeMap<(String, PartitionId), OngoingReassignment>,
    configs: BTreeMap<ConfigResource, BTreeMap<String, String>>,

    failing_resources: BTreeSet<ConfigResource>,
    failing_partitions: BTreeSet<(String, PartitionId)>,
    failing_polls: usize,
    poll_latency: Option<Duration>,

    config_batches: Vec<Vec<ConfigResource>>,
    submissions: Vec<Vec<ReassignmentRequest>>,
    polls: usize,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_broker(&self, id: BrokerId, rack: Option<&str>) {
        self.state.lock().brokers.insert(
            id,
            BrokerMetadata {
                node_id: id,
                host: format!("broker-{id}"),
                port: 9092,
                rack: rack.map(ToString::to_string),
            },
        );
    }

    /// Add a topic whose partition `i` is hosted on `assignments[i]`, led by the first replica.
    pub fn add_topic(&self, name: &str, assignments: Vec<Vec<BrokerId>>) {
        let partitions = assignments
            .into_iter()
            .enumerate()
            .map(|(idx, replicas)| PartitionMetadata {
                partition_index: idx as PartitionId,
                leader_id: replicas.first().copied().unwrap_or(-1),
                replica_nodes: replicas,
                offline_replicas: vec![],
            })
            .collect();

        self.state.lock().topics.insert(
            name.to_string(),
            TopicMetadata {
                name: name.to_string(),
                is_internal: false,
                partitions,
            },
        );
    }

    pub fn set_log_dir_size(&self, broker: BrokerId, topic: &str, partition: PartitionId, size_bytes: u64) {
        self.state
            .lock()
            .log_dirs
            .insert((broker, topic.to_string(), partition), size_bytes);
    }

    /// Make every config patch of `resource` fail.
    pub fn fail_config_updates(&self, resource: ConfigResource) {
        self.state.lock().failing_resources.insert(resource);
    }

    /// Make every submission for this partition fail.
    pub fn fail_submissions(&self, topic: &str, partition: PartitionId) {
        self.state
            .lock()
            .failing_partitions
            .insert((topic.to_string(), partition));
    }

    /// Make the next `n` reassignment listings fail.
    pub fn fail_next_polls(&self, n: usize) {
        self.state.lock().failing_polls = n;
    }

    /// Delay every reassignment listing.
    pub fn set_poll_latency(&self, latency: Duration) {
        self.state.lock().poll_latency = Some(latency);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing_resources.clear();
        state.failing_partitions.clear();
        state.failing_polls = 0;
    }

    /// Current config of `resource`.
    pub fn config(&self, resource: &ConfigResource) -> BTreeMap<String, String> {
        self.state
            .lock()
            .configs
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }

    /// Resources of every `AlterConfigs` call, in call order.
    pub fn config_batches(&self) -> Vec<Vec<ConfigResource>> {
        self.state.lock().config_batches.clone()
    }

    pub fn submissions(&self) -> Vec<Vec<ReassignmentRequest>> {
        self.state.lock().submissions.clone()
    }

    /// Number of reassignment listings served so far.
    pub fn polls(&self) -> usize {
        self.state.lock().polls
    }

    pub fn replicas(&self, topic: &str, partition: PartitionId) -> Option<Vec<BrokerId>> {
        self.state
            .lock()
            .topics
            .get(topic)
            .and_then(|t| t.partitions.iter().find(|p| p.partition_index == partition))
            .map(|p| p.replica_nodes.clone())
    }

    pub fn ongoing(&self, topic: &str, partition: PartitionId) -> Option<OngoingReassignment> {
        self.state
            .lock()
            .reassignments
            .get(&(topic.to_string(), partition))
            .cloned()
    }

    /// Finish an in-flight reassignment: the partition moves to its target replicas.
    pub fn complete_reassignment(&self, topic: &str, partition: PartitionId) {
        let mut state = self.state.lock();
        let Some(ongoing) = state.reassignments.remove(&(topic.to_string(), partition)) else {
            return;
        };

        let target: Vec<BrokerId> = ongoing
            .replicas
            .iter()
            .copied()
            .filter(|b| !ongoing.removing_replicas.contains(b))
            .collect();
        state.move_partition(topic, partition, target);
    }
}

impl ClusterState {
    fn partition_mut(&mut self, topic: &str, partition: PartitionId) -> Option<&mut PartitionMetadata> {
        self.topics
            .get_mut(topic)?
            .partitions
            .iter_mut()
            .find(|p| p.partition_index == partition)
    }

    fn move_partition(&mut self, topic: &str, partition: PartitionId, replicas: Vec<BrokerId>) {
        if let Some(p) = self.partition_mut(topic, partition) {
            p.leader_id = replicas.first().copied().unwrap_or(-1);
            p.replica_nodes = replicas;
        }
    }

    fn reassign(&mut self, request: &ReassignmentRequest) -> Result<(), String> {
        if self
            .failing_partitions
            .contains(&(request.topic.clone(), request.partition))
        {
            return Err("injected failure".to_string());
        }

        let key = (request.topic.clone(), request.partition);
        let Some(target) = &request.replicas else {
            return match self.reassignments.remove(&key) {
                Some(_) => Ok(()),
                None => Err(NO_REASSIGNMENT_IN_PROGRESS.to_string()),
            };
        };

        if target.is_empty() || target.iter().any(|b| !self.brokers.contains_key(b)) {
            return Err("INVALID_REPLICA_ASSIGNMENT".to_string());
        }

        // an in-flight reassignment is replaced, starting from its original replicas
        let current = match self.reassignments.remove(&key) {
            Some(ongoing) => ongoing
                .replicas
                .into_iter()
                .filter(|b| !ongoing.adding_replicas.contains(b))
                .collect(),
            None => self
                .partition_mut(&request.topic, request.partition)
                .map(|p| p.replica_nodes.clone())
                .ok_or_else(|| "UNKNOWN_TOPIC_OR_PARTITION".to_string())?,
        };

        let adding: Vec<BrokerId> = target.iter().copied().filter(|b| !current.contains(b)).collect();
        let removing: Vec<BrokerId> = current.iter().copied().filter(|b| !target.contains(b)).collect();

        if adding.is_empty() && removing.is_empty() {
            // reorder only, applied at once
            self.move_partition(&request.topic, request.partition, target.clone());
            return Ok(());
        }

        let mut replicas = target.clone();
        replicas.extend(removing.iter().copied());
        self.reassignments.insert(
            key,
            OngoingReassignment {
                topic: request.topic.clone(),
                partition: request.partition,
                replicas,
                adding_replicas: adding,
                removing_replicas: removing,
            },
        );

        Ok(())
    }

    fn alter(&mut self, request: &AlterConfigsRequest) -> Result<(), String> {
        if self.failing_resources.contains(&request.resource) {
            return Err("injected failure".to_string());
        }

        let exists = match &request.resource {
            ConfigResource::Broker(id) => self.brokers.contains_key(id),
            ConfigResource::Topic(name) => self.topics.contains_key(name),
        };
        if !exists {
            return Err(format!("unknown {}", request.resource));
        }

        let config = self.configs.entry(request.resource.clone()).or_default();
        for op in &request.ops {
            match op {
                ConfigOp::Set { key, value } => {
                    config.insert(key.clone(), value.clone());
                }
                ConfigOp::Delete { key } => {
                    config.remove(key);
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ClusterControl for InMemoryCluster {
    async fn describe_cluster(&self) -> Result<Vec<BrokerMetadata>> {
        Ok(self.state.lock().brokers.values().cloned().collect())
    }

    async fn describe_topics(&self) -> Result<Vec<TopicMetadata>> {
        Ok(self.state.lock().topics.values().cloned().collect())
    }

    async fn describe_log_dirs(&self) -> Result<Vec<ReplicaLogDir>> {
        Ok(self
            .state
            .lock()
            .log_dirs
            .iter()
            .map(|((broker_id, topic, partition), size_bytes)| ReplicaLogDir {
                broker_id: *broker_id,
                topic: topic.clone(),
                partition: *partition,
                size_bytes: *size_bytes,
            })
            .collect())
    }

    async fn alter_partition_reassignments(
        &self,
        requests: Vec<ReassignmentRequest>,
    ) -> Result<Vec<ReassignmentResult>> {
        let mut state = self.state.lock();
        state.submissions.push(requests.clone());

        Ok(requests
            .into_iter()
            .map(|request| {
                let error = state.reassign(&request).err();
                ReassignmentResult {
                    topic: request.topic,
                    partition: request.partition,
                    error,
                }
            })
            .collect())
    }

    async fn list_partition_reassignments(&self) -> Result<Vec<OngoingReassignment>> {
        let latency = self.state.lock().poll_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        state.polls += 1;
        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(Error::cluster(
                "ListPartitionReassignments",
                "injected failure",
            ));
        }

        Ok(state.reassignments.values().cloned().collect())
    }

    async fn alter_configs(
        &self,
        requests: Vec<AlterConfigsRequest>,
    ) -> Result<Vec<AlterConfigsResult>> {
        let mut state = self.state.lock();
        state
            .config_batches
            .push(requests.iter().map(|r| r.resource.clone()).collect());

        Ok(requests
            .into_iter()
            .map(|request| AlterConfigsResult {
                error: state.alter(&request).err(),
                resource: request.resource,
            })
            .collect())
    }

    async fn describe_topic_config(&self, topic: &str) -> Result<Vec<ConfigEntry>> {
        let state = self.state.lock();
        if !state.topics.contains_key(topic) {
            return Err(NotFound::topic(topic).into());
        }

        Ok(state
            .configs
            .get(&ConfigResource::Topic(topic.to_string()))
            .map(|config| {
                config
                    .iter()
                    .map(|(name, value)| ConfigEntry {
                        name: name.clone(),
                        value: Some(value.clone()),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
