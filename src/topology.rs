//! Read-only view of brokers, topics and partitions.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::client::error::Result;
use crate::client::{BrokerMetadata, ClusterControl, PartitionMetadata, ReplicaLogDir, TopicMetadata};
use crate::error::NotFound;

pub type BrokerId = i32;
pub type PartitionId = i32;

/// Default number of brokers kept by a [`BrokerDirectory`].
pub const DEFAULT_BROKER_CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    /// broker ID from the cluster description
    pub id: BrokerId,
    pub host: String,
    pub port: i32,
    pub rack: Option<String>,

    /// Bytes used by all replicas hosted on this broker.
    pub used_bytes: u64,
}

impl Broker {
    pub fn new(id: BrokerId, rack: Option<&str>) -> Self {
        Self {
            id,
            host: format!("broker-{id}"),
            port: 9092,
            rack: rack.map(ToString::to_string),
            used_bytes: 0,
        }
    }
}

impl Display for Broker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl<'a> From<&'a BrokerMetadata> for Broker {
    fn from(b: &'a BrokerMetadata) -> Self {
        Self {
            id: b.node_id,
            host: b.host.clone(),
            port: b.port,
            rack: b.rack.clone(),
            used_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    /// The name of this topic.
    pub name: String,

    /// Number of replicas every partition of this topic should have.
    pub replication_factor: usize,

    /// Partition information
    pub partitions: BTreeMap<PartitionId, Partition>,
}

impl Topic {
    /// Create a topic. The replication factor is the widest replica list among its partitions.
    pub fn new(name: impl Into<String>, partitions: impl IntoIterator<Item = Partition>) -> Self {
        let partitions: BTreeMap<_, _> = partitions.into_iter().map(|p| (p.id, p)).collect();
        let replication_factor = partitions
            .values()
            .map(|p| p.replicas.len())
            .max()
            .unwrap_or_default();

        Self {
            name: name.into(),
            replication_factor,
            partitions,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub id: PartitionId,

    /// The ID of the leader broker.
    pub leader_id: BrokerId,

    /// The set of all nodes that host this partition. Index 0 is the preferred leader.
    pub replicas: Vec<BrokerId>,

    /// The set of replicas that are currently offline.
    pub offline_replicas: Vec<BrokerId>,

    /// Size of a single replica in bytes.
    pub size_bytes: u64,
}

impl Partition {
    /// Create an online partition led by its first replica.
    pub fn new(id: PartitionId, replicas: Vec<BrokerId>) -> Self {
        Self {
            id,
            leader_id: replicas.first().copied().unwrap_or(-1),
            replicas,
            offline_replicas: vec![],
            size_bytes: 0,
        }
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    fn from_metadata(p: &PartitionMetadata) -> Self {
        Self {
            id: p.partition_index,
            leader_id: p.leader_id,
            replicas: p.replica_nodes.clone(),
            offline_replicas: p.offline_replicas.clone(),
            size_bytes: 0,
        }
    }
}

/// Immutable snapshot of the cluster taken at one refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    brokers: BTreeMap<BrokerId, Broker>,
    topics: BTreeMap<String, Topic>,
}

impl TopologySnapshot {
    pub fn new(
        brokers: impl IntoIterator<Item = Broker>,
        topics: impl IntoIterator<Item = Topic>,
    ) -> Self {
        Self {
            brokers: brokers.into_iter().map(|b| (b.id, b)).collect(),
            topics: topics.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    /// Build a snapshot from the collaborator's responses.
    ///
    /// Internal topics are skipped. A partition's size is the largest log dir reported for any of its replicas and
    /// a broker's used space is the sum of its log dirs.
    pub fn from_metadata(
        brokers: &[BrokerMetadata],
        topics: &[TopicMetadata],
        log_dirs: &[ReplicaLogDir],
    ) -> Self {
        let mut brokers: BTreeMap<_, _> = brokers.iter().map(|b| (b.node_id, Broker::from(b))).collect();

        let mut sizes: HashMap<(&str, PartitionId), u64> = HashMap::new();
        for dir in log_dirs {
            let size = sizes.entry((dir.topic.as_str(), dir.partition)).or_default();
            *size = (*size).max(dir.size_bytes);

            if let Some(broker) = brokers.get_mut(&dir.broker_id) {
                broker.used_bytes += dir.size_bytes;
            }
        }

        let topics = topics
            .iter()
            .filter(|t| !t.is_internal)
            .map(|t| {
                let topic = Topic::new(
                    t.name.clone(),
                    t.partitions.iter().map(|p| {
                        let size = sizes
                            .get(&(t.name.as_str(), p.partition_index))
                            .copied()
                            .unwrap_or_default();
                        Partition::from_metadata(p).with_size(size)
                    }),
                );
                (t.name.clone(), topic)
            })
            .collect();

        Self {
            brokers,
            topics,
        }
    }

    /// Fetch a fresh snapshot from the cluster.
    pub async fn fetch(client: &dyn ClusterControl) -> Result<Self> {
        let (brokers, topics, log_dirs) = futures::future::try_join3(
            client.describe_cluster(),
            client.describe_topics(),
            client.describe_log_dirs(),
        )
        .await?;

        let snapshot = Self::from_metadata(&brokers, &topics, &log_dirs);
        debug!(
            brokers = snapshot.brokers.len(),
            topics = snapshot.topics.len(),
            "Fetched topology",
        );

        Ok(snapshot)
    }

    pub fn broker(&self, id: BrokerId) -> Result<&Broker, NotFound> {
        self.brokers.get(&id).ok_or_else(|| NotFound::broker(id))
    }

    pub fn brokers(&self) -> impl Iterator<Item = &Broker> {
        self.brokers.values()
    }

    pub fn broker_ids(&self) -> impl Iterator<Item = BrokerId> + '_ {
        self.brokers.keys().copied()
    }

    pub fn topic(&self, name: &str) -> Result<&Topic, NotFound> {
        self.topics.get(name).ok_or_else(|| NotFound::topic(name))
    }

    pub fn topics(&self) -> impl Iterator<Item = &Topic> {
        self.topics.values()
    }

    pub fn partition(&self, topic: &str, partition: PartitionId) -> Result<&Partition, NotFound> {
        self.topic(topic)?
            .partitions
            .get(&partition)
            .ok_or_else(|| NotFound::partition(topic, partition))
    }

    /// Number of distinct failure domains among the given brokers.
    ///
    /// A broker without a rack is its own failure domain.
    pub fn rack_count(&self, brokers: &[BrokerId]) -> usize {
        brokers
            .iter()
            .map(|id| self.failure_domain(*id))
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub(crate) fn failure_domain(&self, id: BrokerId) -> FailureDomain<'_> {
        match self.brokers.get(&id).and_then(|b| b.rack.as_deref()) {
            Some(rack) => FailureDomain::Rack(rack),
            None => FailureDomain::Broker(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum FailureDomain<'a> {
    Rack(&'a str),
    Broker(BrokerId),
}

/// Read-through cache of broker-id lookups backed by the latest topology snapshot.
///
/// The cache holds at most `capacity` brokers and is invalidated whenever a new snapshot is installed.
#[derive(Debug)]
pub struct BrokerDirectory {
    capacity: usize,

    /// Brokers keyed by broker ID
    cache: RwLock<HashMap<BrokerId, Broker>>,

    snapshot: RwLock<Arc<TopologySnapshot>>,
}

impl Default for BrokerDirectory {
    fn default() -> Self {
        Self::new(DEFAULT_BROKER_CACHE_CAPACITY)
    }
}

impl BrokerDirectory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            cache: RwLock::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(TopologySnapshot::default())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }

    /// Number of cached brokers.
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    /// Returns the broker for the provided broker ID
    pub fn get(&self, broker_id: BrokerId) -> Result<Broker, NotFound> {
        if let Some(broker) = self.cache.read().get(&broker_id) {
            return Ok(broker.clone());
        }

        let broker = self.snapshot.read().broker(broker_id)?.clone();

        let mut cache = self.cache.write();
        if cache.len() >= self.capacity {
            let evict = cache.keys().next().copied();
            if let Some(evict) = evict {
                cache.remove(&evict);
            }
        }
        cache.insert(broker_id, broker.clone());

        Ok(broker)
    }

    /// Installs a new snapshot and drops every cached lookup.
    pub fn update(&self, snapshot: Arc<TopologySnapshot>) {
        {
            let current = self.snapshot.read();
            for broker in snapshot.brokers() {
                match current.broker(broker.id) {
                    Ok(old) if old.host != broker.host || old.port != broker.port => {
                        info!(
                            broker=broker.id,
                            current=%old,
                            new=%broker,
                            "Broker update",
                        );
                    }
                    Ok(_) => {}
                    Err(_) => {
                        info!(
                            broker=broker.id,
                            new=%broker,
                            "New broker",
                        );
                    }
                }
            }
        }

        *self.snapshot.write() = snapshot;
        self.cache.write().clear();
    }

    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        Arc::clone(&self.snapshot.read())
    }
}
