//! The operator workflow: select partitions and target brokers, compute and review a plan, optionally throttle,
//! submit, then track until the cluster reports completion.
//!
//! Every operation takes `&mut self`, so a session never runs two operations at once. An operation that fails leaves
//! the session ready to retry it; in particular a failed submission keeps the computed plan.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::client::ClusterControl;
use crate::diff::{compute_moved_replicas, remove_redundant_reassignments, MoveDelta, MoveSummary};
use crate::error::{Error, InputError, NotFound, Result, SubmissionError};
use crate::plan::{check_submission, ReassignmentPlan};
use crate::planner::AssignmentPlanner;
use crate::selection::PartitionSelection;
use crate::throttle::{check_rate, compute_throttle_spec, is_throttled, ThrottleController, ThrottleSpec};
use crate::topology::{
    BrokerDirectory, BrokerId, PartitionId, TopologySnapshot, DEFAULT_BROKER_CACHE_CAPACITY,
};
use crate::tracker::{Clock, ReassignmentTracker, TrackerBuilder, DEFAULT_POLL_INTERVAL};

/// Builder for [`ReassignmentSession`].
#[derive(Debug)]
pub struct SessionBuilder {
    client: Arc<dyn ClusterControl>,
    broker_cache_capacity: usize,
    poll_interval: Duration,
    clock: Option<Arc<dyn Clock>>,
}

impl SessionBuilder {
    pub fn new(client: Arc<dyn ClusterControl>) -> Self {
        Self {
            client,
            broker_cache_capacity: DEFAULT_BROKER_CACHE_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            clock: None,
        }
    }

    /// Maximum number of brokers kept in the broker lookup cache.
    pub fn broker_cache_capacity(mut self, capacity: usize) -> Self {
        self.broker_cache_capacity = capacity;
        self
    }

    /// Interval between two progress polls of the tracker.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// The session starts with an empty topology; call [`ReassignmentSession::refresh_topology`] first.
    pub fn build(self) -> ReassignmentSession {
        let mut tracker = TrackerBuilder::new(Arc::clone(&self.client)).poll_interval(self.poll_interval);
        if let Some(clock) = self.clock {
            tracker = tracker.clock(clock);
        }

        ReassignmentSession {
            throttle: ThrottleController::new(Arc::clone(&self.client)),
            tracker: tracker.build(),
            client: self.client,
            directory: BrokerDirectory::new(self.broker_cache_capacity),
            selection: PartitionSelection::new(),
            targets: vec![],
            plan: None,
            throttled: None,
        }
    }
}

/// What a computed plan would do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    /// One entry per selected partition, including unchanged ones.
    pub deltas: Vec<MoveDelta>,
    pub summary: MoveSummary,
}

/// Resources carrying throttle config written by this session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedThrottle {
    pub topics: BTreeSet<String>,
    pub brokers: BTreeSet<BrokerId>,
}

/// One operator's reassignment workflow against one cluster.
///
/// Must be constructed using [`SessionBuilder`]. Dropping the session stops its tracker.
#[derive(Debug)]
pub struct ReassignmentSession {
    client: Arc<dyn ClusterControl>,
    directory: BrokerDirectory,
    throttle: ThrottleController,
    tracker: ReassignmentTracker,

    selection: PartitionSelection,
    targets: Vec<BrokerId>,

    /// Discarded whenever the selection or targets change
    plan: Option<Arc<ReassignmentPlan>>,

    throttled: Option<AppliedThrottle>,
}

impl ReassignmentSession {
    /// Fetch a fresh topology snapshot from the cluster.
    ///
    /// Selected partitions that no longer exist are kept and reported by the next validation.
    pub async fn refresh_topology(&mut self) -> Result<Arc<TopologySnapshot>> {
        let snapshot = Arc::new(TopologySnapshot::fetch(self.client.as_ref()).await?);
        debug!(
            brokers = snapshot.brokers().count(),
            topics = snapshot.topics().count(),
            "Refreshed topology",
        );

        self.directory.update(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub fn topology(&self) -> Arc<TopologySnapshot> {
        self.directory.snapshot()
    }

    pub fn selection(&self) -> &PartitionSelection {
        &self.selection
    }

    /// Select `partitions` of `topic`. Nothing is selected if any of them is unknown.
    pub fn select(
        &mut self,
        topic: &str,
        partitions: impl IntoIterator<Item = PartitionId>,
    ) -> Result<(), NotFound> {
        let snapshot = self.directory.snapshot();
        let partitions = partitions
            .into_iter()
            .map(|p| snapshot.partition(topic, p).map(|_| p))
            .collect::<Result<Vec<_>, _>>()?;

        self.selection.select(topic, partitions);
        self.discard_plan();
        Ok(())
    }

    pub fn select_all(&mut self, topic: &str) -> Result<(), NotFound> {
        self.selection.select_all(topic, &self.directory.snapshot())?;
        self.discard_plan();
        Ok(())
    }

    pub fn deselect(&mut self, topic: &str, partition: PartitionId) {
        self.selection.deselect(topic, partition);
        self.discard_plan();
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
        self.discard_plan();
    }

    pub fn target_brokers(&self) -> &[BrokerId] {
        &self.targets
    }

    /// Replace the target broker set. Every broker must be known and listed once.
    pub fn set_target_brokers(
        &mut self,
        brokers: impl IntoIterator<Item = BrokerId>,
    ) -> Result<(), InputError> {
        let brokers: Vec<BrokerId> = brokers.into_iter().collect();

        let mut seen = BTreeSet::new();
        for id in &brokers {
            if !seen.insert(*id) {
                return Err(InputError::DuplicateTargetBroker(*id));
            }
            self.directory.get(*id)?;
        }

        self.targets = brokers;
        self.discard_plan();
        Ok(())
    }

    /// Minimum number of target brokers the current selection needs.
    pub fn required_brokers(&self) -> Result<usize, InputError> {
        AssignmentPlanner::new(&self.directory.snapshot()).required_brokers(&self.selection)
    }

    /// Check whether a plan can be computed from the current selection and targets.
    pub fn validate(&self) -> Result<(), InputError> {
        AssignmentPlanner::new(&self.directory.snapshot()).validate(&self.selection, &self.targets)
    }

    /// Compute a plan for the current selection, leaving out partitions that would not change.
    pub fn compute_plan(&mut self) -> Result<Arc<ReassignmentPlan>, InputError> {
        let snapshot = self.directory.snapshot();
        let plan = AssignmentPlanner::new(&snapshot).plan(&self.selection, &self.targets)?;
        let plan = Arc::new(remove_redundant_reassignments(&plan, &snapshot));

        info!(
            selected = self.selection.len(),
            reassigned = plan.len(),
            targets = self.targets.len(),
            "Computed reassignment plan",
        );

        self.plan = Some(Arc::clone(&plan));
        Ok(plan)
    }

    pub fn plan(&self) -> Option<Arc<ReassignmentPlan>> {
        self.plan.clone()
    }

    pub fn discard_plan(&mut self) {
        if self.plan.take().is_some() {
            debug!("Discarded reassignment plan");
        }
    }

    /// Per-partition changes and traffic estimate of the current plan.
    pub fn review(&self) -> Result<Review> {
        let plan = self.plan.as_ref().ok_or(InputError::NoPlan)?;
        let deltas = compute_moved_replicas(&self.selection, plan, &self.directory.snapshot())?;
        let summary = MoveSummary::from_deltas(&deltas);

        Ok(Review { deltas, summary })
    }

    /// Throttle replication of the current plan to `max_bytes_per_sec`.
    ///
    /// The touched topics and brokers are remembered for [`reset_throttle`](Self::reset_throttle), also when
    /// applying fails half-way.
    pub async fn apply_throttle(&mut self, max_bytes_per_sec: u64) -> Result<ThrottleSpec> {
        let plan = self.plan.as_ref().ok_or(InputError::NoPlan)?;
        let snapshot = self.directory.snapshot();
        let spec = compute_throttle_spec(plan, &snapshot)?;

        check_rate(max_bytes_per_sec)?;

        // brokers that joined after the last refresh get throttled too, so they have to be reset as well
        let brokers = self.throttle.cluster_brokers().await?;
        let result = self
            .throttle
            .apply_to_brokers(&spec, &brokers, max_bytes_per_sec)
            .await;
        if !matches!(result, Err(Error::Input(_))) {
            let throttled = self.throttled.get_or_insert_with(Default::default);
            throttled
                .topics
                .extend(spec.topic_names().map(ToString::to_string));
            throttled.brokers.extend(brokers);
        }

        result.map(|_| spec)
    }

    pub fn applied_throttle(&self) -> Option<&AppliedThrottle> {
        self.throttled.as_ref()
    }

    /// Remove every throttle this session applied. Does nothing if none was applied.
    pub async fn reset_throttle(&mut self) -> Result<()> {
        let Some(throttled) = &self.throttled else {
            return Ok(());
        };

        let topics: Vec<String> = throttled.topics.iter().cloned().collect();
        let brokers: Vec<BrokerId> = throttled.brokers.iter().copied().collect();
        self.throttle.reset(&topics, &brokers).await?;

        self.throttled = None;
        Ok(())
    }

    /// Submit the current plan and start tracking it.
    ///
    /// The plan is only consumed once the cluster accepted every partition. An empty plan is consumed without
    /// contacting the cluster.
    pub async fn submit(&mut self) -> Result<Arc<ReassignmentPlan>> {
        let plan = self.plan.clone().ok_or(InputError::NoPlan)?;
        if plan.is_empty() {
            info!("Plan moves nothing, skipping submission");
            self.plan = None;
            return Ok(plan);
        }

        let requests = plan.to_wire().into_requests();
        info!(
            topics = plan.topics().count(),
            partitions = requests.len(),
            "Submitting reassignment",
        );

        let results = match self.client.alter_partition_reassignments(requests).await {
            Ok(results) => results,
            Err(e) => {
                error!(e=%e, "Reassignment submission failed");
                return Err(SubmissionError::Request(e).into());
            }
        };
        if let Err(e) = check_submission(results) {
            error!(e=%e, "Reassignment submission rejected");
            return Err(e.into());
        }

        self.plan = None;
        self.tracker.start();
        Ok(plan)
    }

    pub fn tracker(&self) -> &ReassignmentTracker {
        &self.tracker
    }

    /// Abort the in-flight reassignment of `topic`.
    pub async fn cancel(&mut self, topic: &str) -> Result<()> {
        self.tracker.cancel(topic).await
    }

    /// Whether the in-flight reassignment of `topic` is currently throttled.
    ///
    /// Returns `false` for a topic that is not being reassigned.
    pub async fn is_throttled(&self, topic: &str) -> Result<bool> {
        let Some(state) = self.tracker.state(topic) else {
            return Ok(false);
        };
        let config = self.client.describe_topic_config(topic).await?;

        Ok(is_throttled(&config, &state))
    }
}

impl Drop for ReassignmentSession {
    fn drop(&mut self) {
        self.tracker.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    use crate::client::memory::InMemoryCluster;

    async fn session() -> (Arc<InMemoryCluster>, ReassignmentSession) {
        let cluster = Arc::new(InMemoryCluster::new());
        for id in 1..=4 {
            cluster.add_broker(id, None);
        }
        cluster.add_topic("orders", vec![vec![1, 2, 3], vec![2, 3, 1]]);

        let mut session = SessionBuilder::new(Arc::clone(&cluster) as Arc<dyn ClusterControl>).build();
        session.refresh_topology().await.unwrap();
        (cluster, session)
    }

    #[tokio::test]
    async fn test_select_rejects_unknown_partitions() {
        let (_, mut session) = session().await;

        assert_eq!(
            session.select("orders", [0, 7]).unwrap_err(),
            NotFound::partition("orders", 7)
        );
        assert!(session.selection().is_empty());

        assert_eq!(session.select_all("ghost").unwrap_err(), NotFound::topic("ghost"));
    }

    #[tokio::test]
    async fn test_set_target_brokers() {
        let (_, mut session) = session().await;

        assert_eq!(
            session.set_target_brokers([1, 2, 1]).unwrap_err(),
            InputError::DuplicateTargetBroker(1)
        );
        assert_eq!(
            session.set_target_brokers([1, 9]).unwrap_err(),
            InputError::NotFound(NotFound::broker(9))
        );
        assert!(session.target_brokers().is_empty());

        session.set_target_brokers([4, 2]).unwrap();
        assert_eq!(session.target_brokers(), &[4, 2]);
    }

    #[tokio::test]
    async fn test_insufficient_brokers_blocks_plan() {
        let (_, mut session) = session().await;
        session.select_all("orders").unwrap();
        session.set_target_brokers([1, 2]).unwrap();

        assert_eq!(session.required_brokers().unwrap(), 3);
        let err = session.compute_plan().unwrap_err();
        assert_eq!(
            err,
            InputError::InsufficientBrokers {
                required: 3,
                available: 2
            }
        );
        assert!(err.to_string().contains("select at least 3 brokers"));
        assert!(session.plan().is_none());
    }

    #[tokio::test]
    async fn test_editing_discards_plan() {
        let (_, mut session) = session().await;
        session.select_all("orders").unwrap();
        session.set_target_brokers([2, 3, 4]).unwrap();
        session.compute_plan().unwrap();
        assert!(session.plan().is_some());

        session.deselect("orders", 1);
        assert!(session.plan().is_none());
        assert_matches!(session.review(), Err(Error::Input(InputError::NoPlan)));
    }

    #[tokio::test]
    async fn test_plan_already_in_place_is_empty() {
        let (cluster, mut session) = session().await;
        session.select("orders", [0]).unwrap();
        session.set_target_brokers([1, 2, 3]).unwrap();

        let plan = session.compute_plan().unwrap();
        assert!(plan.is_empty());

        session.submit().await.unwrap();
        assert!(cluster.submissions().is_empty());
        assert!(session.plan().is_none());
        assert!(!session.tracker().is_running());
    }

    #[tokio::test]
    async fn test_zero_rate_records_nothing() {
        let (cluster, mut session) = session().await;
        session.select_all("orders").unwrap();
        session.set_target_brokers([2, 3, 4]).unwrap();
        session.compute_plan().unwrap();

        assert_matches!(
            session.apply_throttle(0).await,
            Err(Error::Input(InputError::InvalidThrottleRate))
        );
        assert!(session.applied_throttle().is_none());
        assert!(cluster.config_batches().is_empty());
    }
}
