//! Live progress of in-flight reassignments.
//!
//! The tracker polls the cluster on a fixed interval while started. Each poll lists the active reassignments and
//! samples the log dirs of the replicas being added. A topic is tracked from the first poll that reports it until
//! the first poll that no longer does, at which point it is reported as complete.
//!
//! Progress, speed and ETA are derived from the remaining bytes of the two most recent samples. At most one poll is
//! in flight at any time: a poll requested while another one runs is skipped, not queued.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::client::{ClusterControl, OngoingReassignment, ReplicaLogDir, NO_REASSIGNMENT_IN_PROGRESS};
use crate::error::{NotFound, Result, SubmissionError, TrackingError};
use crate::plan::{check_submission, WirePlan};
use crate::topology::{BrokerId, PartitionId};

/// Default time between two polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Highest progress reported while a reassignment is still listed as active.
pub const MAX_IN_FLIGHT_PROGRESS: f64 = 99.9;

/// Source of wall-clock time for samples and ETAs.
pub trait Clock: Debug + Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassignmentPhase {
    /// Transfer size not known yet.
    Starting,
    InProgress,
    Complete,
}

/// Replica movement of one partition as last reported by the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InFlightPartition {
    pub replicas: Vec<BrokerId>,
    pub adding_replicas: Vec<BrokerId>,
    pub removing_replicas: Vec<BrokerId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sample {
    at: DateTime<Utc>,
    remaining: u64,
}

/// Progress of the reassignment of one topic.
#[derive(Debug, Clone, PartialEq)]
pub struct ReassignmentState {
    pub topic: String,
    pub partitions: BTreeMap<PartitionId, InFlightPartition>,
    pub phase: ReassignmentPhase,

    /// Bytes to transfer, fixed at the first sample.
    pub total_transfer_bytes: Option<u64>,

    /// Bytes left at the latest sample.
    pub remaining_bytes: Option<u64>,

    pub progress_percent: f64,
    pub estimated_speed_bytes_per_sec: Option<f64>,
    pub estimated_completion_time: Option<DateTime<Utc>>,

    last_sample: Option<Sample>,
}

impl ReassignmentState {
    pub(crate) fn new(
        topic: impl Into<String>,
        partitions: BTreeMap<PartitionId, InFlightPartition>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partitions,
            phase: ReassignmentPhase::Starting,
            total_transfer_bytes: None,
            remaining_bytes: None,
            progress_percent: 0.0,
            estimated_speed_bytes_per_sec: None,
            estimated_completion_time: None,
            last_sample: None,
        }
    }

    /// Partitions being reassigned. Identifies one reassignment of the topic.
    pub fn signature(&self) -> BTreeSet<PartitionId> {
        self.partitions.keys().copied().collect()
    }

    /// Record a remaining-bytes sample taken at `at`.
    pub(crate) fn observe(&mut self, remaining: u64, at: DateTime<Utc>) {
        let total = *self.total_transfer_bytes.get_or_insert(remaining);
        let sample = Sample { at, remaining };

        let speed = self.last_sample.and_then(|prev| estimate_speed(prev, sample));

        self.remaining_bytes = Some(remaining);
        self.progress_percent = progress_percent(total, remaining);
        self.estimated_speed_bytes_per_sec = speed;
        self.estimated_completion_time = speed
            .filter(|s| *s > 0.0)
            .and_then(|s| chrono::Duration::try_milliseconds((remaining as f64 / s * 1000.0) as i64))
            .and_then(|eta| at.checked_add_signed(eta));
        self.last_sample = Some(sample);
        self.phase = ReassignmentPhase::InProgress;
    }

    fn complete(&mut self) {
        self.phase = ReassignmentPhase::Complete;
        self.progress_percent = 100.0;
        self.remaining_bytes = Some(0);
        self.estimated_speed_bytes_per_sec = None;
        self.estimated_completion_time = None;
    }
}

/// `100 * (1 - remaining / total)`, kept below 100 while the reassignment is active.
fn progress_percent(total: u64, remaining: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let done = total.saturating_sub(remaining) as f64;
    (done * 100.0 / total as f64).clamp(0.0, MAX_IN_FLIGHT_PROGRESS)
}

/// Bytes/sec between two samples, or `None` if time did not advance or remaining bytes grew.
fn estimate_speed(prev: Sample, curr: Sample) -> Option<f64> {
    let elapsed_ms = (curr.at - prev.at).num_milliseconds();
    if elapsed_ms <= 0 || curr.remaining > prev.remaining {
        return None;
    }
    Some((prev.remaining - curr.remaining) as f64 * 1000.0 / elapsed_ms as f64)
}

/// Bytes still to be copied to the replicas being added.
///
/// A new replica has to catch up with the largest existing replica of its partition. Returns `None` until the log
/// dirs of an existing replica of every moving partition have been reported.
fn remaining_bytes(
    topic: &str,
    partitions: &BTreeMap<PartitionId, InFlightPartition>,
    sizes: &HashMap<(&str, PartitionId, BrokerId), u64>,
) -> Option<u64> {
    let mut remaining = 0u64;

    for (partition, in_flight) in partitions {
        if in_flight.adding_replicas.is_empty() {
            continue;
        }

        let source = in_flight
            .replicas
            .iter()
            .filter(|b| !in_flight.adding_replicas.contains(b))
            .filter_map(|b| sizes.get(&(topic, *partition, *b)))
            .max()?;

        for broker in &in_flight.adding_replicas {
            let copied = sizes
                .get(&(topic, *partition, *broker))
                .copied()
                .unwrap_or_default();
            remaining += source.saturating_sub(copied);
        }
    }

    Some(remaining)
}

#[derive(Debug, Clone)]
pub enum TrackerEvent {
    /// Every tracked reassignment after a successful poll.
    Updated(Vec<ReassignmentState>),

    /// A reassignment is no longer reported by the cluster.
    Completed(ReassignmentState),

    RefreshFailed(TrackingError),
}

/// Builder for [`ReassignmentTracker`].
pub struct TrackerBuilder {
    client: Arc<dyn ClusterControl>,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
    event_capacity: usize,
}

impl TrackerBuilder {
    pub fn new(client: Arc<dyn ClusterControl>) -> Self {
        Self {
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
            clock: Arc::new(SystemClock),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Number of events buffered for a slow subscriber before it starts lagging.
    pub fn event_capacity(mut self, event_capacity: usize) -> Self {
        self.event_capacity = event_capacity.max(1);
        self
    }

    pub fn build(self) -> ReassignmentTracker {
        let (events, _) = broadcast::channel(self.event_capacity);

        ReassignmentTracker {
            inner: Arc::new(Inner {
                client: self.client,
                clock: self.clock,
                poll_interval: self.poll_interval,
                states: RwLock::new(BTreeMap::new()),
                refreshing: AtomicBool::new(false),
                running: Mutex::new(None),
                events,
            }),
        }
    }
}

impl std::fmt::Debug for TrackerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerBuilder")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

/// Tracks in-flight reassignments. Cloning yields another handle to the same tracker.
///
/// Must be constructed using [`TrackerBuilder`].
#[derive(Debug, Clone)]
pub struct ReassignmentTracker {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    client: Arc<dyn ClusterControl>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,

    states: RwLock<BTreeMap<String, ReassignmentState>>,

    /// Set while a poll is in flight
    refreshing: AtomicBool,

    /// Dropping the sender stops the polling task
    running: Mutex<Option<watch::Sender<()>>>,

    events: broadcast::Sender<TrackerEvent>,
}

impl ReassignmentTracker {
    /// Start polling. Does nothing if already started.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut running = self.inner.running.lock();
        if running.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(());
        *running = Some(stop_tx);
        drop(running);

        // dropping the last handle drops the stop sender and ends the task
        let weak = Arc::downgrade(&self.inner);
        let poll_interval = self.inner.poll_interval;
        tokio::spawn(async move {
            info!(poll_interval=?poll_interval, "Reassignment tracker started");
            loop {
                let Some(inner) = weak.upgrade() else { break };
                inner.refresh_guarded().await;
                drop(inner);

                // the timer is only re-armed once the poll above has settled
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = stop_rx.changed() => break,
                }
            }
            info!("Reassignment tracker stopped");
        });
    }

    /// Stop polling. A poll already in flight runs to completion. Does nothing if not started.
    pub fn stop(&self) {
        self.inner.running.lock().take();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Poll once now. Returns `false` if skipped because another poll is in flight.
    pub async fn refresh_now(&self) -> bool {
        self.inner.refresh_guarded().await
    }

    /// Current state of every tracked reassignment.
    pub fn snapshot(&self) -> Vec<ReassignmentState> {
        self.inner.states.read().values().cloned().collect()
    }

    pub fn state(&self, topic: &str) -> Option<ReassignmentState> {
        self.inner.states.read().get(topic).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.inner.events.subscribe()
    }

    /// Abort the reassignment of `topic` and restore its original assignment.
    ///
    /// The topic stays tracked until the cluster stops reporting it. Partitions that finished since the last poll
    /// are not an error.
    pub async fn cancel(&self, topic: &str) -> Result<()> {
        let partitions = self
            .state(topic)
            .ok_or_else(|| NotFound::topic(topic))?
            .signature();

        let requests = WirePlan::cancellation(topic, partitions).into_requests();
        info!(topic, partitions = requests.len(), "Cancelling reassignment");

        let results = self
            .inner
            .client
            .alter_partition_reassignments(requests)
            .await
            .map_err(SubmissionError::Request)?
            .into_iter()
            .filter(|r| {
                let finished = r.error.as_deref() == Some(NO_REASSIGNMENT_IN_PROGRESS);
                if finished {
                    debug!(topic=%r.topic, partition=r.partition, "Partition finished before cancellation");
                }
                !finished
            })
            .collect();
        check_submission(results)?;

        self.inner.refresh_guarded().await;
        Ok(())
    }
}

/// Clears the in-flight flag when the poll settles, even if it is dropped half-way.
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Inner {
    async fn refresh_guarded(&self) -> bool {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Poll already in flight, skipping");
            return false;
        }
        let _guard = RefreshGuard(&self.refreshing);

        if let Err(e) = self.refresh().await {
            warn!(e=%e, "Reassignment poll failed, retrying on next tick");
            let _ = self.events.send(TrackerEvent::RefreshFailed(e));
        }

        true
    }

    async fn refresh(&self) -> Result<(), TrackingError> {
        let ongoing = self
            .client
            .list_partition_reassignments()
            .await
            .map_err(TrackingError::ListReassignments)?;

        let log_dirs = if ongoing.is_empty() {
            vec![]
        } else {
            self.client
                .describe_log_dirs()
                .await
                .map_err(TrackingError::DescribeLogDirs)?
        };

        let now = self.clock.now();
        let active = group_by_topic(ongoing);
        let sizes = index_log_dirs(&log_dirs);

        let mut completed = vec![];
        let updated = {
            let mut states = self.states.write();

            states.retain(|topic, state| {
                if active.contains_key(topic) {
                    return true;
                }
                state.complete();
                completed.push(state.clone());
                false
            });

            for (topic, partitions) in active {
                let remaining = remaining_bytes(&topic, &partitions, &sizes);
                let signature: BTreeSet<PartitionId> = partitions.keys().copied().collect();

                let state = match states.entry(topic.clone()) {
                    Entry::Occupied(o) if o.get().signature() == signature => {
                        let state = o.into_mut();
                        state.partitions = partitions;
                        state
                    }
                    Entry::Occupied(mut o) => {
                        info!(topic=%topic, "Reassignment partitions changed, restarting progress");
                        o.insert(ReassignmentState::new(topic.clone(), partitions));
                        o.into_mut()
                    }
                    Entry::Vacant(v) => {
                        info!(topic=%topic, partitions = signature.len(), "Tracking reassignment");
                        v.insert(ReassignmentState::new(topic.clone(), partitions))
                    }
                };

                if let Some(remaining) = remaining {
                    state.observe(remaining, now);
                }
            }

            states.values().cloned().collect::<Vec<_>>()
        };

        for state in completed {
            info!(topic=%state.topic, "Reassignment complete");
            let _ = self.events.send(TrackerEvent::Completed(state));
        }
        let _ = self.events.send(TrackerEvent::Updated(updated));

        Ok(())
    }
}

fn group_by_topic(
    ongoing: Vec<OngoingReassignment>,
) -> BTreeMap<String, BTreeMap<PartitionId, InFlightPartition>> {
    let mut active: BTreeMap<String, BTreeMap<PartitionId, InFlightPartition>> = BTreeMap::new();
    for r in ongoing {
        active.entry(r.topic).or_default().insert(
            r.partition,
            InFlightPartition {
                replicas: r.replicas,
                adding_replicas: r.adding_replicas,
                removing_replicas: r.removing_replicas,
            },
        );
    }
    active
}

fn index_log_dirs(log_dirs: &[ReplicaLogDir]) -> HashMap<(&str, PartitionId, BrokerId), u64> {
    log_dirs
        .iter()
        .map(|d| ((d.topic.as_str(), d.partition, d.broker_id), d.size_bytes))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn state() -> ReassignmentState {
        ReassignmentState::new(
            "orders",
            BTreeMap::from([(
                0,
                InFlightPartition {
                    replicas: vec![1, 2, 3, 4],
                    adding_replicas: vec![4],
                    removing_replicas: vec![3],
                },
            )]),
        )
    }

    #[test]
    fn test_speed_progress_and_eta() {
        let mut state = state();
        assert_eq!(state.phase, ReassignmentPhase::Starting);

        state.observe(1000, t0());
        assert_eq!(state.phase, ReassignmentPhase::InProgress);
        assert_eq!(state.total_transfer_bytes, Some(1000));
        assert_eq!(state.progress_percent, 0.0);
        assert_eq!(state.estimated_speed_bytes_per_sec, None);
        assert_eq!(state.estimated_completion_time, None);

        let t1 = t0() + chrono::Duration::seconds(10);
        state.observe(600, t1);
        assert_eq!(state.total_transfer_bytes, Some(1000));
        assert_eq!(state.remaining_bytes, Some(600));
        assert!((state.progress_percent - 40.0).abs() < 1e-9);
        assert_eq!(state.estimated_speed_bytes_per_sec, Some(40.0));
        assert_eq!(
            state.estimated_completion_time,
            Some(t1 + chrono::Duration::seconds(15))
        );
    }

    #[test]
    fn test_growing_remaining_has_no_speed() {
        let mut state = state();
        state.observe(1000, t0());
        state.observe(1200, t0() + chrono::Duration::seconds(5));

        assert_eq!(state.estimated_speed_bytes_per_sec, None);
        assert_eq!(state.estimated_completion_time, None);
        assert_eq!(state.progress_percent, 0.0);
    }

    #[test]
    fn test_stalled_has_zero_speed_and_no_eta() {
        let mut state = state();
        state.observe(500, t0());
        state.observe(500, t0() + chrono::Duration::seconds(5));

        assert_eq!(state.estimated_speed_bytes_per_sec, Some(0.0));
        assert_eq!(state.estimated_completion_time, None);
    }

    #[test]
    fn test_progress_stays_below_100_while_active() {
        let mut state = state();
        state.observe(1000, t0());
        state.observe(0, t0() + chrono::Duration::seconds(1));
        assert_eq!(state.progress_percent, MAX_IN_FLIGHT_PROGRESS);

        state.complete();
        assert_eq!(state.progress_percent, 100.0);
        assert_eq!(state.phase, ReassignmentPhase::Complete);
    }

    #[test]
    fn test_complete_clears_estimates() {
        let mut state = state();
        state.observe(1000, t0());
        state.observe(400, t0() + chrono::Duration::seconds(10));
        assert_eq!(state.estimated_speed_bytes_per_sec, Some(60.0));
        assert!(state.estimated_completion_time.is_some());

        state.complete();
        assert_eq!(state.remaining_bytes, Some(0));
        assert_eq!(state.estimated_speed_bytes_per_sec, None);
        assert_eq!(state.estimated_completion_time, None);
    }

    #[test]
    fn test_eta_beyond_representable_time() {
        let mut state = state();
        state.observe(20_000_000_000_000, t0());
        state.observe(19_999_999_999_999, t0() + chrono::Duration::seconds(3));

        // one byte per three seconds puts the ETA past the last representable date
        assert!(state.estimated_speed_bytes_per_sec.unwrap() > 0.0);
        assert_eq!(state.estimated_completion_time, None);
        assert_eq!(state.phase, ReassignmentPhase::InProgress);
    }

    #[test]
    fn test_remaining_bytes() {
        let partitions = BTreeMap::from([
            (
                0,
                InFlightPartition {
                    replicas: vec![1, 2, 4],
                    adding_replicas: vec![4],
                    removing_replicas: vec![],
                },
            ),
            (
                1,
                InFlightPartition {
                    replicas: vec![2, 3],
                    adding_replicas: vec![],
                    removing_replicas: vec![3],
                },
            ),
        ]);

        let mut sizes = HashMap::new();
        assert_eq!(remaining_bytes("orders", &partitions, &sizes), None);

        sizes.insert(("orders", 0, 1), 900);
        sizes.insert(("orders", 0, 2), 1000);
        assert_eq!(remaining_bytes("orders", &partitions, &sizes), Some(1000));

        sizes.insert(("orders", 0, 4), 250);
        assert_eq!(remaining_bytes("orders", &partitions, &sizes), Some(750));
    }

    proptest! {
        #[test]
        fn test_progress_is_monotonic(
            start in 1u64..1_000_000,
            steps in prop::collection::vec(0u64..50_000, 1..20),
        ) {
            let mut state = state();
            let mut remaining = start;
            let mut at = t0();
            state.observe(remaining, at);
            let mut last = state.progress_percent;

            for step in steps {
                remaining = remaining.saturating_sub(step);
                at += chrono::Duration::seconds(1);
                state.observe(remaining, at);

                prop_assert!(state.progress_percent >= last);
                prop_assert!(state.progress_percent < 100.0);
                prop_assert!(state.estimated_speed_bytes_per_sec.unwrap() >= 0.0);
                last = state.progress_percent;
            }
        }
    }
}
