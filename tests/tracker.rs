mod test_helpers;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use kafka_reassign::client::memory::InMemoryCluster;
use kafka_reassign::client::{ClusterControl, ReassignmentRequest};
use kafka_reassign::error::{Error, InputError, TrackingError};
use kafka_reassign::tracker::{ReassignmentPhase, TrackerEvent};
use kafka_reassign::{ReassignmentTracker, TrackerBuilder};

use crate::test_helpers::{four_broker_cluster, maybe_start_logging};

fn tracker(cluster: &Arc<InMemoryCluster>, poll_interval: Duration) -> ReassignmentTracker {
    TrackerBuilder::new(Arc::clone(cluster) as _)
        .poll_interval(poll_interval)
        .build()
}

/// Move partition 0 of `orders` from [1, 2, 3] to [1, 2, 4].
async fn start_move(cluster: &InMemoryCluster) {
    let results = cluster
        .alter_partition_reassignments(vec![ReassignmentRequest {
            topic: "orders".to_string(),
            partition: 0,
            replicas: Some(vec![1, 2, 4]),
        }])
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.error.is_none()));
}

#[tokio::test(start_paused = true)]
async fn test_start_and_stop_are_idempotent() {
    maybe_start_logging();

    let cluster = four_broker_cluster(1000);
    let tracker = tracker(&cluster, Duration::from_secs(1));
    assert!(!tracker.is_running());

    tracker.start();
    tracker.start();
    assert!(tracker.is_running());

    // polls at 0s, 1s and 2s
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(cluster.polls(), 3);

    tracker.stop();
    tracker.stop();
    assert!(!tracker.is_running());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(cluster.polls(), 3);

    // can be started again
    tracker.start();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(cluster.polls(), 4);
    tracker.stop();
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_refresh_is_skipped() {
    maybe_start_logging();

    let cluster = four_broker_cluster(1000);
    cluster.set_poll_latency(Duration::from_secs(1));
    let tracker = tracker(&cluster, Duration::from_secs(3600));

    let in_flight = {
        let tracker = tracker.clone();
        tokio::spawn(async move { tracker.refresh_now().await })
    };
    tokio::task::yield_now().await;

    assert!(!tracker.refresh_now().await);
    assert!(in_flight.await.unwrap());
    assert_eq!(cluster.polls(), 1);

    // the guard is released once the refresh settled
    assert!(tracker.refresh_now().await);
    assert_eq!(cluster.polls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_poll_delays_next_tick() {
    maybe_start_logging();

    let cluster = four_broker_cluster(1000);
    cluster.set_poll_latency(Duration::from_secs(2));
    let tracker = tracker(&cluster, Duration::from_secs(1));

    // polls settle at 2s, 5s and 8s
    tracker.start();
    tokio::time::sleep(Duration::from_millis(8500)).await;
    assert_eq!(cluster.polls(), 3);
    tracker.stop();
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_refresh() {
    maybe_start_logging();

    let cluster = four_broker_cluster(1000);
    cluster.set_poll_latency(Duration::from_secs(1));
    start_move(&cluster).await;
    let tracker = tracker(&cluster, Duration::from_secs(10));

    tracker.start();
    tokio::task::yield_now().await;
    tracker.stop();
    assert!(!tracker.is_running());

    // the poll in flight still completes, nothing after it
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(cluster.polls(), 1);
    assert!(tracker.state("orders").is_some());
}

#[tokio::test]
async fn test_failed_poll_is_retried() {
    maybe_start_logging();

    let cluster = four_broker_cluster(1000);
    start_move(&cluster).await;
    let tracker = tracker(&cluster, Duration::from_secs(3600));
    let mut events = tracker.subscribe();

    cluster.fail_next_polls(1);
    assert!(tracker.refresh_now().await);
    assert_matches!(
        events.try_recv(),
        Ok(TrackerEvent::RefreshFailed(TrackingError::ListReassignments(_)))
    );
    assert!(tracker.state("orders").is_none());

    assert!(tracker.refresh_now().await);
    assert_matches!(events.try_recv(), Ok(TrackerEvent::Updated(states)) => {
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].topic, "orders");
        assert_eq!(states[0].total_transfer_bytes, Some(1000));
        assert_eq!(states[0].phase, ReassignmentPhase::InProgress);
    });
}

#[tokio::test]
async fn test_new_partition_set_restarts_progress() {
    maybe_start_logging();

    let cluster = four_broker_cluster(1000);
    start_move(&cluster).await;
    let tracker = tracker(&cluster, Duration::from_secs(3600));

    tracker.refresh_now().await;
    cluster.set_log_dir_size(4, "orders", 0, 800);
    tracker.refresh_now().await;
    assert_eq!(tracker.state("orders").unwrap().progress_percent, 80.0);

    // a second partition joins the reassignment of the topic
    cluster
        .alter_partition_reassignments(vec![ReassignmentRequest {
            topic: "orders".to_string(),
            partition: 1,
            replicas: Some(vec![2, 3, 4]),
        }])
        .await
        .unwrap();
    tracker.refresh_now().await;

    let state = tracker.state("orders").unwrap();
    assert_eq!(state.signature().into_iter().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(state.total_transfer_bytes, Some(1200));
    assert_eq!(state.progress_percent, 0.0);
}

#[tokio::test]
async fn test_cancel_restores_and_untracks() {
    maybe_start_logging();

    let cluster = four_broker_cluster(1000);
    start_move(&cluster).await;
    let tracker = tracker(&cluster, Duration::from_secs(3600));
    tracker.refresh_now().await;
    let mut events = tracker.subscribe();

    tracker.cancel("orders").await.unwrap();

    let submissions = cluster.submissions();
    assert_eq!(
        submissions.last().unwrap(),
        &vec![ReassignmentRequest {
            topic: "orders".to_string(),
            partition: 0,
            replicas: None,
        }]
    );
    assert_eq!(cluster.replicas("orders", 0), Some(vec![1, 2, 3]));

    // the extra refresh saw the reassignment gone
    assert_matches!(events.try_recv(), Ok(TrackerEvent::Completed(state)) if state.topic == "orders");
    assert!(tracker.snapshot().is_empty());

    assert_matches!(
        tracker.cancel("orders").await,
        Err(Error::Input(InputError::NotFound(_)))
    );
}

#[tokio::test(start_paused = true)]
async fn test_dropping_started_tracker_stops_polling() {
    maybe_start_logging();

    let cluster = four_broker_cluster(1000);
    let tracker = tracker(&cluster, Duration::from_secs(1));

    tracker.start();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(cluster.polls(), 1);

    // never stopped explicitly
    drop(tracker);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(cluster.polls(), 1);
}

#[tokio::test]
async fn test_cancel_after_partition_finished() {
    maybe_start_logging();

    let cluster = four_broker_cluster(1000);
    start_move(&cluster).await;
    cluster
        .alter_partition_reassignments(vec![ReassignmentRequest {
            topic: "orders".to_string(),
            partition: 1,
            replicas: Some(vec![2, 3, 4]),
        }])
        .await
        .unwrap();
    let tracker = tracker(&cluster, Duration::from_secs(3600));
    tracker.refresh_now().await;
    assert_eq!(
        tracker.state("orders").unwrap().signature().into_iter().collect::<Vec<_>>(),
        vec![0, 1]
    );

    // partition 0 lands between the last poll and the cancellation
    cluster.complete_reassignment("orders", 0);
    tracker.cancel("orders").await.unwrap();

    assert_eq!(cluster.submissions().last().unwrap().len(), 2);
    assert_eq!(cluster.replicas("orders", 0), Some(vec![1, 2, 4]));
    assert_eq!(cluster.replicas("orders", 1), Some(vec![2, 3, 1]));
    assert!(cluster.ongoing("orders", 1).is_none());
    assert!(tracker.state("orders").is_none());
}
