//! Plans, throttles and tracks a reassignment against an in-process cluster.
//!
//! ```console
//! $ RUST_LOG=info cargo run --example plan
//! ```

use std::sync::Arc;
use std::time::Duration;

use kafka_reassign::client::memory::InMemoryCluster;
use kafka_reassign::tracker::TrackerEvent;
use kafka_reassign::SessionBuilder;
use tracing_subscriber::{filter::EnvFilter, FmtSubscriber};

const PARTITION_BYTES: u64 = 64 * 1024 * 1024;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // six brokers on three racks, one topic crowded onto the first three
    let cluster = Arc::new(InMemoryCluster::new());
    for id in 1..=6 {
        let rack = format!("rack-{}", (id - 1) / 2);
        cluster.add_broker(id, Some(&rack));
    }
    cluster.add_topic("orders", vec![vec![1, 2, 3]; 6]);
    for partition in 0..6 {
        for broker in 1..=3 {
            cluster.set_log_dir_size(broker, "orders", partition, PARTITION_BYTES);
        }
    }

    let mut session = SessionBuilder::new(Arc::clone(&cluster) as _)
        .poll_interval(Duration::from_millis(200))
        .build();
    session.refresh_topology().await?;
    session.select_all("orders")?;
    session.set_target_brokers(1..=6)?;

    let plan = session.compute_plan()?;
    println!("{}", plan.to_json()?);

    let review = session.review()?;
    for delta in review.deltas.iter().filter(|d| d.any_change) {
        println!(
            "{}/{}: {:?} -> {:?}",
            delta.topic, delta.partition, delta.old_replicas, delta.new_replicas
        );
    }
    println!(
        "{} replicas ({} bytes) move, {} leaders change",
        review.summary.moved_replicas, review.summary.estimated_bytes, review.summary.leader_changes
    );

    session.apply_throttle(32 * 1024 * 1024).await?;
    session.submit().await?;

    // copy the new replicas in four steps
    let mut events = session.tracker().subscribe();
    for step in 1..=4u64 {
        for (topic, partition, replicas) in plan.iter() {
            for broker in replicas {
                if cluster.ongoing(topic, partition).map_or(false, |o| o.adding_replicas.contains(broker)) {
                    cluster.set_log_dir_size(*broker, topic, partition, PARTITION_BYTES * step / 4);
                }
            }
        }
        if step == 4 {
            for (topic, partition, _) in plan.iter() {
                cluster.complete_reassignment(topic, partition);
            }
        }

        loop {
            match events.recv().await? {
                TrackerEvent::Updated(states) => {
                    for state in states {
                        println!(
                            "{}: {:.1}% speed={:?} eta={:?}",
                            state.topic,
                            state.progress_percent,
                            state.estimated_speed_bytes_per_sec,
                            state.estimated_completion_time
                        );
                    }
                    break;
                }
                TrackerEvent::Completed(state) => println!("{}: done", state.topic),
                TrackerEvent::RefreshFailed(e) => println!("poll failed: {e}"),
            }
        }
    }

    session.tracker().stop();
    session.reset_throttle().await?;

    Ok(())
}
