#![allow(dead_code)]

use std::sync::Arc;

use kafka_reassign::client::memory::InMemoryCluster;
use once_cell::sync::Lazy;

/// Enables debug logging if the `RUST_LOG` environment variable is set. Does nothing if `RUST_LOG` is not set.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Start logging.
pub fn start_logging() {
    Lazy::force(&LOG_SETUP);
}

static LOG_SETUP: Lazy<()> = Lazy::new(|| {
    use tracing_log::LogTracer;
    use tracing_subscriber::{filter::EnvFilter, FmtSubscriber};

    LogTracer::init().unwrap();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    tracing::subscriber::set_global_default(subscriber).unwrap();
});

/// Four brokers on racks `a`, `a`, `b`, `b` and a topic `orders` with three partitions on brokers 1, 2 and 3, each
/// replica holding `size_bytes`.
pub fn four_broker_cluster(size_bytes: u64) -> Arc<InMemoryCluster> {
    let cluster = Arc::new(InMemoryCluster::new());
    for (id, rack) in [(1, "a"), (2, "a"), (3, "b"), (4, "b")] {
        cluster.add_broker(id, Some(rack));
    }

    cluster.add_topic("orders", vec![vec![1, 2, 3], vec![2, 3, 1], vec![3, 1, 2]]);
    for partition in 0..3 {
        for broker in 1..=3 {
            cluster.set_log_dir_size(broker, "orders", partition, size_bytes);
        }
    }

    cluster
}
