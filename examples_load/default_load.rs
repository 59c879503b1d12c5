use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;
use tracing::error;

use tracing_notifier::init::init_tracing;
use tracing_notifier::transport::NoopTransport;
use tracing_notifier::{Infrastructure, InfrastructureConfig, Logger, NotifierConfig};

#[tokio::main]
async fn main() {
    let infra = Infrastructure::builder(InfrastructureConfig::default())
        .transport(Arc::new(NoopTransport))
        .build()
        .expect("notifier infrastructure");
    let logger = Logger::new(NotifierConfig::new("load-test-token"), Arc::clone(&infra)).expect("logger");
    init_tracing(Arc::new(logger)).expect("set global subscriber");

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(target: "load", iteration = i, "default load test error");
    }

    let elapsed = start.elapsed();
    println!("default config: sent {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    // Give the drain loop a little time to empty the queue
    infra.flush(Duration::from_secs(2));
    println!("{:?}", infra.stats());
    infra.shutdown();
}
