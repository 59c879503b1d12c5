use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;
use tracing::error;

use tracing_notifier::init::{init_tracing_with_config, LayerConfig};
use tracing_notifier::transport::NoopTransport;
use tracing_notifier::{
    DispatchOptions, ErrorLevel, Infrastructure, InfrastructureConfig, Logger, NotifierConfig, TelemetryOptions,
};

#[tokio::main]
async fn main() {
    let config = InfrastructureConfig {
        dispatch: DispatchOptions {
            max_queue_depth: 50_000,
            worker_threads: 4,
            ..Default::default()
        },
        telemetry: TelemetryOptions {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let infra = Infrastructure::builder(config)
        .transport(Arc::new(NoopTransport))
        .build()
        .expect("notifier infrastructure");
    let logger = Logger::new(NotifierConfig::new("load-test-token"), Arc::clone(&infra)).expect("logger");

    let layer_config = LayerConfig {
        report_level: ErrorLevel::Error,
        telemetry_level: None,
        enable_stdout: false,
    };

    init_tracing_with_config(Arc::new(logger), layer_config).expect("set global subscriber");

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(target: "load", iteration = i, "custom load test error");
    }

    let elapsed = start.elapsed();
    println!("custom config: sent {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    infra.flush(Duration::from_secs(2));
    println!("{:?}", infra.stats());
    infra.shutdown();
}
