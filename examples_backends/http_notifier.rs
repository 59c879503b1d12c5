use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_notifier::init::init_tracing;
use tracing_notifier::{ErrorLevel, Infrastructure, InfrastructureConfig, Logger, NotifierConfig};

/// Reports through the real ingestion API.
///
/// NOTIFIER_ACCESS_TOKEN=... NOTIFIER_ENVIRONMENT=staging \
///     cargo run --example http_notifier
fn main() {
    let infra = Infrastructure::init(InfrastructureConfig::default()).expect("notifier infrastructure");
    let logger = Arc::new(Logger::new(NotifierConfig::from_env(), Arc::clone(&infra)).expect("logger"));

    init_tracing(Arc::clone(&logger)).expect("set global subscriber");

    let mut events = infra.subscribe();

    info!(target: "shop", "http notifier example started");
    error!(target: "shop", order = "A-17", "simulated checkout failure");

    let outcome = logger
        .as_blocking(Duration::from_secs(5))
        .log(ErrorLevel::Critical, "simulated fatal error", None);
    println!("blocking report: {:?}", outcome);

    infra.flush(Duration::from_secs(5));
    while let Ok(event) = events.try_recv() {
        println!("{:?}", event);
    }

    Infrastructure::shutdown_global();
}
