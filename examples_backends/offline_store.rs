use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing_notifier::config::Destination;
use tracing_notifier::error::TransportError;
use tracing_notifier::probe::StaticProbe;
use tracing_notifier::store::OfflineStore;
use tracing_notifier::transport::{Transport, TransportResponse};
use tracing_notifier::{Infrastructure, InfrastructureConfig, Logger, NotifierConfig, OfflineStoreOptions};

/// A transport that pretends the network is down.
struct Offline;

#[async_trait]
impl Transport for Offline {
    async fn post(&self, _destination: &Destination, _payload: &[u8]) -> Result<TransportResponse, TransportError> {
        Err(TransportError::Network("network is unreachable".into()))
    }
}

/// Logs while "offline", so payloads land in the sled store under
/// `./.notifier-store`. Run it again with a real transport and the records
/// are replayed on startup.
fn main() {
    tracing_subscriber::fmt::init();

    let config = InfrastructureConfig {
        offline_store: OfflineStoreOptions {
            enabled: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let infra = Infrastructure::builder(config)
        .transport(Arc::new(Offline))
        .probe(Arc::new(StaticProbe::new(false)))
        .build()
        .expect("notifier infrastructure");
    let logger = Logger::new(NotifierConfig::new("offline-demo-token"), Arc::clone(&infra)).expect("logger");

    for i in 0..3 {
        let outcome = logger
            .as_blocking(Duration::from_secs(2))
            .error(format!("failure #{} while offline", i));
        println!("{:?}", outcome);
    }

    let store = infra.store().expect("store is enabled");
    println!(
        "records waiting for replay: {:?}",
        store.count(&logger.destination())
    );
    infra.shutdown();
}
