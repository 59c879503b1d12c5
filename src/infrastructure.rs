use crate::config::{Destination, InfrastructureConfig, TelemetryOptions};
use crate::dispatch::{DispatchController, DispatchParts, DispatchStats, QueueState};
use crate::error::ConfigError;
use crate::events::{EventStream, InternalEvent};
use crate::probe::{ConnectivityProbe, TcpProbe};
use crate::store::OfflineStore;
use crate::telemetry::TelemetryCollector;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

static GLOBAL: Mutex<Option<Arc<Infrastructure>>> = parking_lot::const_mutex(None);

/// Process-wide machinery shared by every [`Logger`](crate::logger::Logger):
/// the dispatch runtime and its queues, the transport, the optional offline
/// store, the telemetry ring buffer and the internal event stream.
///
/// Build one explicitly with [`Infrastructure::builder`] (tests, embedding),
/// or use the process-wide instance through [`Infrastructure::init`] /
/// [`Infrastructure::instance`].
pub struct Infrastructure {
    config: InfrastructureConfig,
    runtime: Mutex<Option<Runtime>>,
    dispatch: DispatchController,
    telemetry: Arc<TelemetryCollector>,
    events: Arc<EventStream>,
    transport: Arc<dyn Transport>,
}

/// Assembles an [`Infrastructure`], defaulting any collaborator not supplied
/// from the [`InfrastructureConfig`].
pub struct InfrastructureBuilder {
    config: InfrastructureConfig,
    transport: Option<Arc<dyn Transport>>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    store: Option<Arc<dyn OfflineStore>>,
}

impl InfrastructureBuilder {
    pub fn new(config: InfrastructureConfig) -> Self {
        Self {
            config,
            transport: None,
            probe: None,
            store: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Use this store regardless of `offline_store.enabled`.
    pub fn store(mut self, store: Arc<dyn OfflineStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<Arc<Infrastructure>, ConfigError> {
        self.config.validate()?;
        let config = self.config;

        let runtime = Builder::new_multi_thread()
            .worker_threads(config.dispatch.worker_threads)
            .thread_name("notifier-dispatch")
            .enable_all()
            .build()
            .map_err(|e| ConfigError::Runtime(e.to_string()))?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(&config)?,
        };
        let probe = self.probe.unwrap_or_else(|| {
            Arc::new(TcpProbe::new(
                config.transport.probe_address,
                config.transport.probe_timeout,
            ))
        });
        let store = match self.store {
            Some(store) => Some(store),
            None => default_store(&config)?,
        };

        let events = Arc::new(EventStream::new());
        let telemetry = Arc::new(TelemetryCollector::new(&config.telemetry));
        let dispatch = DispatchController::new(
            runtime.handle().clone(),
            DispatchParts {
                transport: Arc::clone(&transport),
                store: store.clone(),
                probe,
                events: Arc::clone(&events),
            },
            config.dispatch.clone(),
            config.retry.clone(),
            config.telemetry.max_items,
        );

        // Records left behind by an earlier run get a drain loop straight away.
        if let Some(store) = &store {
            match store.destinations() {
                Ok(pending) => {
                    for destination in &pending {
                        dispatch.register(destination);
                    }
                    if !pending.is_empty() {
                        info!(destinations = pending.len(), "offline records found, replay scheduled");
                    }
                }
                Err(err) => warn!(error = %err, "could not list offline store destinations"),
            }
        }

        debug!(
            worker_threads = config.dispatch.worker_threads,
            offline_store = store.is_some(),
            "notifier infrastructure started"
        );

        Ok(Arc::new(Infrastructure {
            config,
            runtime: Mutex::new(Some(runtime)),
            dispatch,
            telemetry,
            events,
            transport,
        }))
    }
}

#[cfg(feature = "http")]
fn default_transport(config: &InfrastructureConfig) -> Result<Arc<dyn Transport>, ConfigError> {
    let transport = crate::transport::HttpTransport::new(&config.transport)
        .map_err(|e| ConfigError::InvalidEndpoint(e.to_string()))?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "http"))]
fn default_transport(_config: &InfrastructureConfig) -> Result<Arc<dyn Transport>, ConfigError> {
    warn!("built without the `http` feature; payloads are discarded");
    Ok(Arc::new(crate::transport::NoopTransport))
}

#[cfg(feature = "offline-store")]
fn default_store(config: &InfrastructureConfig) -> Result<Option<Arc<dyn OfflineStore>>, ConfigError> {
    let options = &config.offline_store;
    if !options.enabled {
        return Ok(None);
    }
    let store = crate::store::SledOfflineStore::open(&options.path, options.max_records_per_destination)
        .map_err(|e| ConfigError::StoreUnavailable(e.to_string()))?;
    Ok(Some(Arc::new(store)))
}

#[cfg(not(feature = "offline-store"))]
fn default_store(config: &InfrastructureConfig) -> Result<Option<Arc<dyn OfflineStore>>, ConfigError> {
    let options = &config.offline_store;
    if !options.enabled {
        return Ok(None);
    }
    warn!("built without the `offline-store` feature; offline records are kept in memory");
    Ok(Some(Arc::new(crate::store::MemoryOfflineStore::new(
        options.max_records_per_destination,
    ))))
}

impl Infrastructure {
    pub fn builder(config: InfrastructureConfig) -> InfrastructureBuilder {
        InfrastructureBuilder::new(config)
    }

    /// Build with every collaborator taken from `config`.
    pub fn new(config: InfrastructureConfig) -> Result<Arc<Self>, ConfigError> {
        InfrastructureBuilder::new(config).build()
    }

    /// Install the process-wide instance.
    ///
    /// Fails with [`ConfigError::AlreadyInitialized`] when one is already
    /// running; call [`shutdown_global`](Self::shutdown_global) first to
    /// replace it.
    pub fn init(config: InfrastructureConfig) -> Result<Arc<Self>, ConfigError> {
        Self::init_with(InfrastructureBuilder::new(config))
    }

    pub fn init_with(builder: InfrastructureBuilder) -> Result<Arc<Self>, ConfigError> {
        let mut global = GLOBAL.lock();
        if global.is_some() {
            return Err(ConfigError::AlreadyInitialized);
        }
        let infrastructure = builder.build()?;
        *global = Some(Arc::clone(&infrastructure));
        Ok(infrastructure)
    }

    /// The process-wide instance, created with default settings on first use.
    pub fn instance() -> Result<Arc<Self>, ConfigError> {
        let mut global = GLOBAL.lock();
        if let Some(existing) = global.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let infrastructure = Self::new(InfrastructureConfig::default())?;
        *global = Some(Arc::clone(&infrastructure));
        Ok(infrastructure)
    }

    /// The process-wide instance if one has been created.
    pub fn try_instance() -> Option<Arc<Self>> {
        GLOBAL.lock().clone()
    }

    /// Shut the process-wide instance down and forget it. Returns `false`
    /// when there was none.
    pub fn shutdown_global() -> bool {
        let taken = GLOBAL.lock().take();
        match taken {
            Some(infrastructure) => {
                infrastructure.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn config(&self) -> &InfrastructureConfig {
        &self.config
    }

    pub fn dispatch(&self) -> &DispatchController {
        &self.dispatch
    }

    pub fn telemetry(&self) -> &Arc<TelemetryCollector> {
        &self.telemetry
    }

    pub fn events(&self) -> &Arc<EventStream> {
        &self.events
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<InternalEvent> {
        self.events.subscribe()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn store(&self) -> Option<Arc<dyn OfflineStore>> {
        self.dispatch.store()
    }

    /// Apply new telemetry settings at runtime (enable/disable, resize).
    pub fn reconfigure_telemetry(&self, options: &TelemetryOptions) {
        self.telemetry.apply_options(options);
        self.dispatch.set_telemetry_items(options.max_items);
    }

    pub fn pause_delivery(&self) {
        self.dispatch.pause_delivery();
    }

    pub fn resume_delivery(&self) {
        self.dispatch.resume_delivery();
    }

    pub fn queue_state(&self, destination: &Destination) -> Option<QueueState> {
        self.dispatch.state(destination)
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatch.stats()
    }

    /// Block until every queue is drained or `timeout` elapses.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.dispatch.wait_until_idle(timeout)
    }

    pub fn is_shut_down(&self) -> bool {
        !self.dispatch.is_accepting()
    }

    /// Stop accepting payloads, let drain loops finish their current bundle,
    /// move whatever is still queued to the offline store (or drop it), then
    /// stop the dispatch runtime. Idempotent.
    pub fn shutdown(&self) {
        self.dispatch.shutdown();
        if let Some(runtime) = self.runtime.lock().take() {
            // Safe from async contexts too; the drain loops are already gone.
            runtime.shutdown_background();
            debug!("notifier infrastructure stopped");
        }
    }
}

impl Drop for Infrastructure {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::StaticProbe;
    use crate::store::MemoryOfflineStore;
    use crate::transport::NoopTransport;

    fn quiet(config: InfrastructureConfig) -> InfrastructureBuilder {
        Infrastructure::builder(config)
            .transport(Arc::new(NoopTransport))
            .probe(Arc::new(StaticProbe::new(true)))
    }

    #[test]
    fn build_rejects_invalid_config() {
        let mut config = InfrastructureConfig::default();
        config.dispatch.max_queue_depth = 0;
        assert!(quiet(config).build().is_err());
    }

    #[test]
    fn existing_offline_records_get_a_queue_at_startup() {
        let store = Arc::new(MemoryOfflineStore::new(10));
        let destination = Destination::new("tok", "prod");
        store.persist(&destination, b"{}", 1).unwrap();

        let infra = quiet(InfrastructureConfig::default())
            .store(store)
            .build()
            .unwrap();
        assert!(infra.dispatch().destinations().contains(&destination));
        infra.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let infra = quiet(InfrastructureConfig::default()).build().unwrap();
        infra.shutdown();
        infra.shutdown();
        assert!(infra.is_shut_down());
    }

    #[test]
    fn telemetry_reconfiguration_applies() {
        let infra = quiet(InfrastructureConfig::default()).build().unwrap();
        infra.reconfigure_telemetry(&TelemetryOptions {
            enabled: true,
            queue_depth: 2,
            max_items: 2,
        });
        assert_eq!(infra.telemetry().capacity(), 2);
    }
}
