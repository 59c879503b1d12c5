//! The public entry point: turns logging calls into payload bundles and hands
//! them to the dispatch side without waiting for the network.

use crate::bundle::{BundleBody, DeliveryOutcome, LogHandle, PayloadBundle};
use crate::config::{Destination, NotifierConfig};
use crate::dispatch::panic_message;
use crate::error::{BoxError, ConfigError, LogError};
use crate::events::InternalEvent;
use crate::infrastructure::Infrastructure;
use crate::level::ErrorLevel;
use crate::payload::Reportable;
use crate::telemetry::{TelemetryCollector, TelemetryEvent};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Custom key/value data attached to a single payload.
pub type CustomData = BTreeMap<String, Value>;

/// How long the rethrow path waits for its own report before handing the
/// error back.
const RETHROW_REPORT_TIMEOUT: Duration = Duration::from_secs(1);

static GLOBAL_LOGGER: OnceLock<Logger> = OnceLock::new();

/// Non-blocking notifier front-end.
///
/// Every call returns as soon as the bundle is queued. Calls are no-ops when
/// the access token is blank, reporting is disabled or the level is below
/// `min_level`.
///
/// ```no_run
/// use tracing_notifier::{Infrastructure, InfrastructureConfig, Logger, NotifierConfig};
///
/// let infra = Infrastructure::new(InfrastructureConfig::default()).unwrap();
/// let logger = Logger::new(NotifierConfig::new("POST_SERVER_ITEM_TOKEN"), infra).unwrap();
/// logger.error("payment declined").unwrap();
/// ```
pub struct Logger {
    config: RwLock<NotifierConfig>,
    /// `None` means the process-wide instance, resolved per call.
    infrastructure: Option<Arc<Infrastructure>>,
}

impl Logger {
    /// Validate `config` and bind the logger to `infrastructure`. The
    /// destination's queue is created right away, so offline records left
    /// for it are replayed even if nothing new is logged.
    pub fn new(config: NotifierConfig, infrastructure: Arc<Infrastructure>) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.destination.has_token() {
            infrastructure.dispatch().register(&config.destination);
        }
        Ok(Self::bound(config, Some(infrastructure)))
    }

    /// Logger bound to the process-wide [`Infrastructure::instance`].
    pub fn with_global_infrastructure(config: NotifierConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::bound(config, None))
    }

    /// Process-wide default logger, configured from the environment on first
    /// use. It lives for the rest of the process.
    pub fn global() -> &'static Logger {
        GLOBAL_LOGGER.get_or_init(|| Self::bound(NotifierConfig::from_env(), None))
    }

    fn bound(config: NotifierConfig, infrastructure: Option<Arc<Infrastructure>>) -> Self {
        Self {
            config: RwLock::new(config),
            infrastructure,
        }
    }

    fn infrastructure(&self) -> Result<Arc<Infrastructure>, ConfigError> {
        match &self.infrastructure {
            Some(infrastructure) => Ok(Arc::clone(infrastructure)),
            None => Infrastructure::instance(),
        }
    }

    pub fn config(&self) -> NotifierConfig {
        self.config.read().clone()
    }

    pub fn destination(&self) -> Destination {
        self.config.read().destination.clone()
    }

    /// The telemetry ring buffer payloads of this logger draw from.
    pub fn telemetry(&self) -> Option<Arc<TelemetryCollector>> {
        self.infrastructure().ok().map(|i| Arc::clone(i.telemetry()))
    }

    /// Record an ambient telemetry event.
    pub fn capture(&self, event: TelemetryEvent) {
        if let Some(telemetry) = self.telemetry() {
            telemetry.capture(event);
        }
    }

    /// Validate and apply new settings. Bundles already queued keep the
    /// destination they were created with.
    pub fn configure(&self, config: NotifierConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let infrastructure = self.infrastructure()?;
        self.config.write().apply(&config);
        if config.destination.has_token() {
            infrastructure.dispatch().register(&config.destination);
        }
        debug!(destination = %config.destination, "logger reconfigured");
        infrastructure.events().publish(InternalEvent::Reconfigured {
            destination: config.destination,
        });
        Ok(())
    }

    /// Report `reportable` at `level` with optional custom data.
    ///
    /// **Returns**
    /// - `Ok(handle)`: queued (or filtered out, in which case the handle is
    ///   empty).
    /// - `Err(LogError::Rethrown(err))`: `rethrow_after_reporting` is on and
    ///   `reportable` carried an error; it was reported, here it is back.
    pub fn log(
        &self,
        level: ErrorLevel,
        reportable: impl Into<Reportable>,
        custom: Option<CustomData>,
    ) -> Result<LogHandle, LogError> {
        self.submit(level, reportable.into(), custom.unwrap_or_default(), None)
    }

    pub fn log_error<E>(&self, level: ErrorLevel, err: E) -> Result<LogHandle, LogError>
    where
        E: Error + Send + Sync + 'static,
    {
        self.log(level, Reportable::error(err), None)
    }

    pub fn critical(&self, reportable: impl Into<Reportable>) -> Result<LogHandle, LogError> {
        self.log(ErrorLevel::Critical, reportable, None)
    }

    pub fn error(&self, reportable: impl Into<Reportable>) -> Result<LogHandle, LogError> {
        self.log(ErrorLevel::Error, reportable, None)
    }

    pub fn warning(&self, reportable: impl Into<Reportable>) -> Result<LogHandle, LogError> {
        self.log(ErrorLevel::Warning, reportable, None)
    }

    pub fn info(&self, reportable: impl Into<Reportable>) -> Result<LogHandle, LogError> {
        self.log(ErrorLevel::Info, reportable, None)
    }

    pub fn debug(&self, reportable: impl Into<Reportable>) -> Result<LogHandle, LogError> {
        self.log(ErrorLevel::Debug, reportable, None)
    }

    /// A view of this logger whose calls wait up to `timeout` for the
    /// delivery outcome.
    pub fn as_blocking(&self, timeout: Duration) -> BlockingLogger<'_> {
        BlockingLogger { logger: self, timeout }
    }

    fn submit(
        &self,
        level: ErrorLevel,
        reportable: Reportable,
        custom: CustomData,
        timeout: Option<Duration>,
    ) -> Result<LogHandle, LogError> {
        let config = self.config();
        if !config.enabled || !config.destination.has_token() || level < config.min_level {
            return Ok(LogHandle::empty());
        }

        let infrastructure = match self.infrastructure() {
            Ok(infrastructure) => infrastructure,
            Err(err) => {
                warn!(error = %err, "notifier infrastructure unavailable, payload discarded");
                return Ok(LogHandle::empty());
            }
        };

        if config.rethrow_after_reporting {
            if let Some(original) = reportable.as_error() {
                let mut quiet = config;
                quiet.rethrow_after_reporting = false;
                let reporter = Self::bound(quiet, Some(Arc::clone(&infrastructure)));
                let outcome = reporter
                    .submit(level, reportable, custom, Some(RETHROW_REPORT_TIMEOUT))
                    .and_then(|handle| handle.wait(RETHROW_REPORT_TIMEOUT));
                debug!(?outcome, "reported error before handing it back");
                return Err(LogError::Rethrown(original));
            }
        }

        let scrub_fields = config.data_security.fields_to_scrub();
        let destination = config.destination;
        let telemetry = infrastructure
            .telemetry()
            .snapshot_recent(infrastructure.dispatch().telemetry_items());
        let built = panic::catch_unwind(AssertUnwindSafe(|| {
            build_bundle(destination.clone(), level, reportable, custom, telemetry, timeout)
                .map(|bundle| bundle.with_scrub_fields(scrub_fields))
        }));
        let bundle = match built {
            Ok(Ok(bundle)) => bundle,
            Ok(Err(err)) => return Ok(bundling_failed(&infrastructure, destination, err.to_string())),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                return Ok(bundling_failed(&infrastructure, destination, message));
            }
        };

        let handle = LogHandle::enqueued(bundle.id, bundle.completion());
        infrastructure.dispatch().enqueue(bundle);
        Ok(handle)
    }
}

fn build_bundle(
    destination: Destination,
    level: ErrorLevel,
    reportable: Reportable,
    custom: CustomData,
    telemetry: Vec<TelemetryEvent>,
    timeout: Option<Duration>,
) -> Result<PayloadBundle, BoxError> {
    let body = match reportable {
        Reportable::Package(mut package) if package.must_apply_synchronously() => {
            BundleBody::Packaged(package.package_as_data()?)
        }
        other => BundleBody::Pending(other),
    };
    Ok(PayloadBundle::new(destination, level, body, custom, telemetry, timeout))
}

fn bundling_failed(infrastructure: &Infrastructure, destination: Destination, message: String) -> LogHandle {
    warn!(destination = %destination, error = %message, "failed to build payload");
    infrastructure.events().publish(InternalEvent::BundlingError {
        destination,
        bundle_id: None,
        message,
    });
    LogHandle::empty()
}

/// Blocking view of a [`Logger`] returned by [`Logger::as_blocking`].
///
/// Each call waits for the bundle's terminal outcome up to the timeout and
/// returns [`LogError::Timeout`] when it elapses. Delivery carries on in the
/// background either way.
pub struct BlockingLogger<'a> {
    logger: &'a Logger,
    timeout: Duration,
}

impl BlockingLogger<'_> {
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `Ok(None)` when the call was filtered out.
    pub fn log(
        &self,
        level: ErrorLevel,
        reportable: impl Into<Reportable>,
        custom: Option<CustomData>,
    ) -> Result<Option<DeliveryOutcome>, LogError> {
        let handle = self.logger.submit(
            level,
            reportable.into(),
            custom.unwrap_or_default(),
            Some(self.timeout),
        )?;
        handle.wait(self.timeout)
    }

    pub fn log_error<E>(&self, level: ErrorLevel, err: E) -> Result<Option<DeliveryOutcome>, LogError>
    where
        E: Error + Send + Sync + 'static,
    {
        self.log(level, Reportable::error(err), None)
    }

    pub fn critical(&self, reportable: impl Into<Reportable>) -> Result<Option<DeliveryOutcome>, LogError> {
        self.log(ErrorLevel::Critical, reportable, None)
    }

    pub fn error(&self, reportable: impl Into<Reportable>) -> Result<Option<DeliveryOutcome>, LogError> {
        self.log(ErrorLevel::Error, reportable, None)
    }

    pub fn warning(&self, reportable: impl Into<Reportable>) -> Result<Option<DeliveryOutcome>, LogError> {
        self.log(ErrorLevel::Warning, reportable, None)
    }

    pub fn info(&self, reportable: impl Into<Reportable>) -> Result<Option<DeliveryOutcome>, LogError> {
        self.log(ErrorLevel::Info, reportable, None)
    }

    pub fn debug(&self, reportable: impl Into<Reportable>) -> Result<Option<DeliveryOutcome>, LogError> {
        self.log(ErrorLevel::Debug, reportable, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InfrastructureConfig;
    use crate::events::EventKind;
    use crate::payload::PayloadPackage;
    use crate::probe::StaticProbe;
    use crate::transport::NoopTransport;

    fn infra() -> Arc<Infrastructure> {
        Infrastructure::builder(InfrastructureConfig::default())
            .transport(Arc::new(NoopTransport))
            .probe(Arc::new(StaticProbe::new(true)))
            .build()
            .unwrap()
    }

    struct Exploding;

    impl PayloadPackage for Exploding {
        fn package_as_data(&mut self) -> Result<Value, BoxError> {
            Err("cannot package".into())
        }

        fn must_apply_synchronously(&self) -> bool {
            true
        }
    }

    struct Panicking;

    impl PayloadPackage for Panicking {
        fn package_as_data(&mut self) -> Result<Value, BoxError> {
            panic!("package blew up")
        }

        fn must_apply_synchronously(&self) -> bool {
            true
        }
    }

    #[test]
    fn blank_token_is_a_noop() {
        let logger = Logger::new(NotifierConfig::new("  "), infra()).unwrap();
        assert!(logger.error("ignored").unwrap().is_empty());
    }

    #[test]
    fn below_min_level_is_a_noop() {
        let config = NotifierConfig::new("tok").with_min_level(ErrorLevel::Error);
        let logger = Logger::new(config, infra()).unwrap();
        assert!(logger.info("ignored").unwrap().is_empty());
        assert!(!logger.critical("kept").unwrap().is_empty());
    }

    #[test]
    fn synchronous_packaging_failure_publishes_bundling_error() {
        let infra = infra();
        let mut events = infra.subscribe();
        let logger = Logger::new(NotifierConfig::new("tok"), Arc::clone(&infra)).unwrap();

        let handle = logger.error(Reportable::package(Exploding)).unwrap();
        assert!(handle.is_empty());
        let event = events.try_recv().unwrap();
        assert_eq!(event.kind(), EventKind::BundlingError);
    }

    #[test]
    fn panicking_package_does_not_escape() {
        let infra = infra();
        let mut events = infra.subscribe();
        let logger = Logger::new(NotifierConfig::new("tok"), Arc::clone(&infra)).unwrap();

        let handle = logger.error(Reportable::package(Panicking)).unwrap();
        assert!(handle.is_empty());
        match events.try_recv().unwrap() {
            InternalEvent::BundlingError { message, .. } => assert!(message.contains("package blew up")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn configure_rejects_blank_environment_and_keeps_old_settings() {
        let logger = Logger::new(NotifierConfig::new("tok"), infra()).unwrap();
        let bad = NotifierConfig::new("other").with_environment(" ");
        assert!(logger.configure(bad).is_err());
        assert_eq!(logger.destination().access_token, "tok");
    }

    #[test]
    fn configure_publishes_reconfigured() {
        let infra = infra();
        let mut events = infra.subscribe();
        let logger = Logger::new(NotifierConfig::new("tok"), Arc::clone(&infra)).unwrap();
        logger
            .configure(NotifierConfig::new("tok").with_environment("staging"))
            .unwrap();
        assert_eq!(events.try_recv().unwrap().kind(), EventKind::Reconfigured);
        assert_eq!(logger.destination().environment, "staging");
    }

    #[test]
    fn blocking_call_reports_delivery() {
        let logger = Logger::new(NotifierConfig::new("tok"), infra()).unwrap();
        let outcome = logger.as_blocking(Duration::from_secs(5)).error("sync").unwrap();
        assert_eq!(outcome, Some(DeliveryOutcome::Delivered));
    }
}
