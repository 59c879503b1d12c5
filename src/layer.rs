use crate::level::ErrorLevel;
use crate::logger::{CustomData, Logger};
use crate::telemetry::TelemetryEvent;
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Events from this crate's own modules are never observed, so the notifier
/// cannot end up reporting its own delivery failures.
const OWN_TARGET: &str = "tracing_notifier";

/// `tracing_subscriber` layer that feeds a [`Logger`].
///
/// Every event at or above `telemetry_level` is recorded as ambient log
/// telemetry; events at or above `report_level` (by default only `ERROR`) are
/// reported as payloads. Reporting is a queue push, so application threads
/// never wait on the network.
pub struct NotifierLayer {
    logger: Arc<Logger>,
    report_level: ErrorLevel,
    telemetry_level: Option<ErrorLevel>,
    /// Total events seen by the layer (before filtering by level).
    pub total_events: Arc<AtomicU64>,
    /// Events handed to the logger as payloads.
    pub reported_events: Arc<AtomicU64>,
    /// Events recorded as telemetry.
    pub captured_events: Arc<AtomicU64>,
}

impl NotifierLayer {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self {
            logger,
            report_level: ErrorLevel::Error,
            telemetry_level: Some(ErrorLevel::Info),
            total_events: Arc::new(AtomicU64::new(0)),
            reported_events: Arc::new(AtomicU64::new(0)),
            captured_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Lowest level that gets reported as a payload.
    pub fn with_report_level(mut self, level: ErrorLevel) -> Self {
        self.report_level = level;
        self
    }

    /// Lowest level recorded as telemetry; `None` turns capture off.
    pub fn with_telemetry_level(mut self, level: Option<ErrorLevel>) -> Self {
        self.telemetry_level = level;
        self
    }
}

impl<S> Layer<S> for NotifierLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if meta.target().starts_with(OWN_TARGET) {
            return;
        }
        self.total_events.fetch_add(1, Ordering::Relaxed);

        let level = ErrorLevel::from(*meta.level());
        let report = level >= self.report_level;
        let capture = self.telemetry_level.map_or(false, |min| level >= min);
        if !report && !capture {
            return;
        }

        let mut fields = BTreeMap::new();
        let mut message: Option<String> = None;
        let mut visitor = FieldVisitor { fields: &mut fields, message: &mut message };
        event.record(&mut visitor);

        let text = message.unwrap_or_else(|| meta.name().to_string());

        if report {
            let mut custom: CustomData = fields;
            custom.insert("target".into(), meta.target().into());
            if let Some(module) = meta.module_path() {
                custom.insert("module_path".into(), module.into());
            }
            if let Some(file) = meta.file() {
                custom.insert("file".into(), file.into());
            }
            if let Some(line) = meta.line() {
                custom.insert("line".into(), line.into());
            }
            match self.logger.log(level, text.clone(), Some(custom)) {
                Ok(handle) if !handle.is_empty() => {
                    self.reported_events.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
        }

        // Captured after reporting, so a payload never carries its own event.
        if capture {
            self.logger.capture(TelemetryEvent::log(level, text));
            self.captured_events.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub struct FieldVisitor<'a> {
    pub fields: &'a mut BTreeMap<String, serde_json::Value>,
    pub message: &'a mut Option<String>,
}

impl<'a> Visit for FieldVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.fields.insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.fields.insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = Some(format!("{:?}", value));
        } else {
            self.fields.insert(field.name().to_string(), serde_json::Value::String(format!("{:?}", value)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InfrastructureConfig, NotifierConfig};
    use crate::infrastructure::Infrastructure;
    use crate::probe::StaticProbe;
    use crate::transport::NoopTransport;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Registry;

    fn setup() -> (Arc<Infrastructure>, Arc<Logger>) {
        let infra = Infrastructure::builder(InfrastructureConfig::default())
            .transport(Arc::new(NoopTransport))
            .probe(Arc::new(StaticProbe::new(true)))
            .build()
            .unwrap();
        let logger = Logger::new(NotifierConfig::new("tok"), Arc::clone(&infra)).unwrap();
        (infra, Arc::new(logger))
    }

    #[test]
    fn errors_are_reported_and_info_is_captured() {
        let (infra, logger) = setup();
        let layer = NotifierLayer::new(logger);
        let reported = Arc::clone(&layer.reported_events);
        let captured = Arc::clone(&layer.captured_events);
        let subscriber = Registry::default().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            // Targets default to this module's path, which the layer skips.
            tracing::debug!(target: "shop", "too quiet");
            tracing::info!(target: "shop", user = 7, "checkout started");
            tracing::error!(target: "shop", order = "A-1", "checkout failed");
        });

        assert_eq!(reported.load(Ordering::Relaxed), 1);
        assert_eq!(captured.load(Ordering::Relaxed), 2);
        let telemetry = infra.telemetry().snapshot();
        assert_eq!(telemetry.len(), 2);
    }

    #[test]
    fn own_events_are_ignored() {
        let (_infra, logger) = setup();
        let layer = NotifierLayer::new(logger);
        let total = Arc::clone(&layer.total_events);
        let subscriber = Registry::default().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "tracing_notifier::dispatch", "delivery failed");
        });

        assert_eq!(total.load(Ordering::Relaxed), 0);
    }
}
