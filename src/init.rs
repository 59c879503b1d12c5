use crate::layer::NotifierLayer;
use crate::level::ErrorLevel;
use crate::logger::Logger;
use std::sync::Arc;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

/// Settings of the notifier layer installed by [`init_tracing_with_config`].
///
/// **Fields**
/// - `report_level`: events at or above this level are reported as payloads.
/// - `telemetry_level`: events at or above this level are recorded as ambient
///   telemetry; `None` disables capture.
/// - `enable_stdout`: if `true`, a `tracing_subscriber::fmt::Layer` is added
///   on top of [`NotifierLayer`] and events are printed to the console too.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub report_level: ErrorLevel,
    pub telemetry_level: Option<ErrorLevel>,
    pub enable_stdout: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            report_level: ErrorLevel::Error,
            telemetry_level: Some(ErrorLevel::Info),
            enable_stdout: true,
        }
    }
}

/// Build the layer described by `config` around `logger`.
pub fn notifier_layer(logger: Arc<Logger>, config: &LayerConfig) -> NotifierLayer {
    NotifierLayer::new(logger)
        .with_report_level(config.report_level)
        .with_telemetry_level(config.telemetry_level)
}

/// Install a [`Registry`] + [`NotifierLayer`] (+ `fmt` layer) as the global
/// default subscriber.
///
/// **Parameters**
/// - `logger`: the [`Logger`] events are reported through.
/// - `config`: [`LayerConfig`] controlling what is reported and captured.
///
/// **Errors**
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing_with_config(logger: Arc<Logger>, config: LayerConfig) -> Result<(), SetGlobalDefaultError> {
    let layer = notifier_layer(logger, &config);

    // The two subscriber shapes have different types, hence the two branches.
    if config.enable_stdout {
        let fmt_layer = tracing_subscriber::fmt::layer();
        let subscriber = Registry::default().with(layer).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = Registry::default().with(layer);
        tracing::subscriber::set_global_default(subscriber)
    }
}

/// Equivalent to [`init_tracing_with_config`] with [`LayerConfig::default`].
pub fn init_tracing(logger: Arc<Logger>) -> Result<(), SetGlobalDefaultError> {
    init_tracing_with_config(logger, LayerConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_reports_errors_only() {
        let config = LayerConfig::default();
        assert_eq!(config.report_level, ErrorLevel::Error);
        assert_eq!(config.telemetry_level, Some(ErrorLevel::Info));
    }
}
