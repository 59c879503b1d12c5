pub mod level;
pub mod error;
pub mod env;
pub mod config;
pub mod events;
pub mod telemetry;
pub mod payload;
pub mod bundle;
pub mod store;
pub mod probe;
pub mod transport;
pub mod dispatch;
pub mod infrastructure;
pub mod logger;
pub mod layer;
pub mod init;

pub use bundle::{DeliveryOutcome, LogHandle};
pub use config::{
    DataSecurityOptions, Destination, DispatchOptions, InfrastructureConfig, NotifierConfig, OfflineStoreOptions,
    RetryOptions, TelemetryOptions, TransportOptions,
};
pub use error::{ConfigError, LogError, StoreError, TransportError};
pub use events::{EventKind, InternalEvent};
pub use infrastructure::Infrastructure;
pub use level::ErrorLevel;
pub use logger::{BlockingLogger, Logger};
pub use payload::{PayloadPackage, Reportable};
pub use telemetry::TelemetryEvent;
