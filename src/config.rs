use crate::env;
use crate::error::ConfigError;
use crate::level::ErrorLevel;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default ingestion API root. Items are posted to `{endpoint}item/`.
pub const DEFAULT_ENDPOINT: &str = "https://api.rollbar.com/api/1/";

/// Environment name used when none is configured.
pub const DEFAULT_ENVIRONMENT: &str = "production";

/// Where payloads go: the unit of queue isolation.
///
/// Two loggers configured with the same access token and environment share
/// one dispatch queue; everything else about them may differ.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub access_token: String,
    pub environment: String,
}

impl Destination {
    pub fn new(access_token: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            environment: environment.into(),
        }
    }

    pub fn has_token(&self) -> bool {
        !self.access_token.trim().is_empty()
    }

    /// Stable name used for per-destination storage (sled tree names).
    pub fn storage_key(&self) -> String {
        format!("{}\u{1f}{}", self.access_token, self.environment)
    }

    /// Short tokens are masked entirely; longer ones keep a 4 char prefix.
    fn masked_token(&self) -> String {
        if self.access_token.chars().count() <= 8 {
            return "****".to_string();
        }
        let visible: String = self.access_token.chars().take(4).collect();
        format!("{}…", visible)
    }
}

// Keeps access tokens out of log lines.
impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("access_token", &self.masked_token())
            .field("environment", &self.environment)
            .finish()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.masked_token(), self.environment)
    }
}

/// Keys scrubbed by default: credentials and tokens.
pub const DEFAULT_SCRUB_FIELDS: &[&str] = &[
    "passwd",
    "password",
    "secret",
    "confirm_password",
    "password_confirmation",
    "accessToken",
    "access_token",
    "auth",
    "authentication",
    "authorization",
];

/// Which payload keys get masked before a payload leaves the process.
///
/// A key listed in both `scrub_fields` and `scrub_safelist_fields` is kept.
#[derive(Clone, Debug, PartialEq)]
pub struct DataSecurityOptions {
    pub scrub_fields: Vec<String>,
    pub scrub_safelist_fields: Vec<String>,
}

impl DataSecurityOptions {
    /// `scrub_fields` minus the safelist.
    pub fn fields_to_scrub(&self) -> Vec<String> {
        self.scrub_fields
            .iter()
            .filter(|f| !self.scrub_safelist_fields.iter().any(|s| s.eq_ignore_ascii_case(f)))
            .cloned()
            .collect()
    }

    pub fn apply(&mut self, other: &DataSecurityOptions) {
        self.scrub_fields = other.scrub_fields.clone();
        self.scrub_safelist_fields = other.scrub_safelist_fields.clone();
    }
}

impl Default for DataSecurityOptions {
    fn default() -> Self {
        Self {
            scrub_fields: DEFAULT_SCRUB_FIELDS.iter().map(|f| f.to_string()).collect(),
            scrub_safelist_fields: Vec::new(),
        }
    }
}

/// Per-logger settings.
///
/// **Fields**
/// - `destination`: access token + environment the payloads are sent to.
/// - `enabled`: master switch; when `false`, logging calls are no-ops.
/// - `min_level`: events below this level are ignored.
/// - `rethrow_after_reporting`: development aid; errors are reported
///   synchronously and then handed back to the caller as
///   [`LogError::Rethrown`](crate::error::LogError::Rethrown).
/// - `data_security`: keys masked in every payload of this logger.
#[derive(Clone, Debug, PartialEq)]
pub struct NotifierConfig {
    pub destination: Destination,
    pub enabled: bool,
    pub min_level: ErrorLevel,
    pub rethrow_after_reporting: bool,
    pub data_security: DataSecurityOptions,
}

impl NotifierConfig {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            destination: Destination::new(access_token, DEFAULT_ENVIRONMENT),
            enabled: true,
            min_level: ErrorLevel::Debug,
            rethrow_after_reporting: false,
            data_security: DataSecurityOptions::default(),
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.destination.environment = environment.into();
        self
    }

    pub fn with_min_level(mut self, level: ErrorLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Build from `NOTIFIER_ACCESS_TOKEN` / `NOTIFIER_ENVIRONMENT`.
    pub fn from_env() -> Self {
        let token = env::env_or(env::NOTIFIER_ACCESS_TOKEN_ENV, "");
        let environment = env::env_or(env::NOTIFIER_ENVIRONMENT_ENV, DEFAULT_ENVIRONMENT);
        let mut config = Self::new(token).with_environment(environment);
        if let Ok(level) = env::env_or(env::NOTIFIER_MIN_LEVEL_ENV, "debug").parse() {
            config.min_level = level;
        }
        config
    }

    /// Copy every setting from `other` into `self`.
    pub fn apply(&mut self, other: &NotifierConfig) {
        self.destination = other.destination.clone();
        self.enabled = other.enabled;
        self.min_level = other.min_level;
        self.rethrow_after_reporting = other.rethrow_after_reporting;
        self.data_security.apply(&other.data_security);
    }

    /// A blank access token is allowed (it turns logging into a no-op); a
    /// blank environment is not.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.destination.environment.trim().is_empty() {
            return Err(ConfigError::BlankField("environment"));
        }
        Ok(())
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Queue and drain-loop tuning.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchOptions {
    /// Bundles a destination queue may hold before the oldest unattempted one is dropped.
    pub max_queue_depth: usize,
    /// Period of the offline replay tick.
    pub replay_interval: Duration,
    /// Upper bound of records pulled back from the offline store per tick.
    pub replay_batch_size: usize,
    /// Threads of the dedicated dispatch runtime.
    pub worker_threads: usize,
    /// How long shutdown waits for drain loops to park their queues.
    pub shutdown_timeout: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_queue_depth: 256,
            replay_interval: Duration::from_secs(5),
            replay_batch_size: 10,
            worker_threads: 2,
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

/// Retry policy for recoverable transmission failures.
///
/// Live attempts and offline replays share `max_attempts`.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryOptions {
    /// Attempts (live + replays) before a payload is omitted.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Pause applied on 429 when the endpoint does not say how long to wait.
    pub rate_limit_backoff: Duration,
}

impl RetryOptions {
    /// Exponential backoff for the given (1-based) attempt, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            rate_limit_backoff: Duration::from_secs(30),
        }
    }
}

/// Ambient telemetry ring buffer settings.
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryOptions {
    pub enabled: bool,
    /// Ring buffer capacity.
    pub queue_depth: usize,
    /// Most recent items attached to each outgoing payload.
    pub max_items: usize,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_depth: 5,
            max_items: 5,
        }
    }
}

/// Durable offline store settings.
#[derive(Clone, Debug, PartialEq)]
pub struct OfflineStoreOptions {
    pub enabled: bool,
    pub path: PathBuf,
    pub max_records_per_destination: usize,
}

impl Default for OfflineStoreOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from(env::env_or(
                env::NOTIFIER_OFFLINE_STORE_PATH_ENV,
                "./.notifier-store",
            )),
            max_records_per_destination: 1000,
        }
    }
}

/// HTTP and connectivity settings shared by every destination.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportOptions {
    /// API root, e.g. `https://api.rollbar.com/api/1/`.
    pub endpoint: String,
    pub request_timeout: Duration,
    /// Address the connectivity probe connects to.
    pub probe_address: SocketAddr,
    pub probe_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            endpoint: env::env_or(env::NOTIFIER_ENDPOINT_ENV, DEFAULT_ENDPOINT),
            request_timeout: Duration::from_secs(10),
            probe_address: SocketAddr::from(([8, 8, 8, 8], 53)),
            probe_timeout: Duration::from_millis(500),
        }
    }
}

/// Process-wide settings owned by [`Infrastructure`](crate::infrastructure::Infrastructure).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InfrastructureConfig {
    pub dispatch: DispatchOptions,
    pub retry: RetryOptions,
    pub telemetry: TelemetryOptions,
    pub offline_store: OfflineStoreOptions,
    pub transport: TransportOptions,
}

impl InfrastructureConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = self.transport.endpoint.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(ConfigError::InvalidEndpoint(self.transport.endpoint.clone()));
        }
        if self.dispatch.max_queue_depth == 0 {
            return Err(ConfigError::ZeroValue("dispatch.max_queue_depth"));
        }
        if self.dispatch.replay_batch_size == 0 {
            return Err(ConfigError::ZeroValue("dispatch.replay_batch_size"));
        }
        if self.dispatch.worker_threads == 0 {
            return Err(ConfigError::ZeroValue("dispatch.worker_threads"));
        }
        if self.dispatch.replay_interval.is_zero() {
            return Err(ConfigError::ZeroValue("dispatch.replay_interval"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroValue("retry.max_attempts"));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::InvalidBackoff {
                base: self.retry.base_delay,
                max: self.retry.max_delay,
            });
        }
        if self.offline_store.enabled {
            if self.offline_store.path.as_os_str().is_empty() {
                return Err(ConfigError::MissingStorePath);
            }
            if self.offline_store.max_records_per_destination == 0 {
                return Err(ConfigError::ZeroValue("offline_store.max_records_per_destination"));
            }
        }
        Ok(())
    }

    /// Copy every option group from `other` into `self`.
    pub fn apply(&mut self, other: &InfrastructureConfig) {
        self.dispatch = other.dispatch.clone();
        self.retry = other.retry.clone();
        self.telemetry = other.telemetry.clone();
        self.offline_store = other.offline_store.clone();
        self.transport = other.transport.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_infrastructure_config_is_valid() {
        assert!(InfrastructureConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_http_endpoint() {
        let mut config = InfrastructureConfig::default();
        config.transport.endpoint = "ftp://example.com".into();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidEndpoint(_))));
    }

    #[test]
    fn rejects_inverted_backoff() {
        let mut config = InfrastructureConfig::default();
        config.retry.base_delay = Duration::from_secs(10);
        config.retry.max_delay = Duration::from_secs(1);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBackoff { .. })));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryOptions {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3), Duration::from_millis(400));
        assert_eq!(retry.delay_for(4), Duration::from_millis(500));
        assert_eq!(retry.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn apply_copies_every_field() {
        let mut live = NotifierConfig::new("old");
        let mut source = NotifierConfig::new("new").with_environment("staging");
        source.enabled = false;
        source.min_level = ErrorLevel::Error;
        source.rethrow_after_reporting = true;
        source.data_security.scrub_safelist_fields = vec!["auth".into()];
        live.apply(&source);
        assert_eq!(live, source);
    }

    #[test]
    fn blank_environment_is_invalid() {
        let config = NotifierConfig::new("token").with_environment("  ");
        assert_eq!(config.validate(), Err(ConfigError::BlankField("environment")));
    }

    #[test]
    fn debug_output_masks_token() {
        let dest = Destination::new("abcdef123456", "prod");
        let rendered = format!("{:?}", dest);
        assert!(!rendered.contains("abcdef123456"));
        assert!(rendered.contains("abcd"));
    }

    #[test]
    fn short_tokens_are_fully_masked() {
        let dest = Destination::new("abc", "prod");
        assert!(!format!("{:?}", dest).contains("abc"));
        assert_eq!(dest.to_string(), "****@prod");
    }

    #[test]
    fn safelisted_fields_are_not_scrubbed() {
        let options = DataSecurityOptions {
            scrub_fields: vec!["password".into(), "auth".into(), "token".into()],
            scrub_safelist_fields: vec!["AUTH".into()],
        };
        assert_eq!(options.fields_to_scrub(), vec!["password".to_string(), "token".to_string()]);
        assert!(DataSecurityOptions::default().fields_to_scrub().contains(&"password".to_string()));
    }
}
