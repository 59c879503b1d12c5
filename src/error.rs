use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// Shared handle to a caller-supplied error.
pub type SharedError = Arc<dyn Error + Send + Sync + 'static>;

/// Boxed error used at trait seams (payload packages, transports).
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Error type returned when validating or applying configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("endpoint must be an absolute http(s) url, got {0:?}")]
    InvalidEndpoint(String),

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("{0} must not be blank")]
    BlankField(&'static str),

    #[error("retry max_delay ({max:?}) is shorter than base_delay ({base:?})")]
    InvalidBackoff { base: Duration, max: Duration },

    #[error("offline store is enabled but no storage path was configured")]
    MissingStorePath,

    #[error("offline store could not be opened: {0}")]
    StoreUnavailable(String),

    #[error("dispatch runtime could not be started: {0}")]
    Runtime(String),

    #[error("process-wide infrastructure is already initialized")]
    AlreadyInitialized,
}

/// Error type produced by a [`Transport`](crate::transport::Transport)
/// when no HTTP response could be obtained.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid endpoint url: {0}")]
    InvalidEndpoint(String),
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_builder() {
            TransportError::InvalidEndpoint(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

/// Error type returned by [`OfflineStore`](crate::store::OfflineStore)
/// implementations.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("failed to encode offline record: {0}")]
    Encode(String),

    #[error("failed to decode offline record: {0}")]
    Decode(String),
}

#[cfg(feature = "offline-store")]
impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Caller-visible failure of a logging call.
#[derive(thiserror::Error, Debug, Clone)]
pub enum LogError {
    /// The blocking form gave up waiting. Delivery continues in the background.
    #[error("payload was not delivered within {0:?}")]
    Timeout(Duration),

    /// `rethrow_after_reporting` is on: the error was reported and is handed back.
    #[error("{0}")]
    Rethrown(SharedError),
}

impl LogError {
    /// Returns the original error for the rethrow path.
    pub fn into_rethrown(self) -> Option<SharedError> {
        match self {
            LogError::Rethrown(err) => Some(err),
            LogError::Timeout(_) => None,
        }
    }
}
