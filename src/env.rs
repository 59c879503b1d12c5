//! Environment variable names used by this crate for convenient
//! configuration of the notifier from services.
//!
//! These are purely helpers; the config types stay usable without any
//! environment access.

/// Access token of the default destination.
pub const NOTIFIER_ACCESS_TOKEN_ENV: &str = "NOTIFIER_ACCESS_TOKEN";

/// Environment name of the default destination, e.g. `staging`.
pub const NOTIFIER_ENVIRONMENT_ENV: &str = "NOTIFIER_ENVIRONMENT";

/// Minimum reported level (`debug`, `info`, `warning`, `error`, `critical`).
pub const NOTIFIER_MIN_LEVEL_ENV: &str = "NOTIFIER_MIN_LEVEL";

/// API root of the ingestion endpoint.
pub const NOTIFIER_ENDPOINT_ENV: &str = "NOTIFIER_ENDPOINT";

/// Directory of the durable offline store.
pub const NOTIFIER_OFFLINE_STORE_PATH_ENV: &str = "NOTIFIER_OFFLINE_STORE_PATH";

/// Read an environment variable or fall back to a provided default.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
