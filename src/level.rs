use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Severity of a reported event.
///
/// Ordering follows severity, so `ErrorLevel::Critical > ErrorLevel::Debug`
/// and a minimum-level filter is a plain `level < min_level` comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl ErrorLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorLevel::Debug => "debug",
            ErrorLevel::Info => "info",
            ErrorLevel::Warning => "warning",
            ErrorLevel::Error => "error",
            ErrorLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<tracing::Level> for ErrorLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::ERROR => ErrorLevel::Error,
            tracing::Level::WARN => ErrorLevel::Warning,
            tracing::Level::INFO => ErrorLevel::Info,
            _ => ErrorLevel::Debug,
        }
    }
}

/// Error returned when parsing an unknown level name.
#[derive(thiserror::Error, Debug)]
#[error("unknown error level: {0}")]
pub struct ParseLevelError(pub String);

impl FromStr for ErrorLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(ErrorLevel::Debug),
            "info" => Ok(ErrorLevel::Info),
            "warning" | "warn" => Ok(ErrorLevel::Warning),
            "error" => Ok(ErrorLevel::Error),
            "critical" | "fatal" => Ok(ErrorLevel::Critical),
            other => Err(ParseLevelError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_severity() {
        assert!(ErrorLevel::Critical > ErrorLevel::Error);
        assert!(ErrorLevel::Error > ErrorLevel::Warning);
        assert!(ErrorLevel::Warning > ErrorLevel::Info);
        assert!(ErrorLevel::Info > ErrorLevel::Debug);
    }

    #[test]
    fn maps_tracing_levels() {
        assert_eq!(ErrorLevel::from(tracing::Level::ERROR), ErrorLevel::Error);
        assert_eq!(ErrorLevel::from(tracing::Level::WARN), ErrorLevel::Warning);
        assert_eq!(ErrorLevel::from(tracing::Level::TRACE), ErrorLevel::Debug);
    }

    #[test]
    fn parses_aliases() {
        assert_eq!("WARN".parse::<ErrorLevel>().unwrap(), ErrorLevel::Warning);
        assert_eq!("critical".parse::<ErrorLevel>().unwrap(), ErrorLevel::Critical);
        assert!("loud".parse::<ErrorLevel>().is_err());
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&ErrorLevel::Warning).unwrap();
        assert_eq!(json, "\"warning\"");
    }
}
