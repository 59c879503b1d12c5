use crate::config::Destination;
use crate::error::{BoxError, SharedError};
use crate::level::ErrorLevel;
use crate::telemetry::TelemetryEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub const NOTIFIER_NAME: &str = env!("CARGO_PKG_NAME");
pub const NOTIFIER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Replacement written over scrubbed values.
pub const SCRUB_MASK: &str = "***";

/// Captured view of a caller-supplied error.
///
/// The message and `source()` chain are rendered eagerly so the background
/// worker never needs to touch the original value; the original is kept for
/// the rethrow path.
#[derive(Clone)]
pub struct ReportedError {
    pub class: String,
    pub message: String,
    /// Display strings of `source()` causes, outermost first.
    pub causes: Vec<String>,
    original: SharedError,
}

impl ReportedError {
    pub fn new<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        let class = short_type_name(std::any::type_name::<E>());
        Self::capture(class, Arc::new(err))
    }

    /// Capture an already shared error. The concrete type is unknown here, so
    /// `class` is taken from its `Debug` output.
    pub fn from_shared(err: SharedError) -> Self {
        let debug = format!("{:?}", err);
        let class = debug
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("Error")
            .to_string();
        Self::capture(class, err)
    }

    fn capture(class: String, original: SharedError) -> Self {
        let message = original.to_string();
        let mut causes = Vec::new();
        let mut source = original.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self { class, message, causes, original }
    }

    pub fn original(&self) -> SharedError {
        Arc::clone(&self.original)
    }

    fn to_body(&self) -> Value {
        if self.causes.is_empty() {
            return json!({ "trace": trace_entry(&self.class, &self.message) });
        }
        let mut chain = vec![trace_entry(&self.class, &self.message)];
        chain.extend(self.causes.iter().map(|c| trace_entry("Cause", c)));
        json!({ "trace_chain": chain })
    }
}

impl fmt::Debug for ReportedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportedError")
            .field("class", &self.class)
            .field("message", &self.message)
            .field("causes", &self.causes)
            .finish()
    }
}

fn trace_entry(class: &str, message: &str) -> Value {
    json!({
        "frames": [],
        "exception": { "class": class, "message": message },
    })
}

fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// A pre-built structured payload that knows how to render itself.
///
/// `package_as_data` returns the payload `body` object. Packages whose data
/// depends on transient state (current thread, stack) return `true` from
/// `must_apply_synchronously` and are rendered on the caller's thread.
pub trait PayloadPackage: Send + 'static {
    fn package_as_data(&mut self) -> Result<Value, BoxError>;

    fn must_apply_synchronously(&self) -> bool {
        false
    }

    /// The error this package wraps, if any.
    fn original_error(&self) -> Option<SharedError> {
        None
    }
}

/// The caller-supplied value of a logging call.
pub enum Reportable {
    Error(ReportedError),
    Message(String),
    Value(Value),
    Package(Box<dyn PayloadPackage>),
}

impl Reportable {
    pub fn error<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Reportable::Error(ReportedError::new(err))
    }

    pub fn package(package: impl PayloadPackage) -> Self {
        Reportable::Package(Box::new(package))
    }

    /// The error carried (or wrapped) by this value.
    pub fn as_error(&self) -> Option<SharedError> {
        match self {
            Reportable::Error(err) => Some(err.original()),
            Reportable::Package(package) => package.original_error(),
            Reportable::Message(_) | Reportable::Value(_) => None,
        }
    }

    /// Render the payload `body` object.
    pub fn into_body(self) -> Result<Value, BoxError> {
        match self {
            Reportable::Error(err) => Ok(err.to_body()),
            Reportable::Message(text) => Ok(json!({ "message": { "body": text } })),
            Reportable::Value(value) => Ok(json!({ "message": { "body": value } })),
            Reportable::Package(mut package) => package.package_as_data(),
        }
    }
}

impl fmt::Debug for Reportable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reportable::Error(err) => f.debug_tuple("Error").field(err).finish(),
            Reportable::Message(msg) => f.debug_tuple("Message").field(msg).finish(),
            Reportable::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Reportable::Package(_) => f.write_str("Package(..)"),
        }
    }
}

impl From<&str> for Reportable {
    fn from(text: &str) -> Self {
        Reportable::Message(text.to_string())
    }
}

impl From<String> for Reportable {
    fn from(text: String) -> Self {
        Reportable::Message(text)
    }
}

impl From<Value> for Reportable {
    fn from(value: Value) -> Self {
        Reportable::Value(value)
    }
}

impl From<ReportedError> for Reportable {
    fn from(err: ReportedError) -> Self {
        Reportable::Error(err)
    }
}

#[derive(Serialize)]
struct NotifierInfo {
    name: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct Data<'a> {
    environment: &'a str,
    level: ErrorLevel,
    timestamp: i64,
    platform: &'static str,
    language: &'static str,
    uuid: String,
    notifier: NotifierInfo,
    body: Value,
    #[serde(skip_serializing_if = "no_custom_data")]
    custom: &'a BTreeMap<String, Value>,
}

fn no_custom_data(custom: &&BTreeMap<String, Value>) -> bool {
    custom.is_empty()
}

#[derive(Serialize)]
struct Envelope<'a> {
    access_token: &'a str,
    data: Data<'a>,
}

/// Inputs of one wire payload.
pub struct PayloadParts<'a> {
    pub destination: &'a Destination,
    pub level: ErrorLevel,
    pub uuid: Uuid,
    pub created_at: DateTime<Utc>,
    pub body: Value,
    pub custom: &'a BTreeMap<String, Value>,
    pub telemetry: &'a [TelemetryEvent],
    /// Keys whose values are replaced by [`SCRUB_MASK`], case-insensitively,
    /// at any depth of `body` and `custom`.
    pub scrub_fields: &'a [String],
}

/// Mask every value stored under one of `fields`, at any depth.
pub fn scrub(value: &mut Value, fields: &[String]) {
    match value {
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if is_scrubbed(key, fields) {
                    *item = Value::String(SCRUB_MASK.to_string());
                } else {
                    scrub(item, fields);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                scrub(item, fields);
            }
        }
        _ => {}
    }
}

fn is_scrubbed(key: &str, fields: &[String]) -> bool {
    fields.iter().any(|f| f.eq_ignore_ascii_case(key))
}

/// Serialize the JSON document posted to the ingestion endpoint.
///
/// Telemetry goes into `data.body.telemetry`, custom fields into
/// `data.custom`. Scrubbing covers both; the envelope's access token is left
/// alone.
pub fn render(parts: PayloadParts<'_>) -> Result<Vec<u8>, serde_json::Error> {
    let mut body = parts.body;
    if !parts.telemetry.is_empty() {
        if let Value::Object(map) = &mut body {
            map.insert("telemetry".to_string(), serde_json::to_value(parts.telemetry)?);
        }
    }

    let mut custom = parts.custom.clone();
    if !parts.scrub_fields.is_empty() {
        scrub(&mut body, parts.scrub_fields);
        for (key, value) in custom.iter_mut() {
            if is_scrubbed(key, parts.scrub_fields) {
                *value = Value::String(SCRUB_MASK.to_string());
            } else {
                scrub(value, parts.scrub_fields);
            }
        }
    }

    let envelope = Envelope {
        access_token: &parts.destination.access_token,
        data: Data {
            environment: &parts.destination.environment,
            level: parts.level,
            timestamp: parts.created_at.timestamp(),
            platform: std::env::consts::OS,
            language: "rust",
            uuid: parts.uuid.to_string(),
            notifier: NotifierInfo {
                name: NOTIFIER_NAME,
                version: NOTIFIER_VERSION,
            },
            body,
            custom: &custom,
        },
    };
    serde_json::to_vec(&envelope)
}
