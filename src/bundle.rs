use crate::config::Destination;
use crate::error::{BoxError, LogError};
use crate::level::ErrorLevel;
use crate::payload::{self, PayloadParts, Reportable};
use crate::store::StoredRecord;
use crate::telemetry::TelemetryEvent;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Terminal fate of a bundle, as reported to a waiting caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The endpoint answered 2xx.
    Delivered,
    /// The endpoint refused the payload with this 4xx status.
    Rejected(u16),
    /// Live delivery failed; the payload now lives in the offline store.
    Persisted,
    /// Retries exhausted.
    Omitted,
    /// Evicted from a full queue or lost at shutdown.
    Dropped,
    /// The payload could not be built.
    BundlingFailed,
}

/// One-shot completion flag a blocking caller can wait on.
///
/// The first `complete` wins; later calls are ignored.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    outcome: Mutex<Option<DeliveryOutcome>>,
    ready: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn complete(&self, outcome: DeliveryOutcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.ready.notify_all();
        }
    }

    pub fn outcome(&self) -> Option<DeliveryOutcome> {
        *self.outcome.lock()
    }

    /// Block the current thread until completed or `timeout` elapses.
    pub fn wait_for(&self, timeout: Duration) -> Option<DeliveryOutcome> {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            let _ = self.ready.wait_while_for(&mut slot, |o| o.is_none(), timeout);
        }
        *slot
    }
}

/// What a logging call returns: possibly empty, optionally awaitable.
#[derive(Debug, Clone, Default)]
pub struct LogHandle {
    bundle_id: Option<Uuid>,
    signal: Option<Arc<CompletionSignal>>,
}

impl LogHandle {
    pub(crate) fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn enqueued(bundle_id: Uuid, signal: Option<Arc<CompletionSignal>>) -> Self {
        Self { bundle_id: Some(bundle_id), signal }
    }

    /// `true` when the call was filtered out and nothing was enqueued.
    pub fn is_empty(&self) -> bool {
        self.bundle_id.is_none()
    }

    pub fn bundle_id(&self) -> Option<Uuid> {
        self.bundle_id
    }

    pub fn outcome(&self) -> Option<DeliveryOutcome> {
        self.signal.as_ref().and_then(|s| s.outcome())
    }

    /// Wait for the bundle's terminal outcome. Fire-and-forget handles (and
    /// empty ones) have nothing to wait on and return `Ok(None)` immediately.
    pub fn wait(&self, timeout: Duration) -> Result<Option<DeliveryOutcome>, LogError> {
        match &self.signal {
            None => Ok(None),
            Some(signal) => signal
                .wait_for(timeout)
                .map(Some)
                .ok_or(LogError::Timeout(timeout)),
        }
    }
}

pub(crate) enum BundleBody {
    /// Rendered lazily on the drain worker.
    Pending(Reportable),
    /// Already packaged on the caller's thread.
    Packaged(Value),
    /// Final wire bytes; retries and replays resend these unchanged.
    Serialized(Vec<u8>),
}

/// A captured event plus its delivery metadata: the unit of work of the
/// dispatch queues.
pub struct PayloadBundle {
    pub id: Uuid,
    pub destination: Destination,
    pub level: ErrorLevel,
    pub(crate) body: BundleBody,
    pub custom: BTreeMap<String, Value>,
    pub telemetry: Vec<TelemetryEvent>,
    pub created_at: DateTime<Utc>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub(crate) completion: Option<Arc<CompletionSignal>>,
    pub attempt_count: u32,
    /// Set once the bundle went out on the wire, whatever the answer was.
    pub(crate) attempted: bool,
    /// Keys masked in `body` and `custom` when the payload is rendered.
    pub(crate) scrub_fields: Vec<String>,
    /// Set when this bundle is a replay of an offline record.
    pub(crate) stored: Option<StoredRecord>,
}

impl PayloadBundle {
    pub(crate) fn new(
        destination: Destination,
        level: ErrorLevel,
        body: BundleBody,
        custom: BTreeMap<String, Value>,
        telemetry: Vec<TelemetryEvent>,
        timeout: Option<Duration>,
    ) -> Self {
        let created_at = Utc::now();
        let timeout_at = timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|t| created_at + t);
        Self {
            id: Uuid::new_v4(),
            destination,
            level,
            body,
            custom,
            telemetry,
            created_at,
            timeout_at,
            completion: timeout.map(|_| CompletionSignal::new()),
            attempt_count: 0,
            attempted: false,
            scrub_fields: Vec::new(),
            stored: None,
        }
    }

    pub(crate) fn with_scrub_fields(mut self, fields: Vec<String>) -> Self {
        self.scrub_fields = fields;
        self
    }

    /// Rebuild a bundle from an offline record; its bytes are sent as-is.
    pub(crate) fn from_record(record: StoredRecord) -> Self {
        Self {
            id: Uuid::new_v4(),
            destination: record.destination.clone(),
            level: ErrorLevel::Debug,
            body: BundleBody::Serialized(record.payload.clone()),
            custom: BTreeMap::new(),
            telemetry: Vec::new(),
            created_at: record.enqueued_at,
            timeout_at: None,
            completion: None,
            attempt_count: record.attempt_count,
            attempted: true,
            scrub_fields: Vec::new(),
            stored: Some(record),
        }
    }

    /// Stand-in for a bundle whose owner is mid-delivery: same id, signal and
    /// rendered bytes, so shutdown can park it if the owner never returns.
    pub(crate) fn in_flight_copy(&self, payload: &[u8]) -> Self {
        Self {
            id: self.id,
            destination: self.destination.clone(),
            level: self.level,
            body: BundleBody::Serialized(payload.to_vec()),
            custom: BTreeMap::new(),
            telemetry: Vec::new(),
            created_at: self.created_at,
            timeout_at: self.timeout_at,
            completion: self.completion.clone(),
            attempt_count: self.attempt_count,
            attempted: self.attempted,
            scrub_fields: Vec::new(),
            stored: self.stored.clone(),
        }
    }

    pub(crate) fn completion(&self) -> Option<Arc<CompletionSignal>> {
        self.completion.clone()
    }

    /// Never sent and not a replay: the only kind backpressure may evict.
    pub fn is_fresh(&self) -> bool {
        !self.attempted && self.attempt_count == 0 && self.stored.is_none()
    }

    pub fn was_attempted(&self) -> bool {
        self.attempted
    }

    pub fn is_replay(&self) -> bool {
        self.stored.is_some()
    }

    /// Render the wire payload once and cache it, so every later attempt
    /// sends identical bytes.
    pub fn serialize(&mut self, telemetry_items: usize) -> Result<&[u8], BoxError> {
        let body = std::mem::replace(&mut self.body, BundleBody::Serialized(Vec::new()));
        let bytes = match body {
            BundleBody::Serialized(bytes) => bytes,
            BundleBody::Packaged(value) => self.render(value, telemetry_items)?,
            BundleBody::Pending(reportable) => {
                let value = reportable.into_body()?;
                self.render(value, telemetry_items)?
            }
        };
        self.body = BundleBody::Serialized(bytes);
        match &self.body {
            BundleBody::Serialized(bytes) => Ok(bytes),
            _ => unreachable!("body was just serialized"),
        }
    }

    fn render(&self, body: Value, telemetry_items: usize) -> Result<Vec<u8>, BoxError> {
        let skip = self.telemetry.len().saturating_sub(telemetry_items);
        let bytes = payload::render(PayloadParts {
            destination: &self.destination,
            level: self.level,
            uuid: self.id,
            created_at: self.created_at,
            body,
            custom: &self.custom,
            telemetry: &self.telemetry[skip..],
            scrub_fields: &self.scrub_fields,
        })?;
        Ok(bytes)
    }

    pub(crate) fn complete(&self, outcome: DeliveryOutcome) {
        if let Some(signal) = &self.completion {
            signal.complete(outcome);
        }
    }
}
