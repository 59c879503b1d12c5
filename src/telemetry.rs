use crate::config::TelemetryOptions;
use crate::level::ErrorLevel;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

/// Where an ambient telemetry event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetrySource {
    Client,
    Server,
}

/// Kind-specific part of a telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "body", rename_all = "lowercase")]
pub enum TelemetryBody {
    Log {
        message: String,
    },
    Error {
        message: String,
    },
    Network {
        method: String,
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        start_timestamp_ms: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_timestamp_ms: Option<i64>,
    },
    Dom {
        element: String,
    },
    Navigation {
        from: String,
        to: String,
    },
    Manual {
        fields: BTreeMap<String, serde_json::Value>,
    },
}

/// One entry of the ambient telemetry ring buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub source: TelemetrySource,
    pub level: ErrorLevel,
    pub timestamp_ms: i64,
    #[serde(flatten)]
    pub body: TelemetryBody,
}

impl TelemetryEvent {
    pub fn new(source: TelemetrySource, level: ErrorLevel, body: TelemetryBody) -> Self {
        Self {
            source,
            level,
            timestamp_ms: Utc::now().timestamp_millis(),
            body,
        }
    }

    pub fn log(level: ErrorLevel, message: impl Into<String>) -> Self {
        Self::new(
            TelemetrySource::Client,
            level,
            TelemetryBody::Log { message: message.into() },
        )
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            TelemetrySource::Client,
            ErrorLevel::Error,
            TelemetryBody::Error { message: message.into() },
        )
    }

    pub fn network(
        method: impl Into<String>,
        url: impl Into<String>,
        status_code: Option<u16>,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self::new(
            TelemetrySource::Client,
            ErrorLevel::Info,
            TelemetryBody::Network {
                method: method.into(),
                url: url.into(),
                status_code,
                start_timestamp_ms: now,
                end_timestamp_ms: status_code.map(|_| now),
            },
        )
    }

    pub fn dom(element: impl Into<String>) -> Self {
        Self::new(
            TelemetrySource::Client,
            ErrorLevel::Info,
            TelemetryBody::Dom { element: element.into() },
        )
    }

    pub fn navigation(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(
            TelemetrySource::Client,
            ErrorLevel::Info,
            TelemetryBody::Navigation { from: from.into(), to: to.into() },
        )
    }

    pub fn manual(level: ErrorLevel, fields: BTreeMap<String, serde_json::Value>) -> Self {
        Self::new(TelemetrySource::Client, level, TelemetryBody::Manual { fields })
    }
}

struct RingState {
    enabled: bool,
    capacity: usize,
    items: VecDeque<TelemetryEvent>,
}

impl RingState {
    fn evict_to(&mut self, capacity: usize) {
        while self.items.len() > capacity {
            self.items.pop_front();
        }
    }
}

/// Fixed-capacity, thread-safe ring buffer of recent ambient events.
///
/// Producers call [`capture`](Self::capture) from any thread; the dispatch
/// side takes a [`snapshot`](Self::snapshot) when a payload is built. Both
/// only hold the lock long enough to touch the deque.
pub struct TelemetryCollector {
    state: Mutex<RingState>,
}

impl TelemetryCollector {
    pub fn new(options: &TelemetryOptions) -> Self {
        Self {
            state: Mutex::new(RingState {
                enabled: options.enabled,
                capacity: options.queue_depth,
                items: VecDeque::with_capacity(options.queue_depth),
            }),
        }
    }

    /// Record an event, evicting the oldest one when the buffer is full.
    /// No-op while telemetry is disabled.
    pub fn capture(&self, event: TelemetryEvent) {
        let mut state = self.state.lock();
        if !state.enabled || state.capacity == 0 {
            return;
        }
        let capacity = state.capacity;
        state.evict_to(capacity - 1);
        state.items.push_back(event);
    }

    /// Immutable copy of the buffer, oldest first.
    pub fn snapshot(&self) -> Vec<TelemetryEvent> {
        self.state.lock().items.iter().cloned().collect()
    }

    /// Most recent `max` events, oldest first.
    pub fn snapshot_recent(&self, max: usize) -> Vec<TelemetryEvent> {
        let state = self.state.lock();
        let skip = state.items.len().saturating_sub(max);
        state.items.iter().skip(skip).cloned().collect()
    }

    /// Switch capture on/off and resize. Shrinking drops the oldest excess
    /// entries right away; disabling keeps what is already buffered.
    pub fn reconfigure(&self, enabled: bool, capacity: usize) {
        let mut state = self.state.lock();
        state.enabled = enabled;
        state.capacity = capacity;
        state.evict_to(capacity);
    }

    pub fn apply_options(&self, options: &TelemetryOptions) {
        self.reconfigure(options.enabled, options.queue_depth);
    }

    pub fn flush(&self) {
        self.state.lock().items.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn collector(enabled: bool, depth: usize) -> TelemetryCollector {
        TelemetryCollector::new(&TelemetryOptions {
            enabled,
            queue_depth: depth,
            max_items: depth,
        })
    }

    fn messages(items: &[TelemetryEvent]) -> Vec<String> {
        items
            .iter()
            .map(|e| match &e.body {
                TelemetryBody::Log { message } => message.clone(),
                other => format!("{:?}", other),
            })
            .collect()
    }

    #[test]
    fn overflow_keeps_last_capacity_events_oldest_first() {
        let ring = collector(true, 4);
        for i in 0..7 {
            ring.capture(TelemetryEvent::log(ErrorLevel::Info, format!("e{}", i)));
        }
        assert_eq!(ring.len(), 4);
        assert_eq!(messages(&ring.snapshot()), vec!["e3", "e4", "e5", "e6"]);
    }

    #[test]
    fn disabled_capture_is_noop_and_keeps_count() {
        let ring = collector(true, 5);
        ring.capture(TelemetryEvent::log(ErrorLevel::Info, "kept"));
        ring.reconfigure(false, 5);
        ring.capture(TelemetryEvent::log(ErrorLevel::Info, "ignored"));
        assert_eq!(ring.len(), 1);
        assert_eq!(messages(&ring.snapshot()), vec!["kept"]);
    }

    #[test]
    fn shrinking_evicts_oldest_immediately() {
        let ring = collector(true, 10);
        for i in 0..10 {
            ring.capture(TelemetryEvent::log(ErrorLevel::Debug, format!("e{}", i)));
        }
        ring.reconfigure(true, 3);
        assert_eq!(messages(&ring.snapshot()), vec!["e7", "e8", "e9"]);
    }

    #[test]
    fn snapshot_is_detached_from_later_captures() {
        let ring = collector(true, 3);
        ring.capture(TelemetryEvent::log(ErrorLevel::Info, "a"));
        let snap = ring.snapshot();
        ring.capture(TelemetryEvent::log(ErrorLevel::Info, "b"));
        assert_eq!(snap.len(), 1);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn snapshot_recent_trims_from_the_front() {
        let ring = collector(true, 5);
        for i in 0..5 {
            ring.capture(TelemetryEvent::log(ErrorLevel::Info, format!("e{}", i)));
        }
        assert_eq!(messages(&ring.snapshot_recent(2)), vec!["e3", "e4"]);
    }

    #[test]
    fn flush_empties_buffer() {
        let ring = collector(true, 5);
        ring.capture(TelemetryEvent::dom("button#save"));
        ring.flush();
        assert!(ring.is_empty());
    }

    #[test]
    fn concurrent_producers_never_exceed_capacity() {
        let ring = Arc::new(collector(true, 16));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..500 {
                        ring.capture(TelemetryEvent::log(ErrorLevel::Info, format!("{}-{}", t, i)));
                        if i % 100 == 0 {
                            ring.reconfigure(true, 16);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ring.len(), 16);
    }

    #[test]
    fn serializes_with_type_tag() {
        let event = TelemetryEvent::navigation("/home", "/cart");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "navigation");
        assert_eq!(json["body"]["to"], "/cart");
        assert_eq!(json["source"], "client");
    }
}
