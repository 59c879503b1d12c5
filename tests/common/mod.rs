#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_notifier::config::Destination;
use tracing_notifier::error::TransportError;
use tracing_notifier::infrastructure::InfrastructureBuilder;
use tracing_notifier::probe::StaticProbe;
use tracing_notifier::store::OfflineStore;
use tracing_notifier::transport::{Transport, TransportResponse};
use tracing_notifier::{EventKind, Infrastructure, InfrastructureConfig, InternalEvent};

/// What the fake endpoint does with one request.
#[derive(Clone, Debug)]
pub enum Reply {
    Status(u16),
    RateLimited(Duration),
    Fail,
}

/// One request seen by [`RecordingTransport`].
#[derive(Clone, Debug)]
pub struct Attempt {
    pub destination: Destination,
    pub bytes: Vec<u8>,
    pub reply: Reply,
}

impl Attempt {
    pub fn message(&self) -> String {
        message_of(&self.bytes)
    }
}

/// Fake transport: answers from a script, then from a fallback reply, and
/// records every request.
pub struct RecordingTransport {
    attempts: Mutex<Vec<Attempt>>,
    script: Mutex<VecDeque<Reply>>,
    fallback: Mutex<Reply>,
    delay: Mutex<Option<(String, Duration)>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Reply::Status(200)),
            delay: Mutex::new(None),
        })
    }

    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.script.lock().extend(replies);
    }

    pub fn set_fallback(&self, reply: Reply) {
        *self.fallback.lock() = reply;
    }

    /// Delay every answer for destinations with this access token.
    pub fn slow_down(&self, access_token: &str, delay: Duration) {
        *self.delay.lock() = Some((access_token.to_string(), delay));
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().clone()
    }

    /// Messages of requests answered with 2xx, in order.
    pub fn delivered(&self) -> Vec<String> {
        self.attempts()
            .iter()
            .filter(|a| matches!(a.reply, Reply::Status(s) if (200..300).contains(&s)))
            .map(Attempt::message)
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn post(&self, destination: &Destination, payload: &[u8]) -> Result<TransportResponse, TransportError> {
        let delay = self
            .delay
            .lock()
            .as_ref()
            .filter(|(token, _)| *token == destination.access_token)
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().clone());
        self.attempts.lock().push(Attempt {
            destination: destination.clone(),
            bytes: payload.to_vec(),
            reply: reply.clone(),
        });

        match reply {
            Reply::Status(status) => Ok(TransportResponse::new(status, "{}")),
            Reply::RateLimited(wait) => Ok(TransportResponse::new(429, "{}").with_retry_after(wait)),
            Reply::Fail => Err(TransportError::Network("connection refused".into())),
        }
    }
}

/// Fast-ticking settings for tests.
pub fn test_config() -> InfrastructureConfig {
    let mut config = InfrastructureConfig::default();
    config.dispatch.replay_interval = Duration::from_millis(30);
    config.dispatch.shutdown_timeout = Duration::from_secs(2);
    config.retry.base_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config.retry.rate_limit_backoff = Duration::from_millis(20);
    config
}

pub fn builder(
    config: InfrastructureConfig,
    transport: &Arc<RecordingTransport>,
    probe: &Arc<StaticProbe>,
) -> InfrastructureBuilder {
    Infrastructure::builder(config)
        .transport(Arc::clone(transport) as Arc<dyn Transport>)
        .probe(Arc::clone(probe) as Arc<dyn tracing_notifier::probe::ConnectivityProbe>)
}

pub fn build(
    config: InfrastructureConfig,
    transport: &Arc<RecordingTransport>,
    store: Option<Arc<dyn OfflineStore>>,
) -> (Arc<Infrastructure>, Arc<StaticProbe>) {
    let probe = Arc::new(StaticProbe::new(true));
    let mut builder = builder(config, transport, &probe);
    if let Some(store) = store {
        builder = builder.store(store);
    }
    (builder.build().expect("infrastructure"), probe)
}

/// `data.body.message.body` of a rendered payload.
pub fn message_of(bytes: &[u8]) -> String {
    let doc: Value = serde_json::from_slice(bytes).expect("payload is json");
    doc["data"]["body"]["message"]["body"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Collect events until `done` holds for what was collected so far, or
/// `timeout` elapses.
pub fn collect_events(
    rx: &mut UnboundedReceiver<InternalEvent>,
    timeout: Duration,
    mut done: impl FnMut(&[InternalEvent]) -> bool,
) -> Vec<InternalEvent> {
    let mut events = Vec::new();
    wait_until(timeout, || {
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        done(&events)
    });
    events
}

pub fn count(events: &[InternalEvent], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind() == kind).count()
}
