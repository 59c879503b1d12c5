//! Per-destination delivery queues and their drain loops.
//!
//! Every [`Destination`] gets exactly one [`DestinationQueue`] and one drain
//! task on the dispatch runtime, which is what makes delivery strictly FIFO
//! per destination. Queues only hold their lock to push or pop; payload
//! rendering, HTTP and store I/O all happen outside it. Store I/O from the
//! drain loops runs on the blocking pool.

use crate::bundle::{DeliveryOutcome, PayloadBundle};
use crate::config::{Destination, DispatchOptions, RetryOptions};
use crate::error::{StoreError, TransportError};
use crate::events::{DropReason, EventStream, InternalEvent};
use crate::probe::ConnectivityProbe;
use crate::store::{OfflineStore, StoredRecord};
use crate::transport::{Transport, TransportResponse};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Lifecycle of a destination queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Draining,
    Delivering,
    PersistingOffline,
    Shutdown,
}

impl QueueState {
    fn as_u8(self) -> u8 {
        match self {
            QueueState::Idle => 0,
            QueueState::Draining => 1,
            QueueState::Delivering => 2,
            QueueState::PersistingOffline => 3,
            QueueState::Shutdown => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => QueueState::Idle,
            1 => QueueState::Draining,
            2 => QueueState::Delivering,
            3 => QueueState::PersistingOffline,
            _ => QueueState::Shutdown,
        }
    }
}

/// Counters across all destinations of one controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub persisted: u64,
    pub rejected: u64,
    pub omitted: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    persisted: AtomicU64,
    rejected: AtomicU64,
    omitted: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            omitted: self.omitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// How a transmission attempt ended, as far as the queue is concerned.
#[derive(Debug, PartialEq)]
enum Classified {
    Delivered(u16),
    RateLimited(Option<Duration>),
    Rejected { status: u16, body: String },
    Recoverable(String),
}

/// Render a bundle's wire bytes. Packages render caller code, so a panic in
/// there is turned into an error instead of taking the drain loop down.
fn serialize_guarded(bundle: &mut PayloadBundle, telemetry_items: usize) -> Result<Vec<u8>, String> {
    match panic::catch_unwind(AssertUnwindSafe(|| {
        bundle
            .serialize(telemetry_items)
            .map(|bytes| bytes.to_vec())
            .map_err(|err| err.to_string())
    })) {
        Ok(result) => result,
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panic while building payload: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panic while building payload: {}", msg)
    } else {
        "panic while building payload".to_string()
    }
}

fn classify(result: Result<TransportResponse, TransportError>) -> Classified {
    match result {
        Ok(resp) if resp.is_success() => Classified::Delivered(resp.status),
        Ok(resp) if resp.status == 429 => Classified::RateLimited(resp.retry_after),
        Ok(resp) if (400..500).contains(&resp.status) => Classified::Rejected {
            status: resp.status,
            body: resp.body,
        },
        Ok(resp) => Classified::Recoverable(format!("HTTP {}: {}", resp.status, resp.body)),
        Err(err) => Classified::Recoverable(err.to_string()),
    }
}

/// Collaborators and settings shared by the controller and its drain loops.
struct Shared {
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn OfflineStore>>,
    probe: Arc<dyn ConnectivityProbe>,
    events: Arc<EventStream>,
    options: DispatchOptions,
    retry: RetryOptions,
    telemetry_items: AtomicUsize,
    paused: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    live_loops: Mutex<usize>,
    loops_done: Condvar,
    counters: Counters,
}

impl Shared {
    fn loop_started(&self) {
        *self.live_loops.lock() += 1;
    }

    fn loop_finished(&self) {
        let mut live = self.live_loops.lock();
        *live = live.saturating_sub(1);
        if *live == 0 {
            self.loops_done.notify_all();
        }
    }

    fn wait_for_loops(&self, timeout: Duration) -> bool {
        let mut live = self.live_loops.lock();
        if *live > 0 {
            let _ = self.loops_done.wait_while_for(&mut live, |n| *n > 0, timeout);
        }
        *live == 0
    }

    fn drop_bundle(&self, bundle: PayloadBundle, reason: DropReason) {
        debug!(destination = %bundle.destination, bundle_id = %bundle.id, ?reason, "dropping payload");
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        bundle.complete(DeliveryOutcome::Dropped);
        self.events.publish(InternalEvent::PayloadDrop {
            destination: bundle.destination.clone(),
            bundle_id: bundle.id,
            reason,
        });
    }

    /// Run `op` against the store on the blocking pool. `None` without a store.
    async fn offload<T, F>(&self, op: F) -> Option<Result<T, StoreError>>
    where
        T: Send + 'static,
        F: FnOnce(&dyn OfflineStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(self.store.as_ref()?);
        let joined = tokio::task::spawn_blocking(move || op(store.as_ref())).await;
        Some(joined.unwrap_or_else(|err| Err(StoreError::Backend(err.to_string()))))
    }

    async fn persist(&self, destination: &Destination, bundle_id: Uuid, attempt_count: u32, payload: &[u8]) -> bool {
        let target = destination.clone();
        let payload = payload.to_vec();
        match self
            .offload(move |store| store.persist(&target, &payload, attempt_count))
            .await
        {
            Some(result) => self.persisted(destination, bundle_id, result),
            None => false,
        }
    }

    /// Synchronous variant for callers outside the drain loops.
    fn persist_now(&self, bundle: &PayloadBundle, payload: &[u8]) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        let result = store.persist(&bundle.destination, payload, bundle.attempt_count);
        self.persisted(&bundle.destination, bundle.id, result)
    }

    fn persisted(&self, destination: &Destination, bundle_id: Uuid, result: Result<StoredRecord, StoreError>) -> bool {
        match result {
            Ok(record) => {
                debug!(destination = %destination, bundle_id = %bundle_id, key = record.key, "payload persisted offline");
                self.counters.persisted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                error!(destination = %destination, bundle_id = %bundle_id, error = %err, "offline store persist failed");
                false
            }
        }
    }

    /// Take a bundle the dispatch side can no longer deliver: persist it if a
    /// store is configured, drop it otherwise. Replays are already stored.
    fn park(&self, mut bundle: PayloadBundle) {
        if bundle.is_replay() {
            return;
        }
        if self.store.is_some() {
            let items = self.telemetry_items.load(Ordering::Relaxed);
            if let Ok(payload) = serialize_guarded(&mut bundle, items) {
                if self.persist_now(&bundle, &payload) {
                    bundle.complete(DeliveryOutcome::Persisted);
                    return;
                }
            }
        }
        self.drop_bundle(bundle, DropReason::Shutdown);
    }
}

/// Live queue of one destination.
pub struct DestinationQueue {
    destination: Destination,
    bundles: Mutex<VecDeque<PayloadBundle>>,
    wake: Notify,
    state: AtomicU8,
    /// Store keys currently queued or being delivered as replays.
    in_flight: Mutex<HashSet<u64>>,
    /// Copy of the bundle the drain loop is sending; shutdown parks it when
    /// the loop does not come back in time.
    current: Mutex<Option<PayloadBundle>>,
    /// Set after a communication failure; cleared by the next success or a
    /// reachable probe.
    offline: AtomicBool,
}

impl DestinationQueue {
    fn new(destination: Destination) -> Self {
        Self {
            destination,
            bundles: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            state: AtomicU8::new(QueueState::Idle.as_u8()),
            in_flight: Mutex::new(HashSet::new()),
            current: Mutex::new(None),
            offline: AtomicBool::new(false),
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn state(&self) -> QueueState {
        QueueState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: QueueState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.bundles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_idle(&self) -> bool {
        let bundles = self.bundles.lock();
        bundles.is_empty() && self.state() == QueueState::Idle
    }

    /// Append; at `max_depth`, evict and return the oldest never-attempted bundle.
    fn push_back(&self, bundle: PayloadBundle, max_depth: usize) -> Option<PayloadBundle> {
        let mut bundles = self.bundles.lock();
        let evicted = if bundles.len() >= max_depth {
            bundles
                .iter()
                .position(PayloadBundle::is_fresh)
                .and_then(|idx| bundles.remove(idx))
        } else {
            None
        };
        bundles.push_back(bundle);
        evicted
    }

    fn push_front(&self, bundle: PayloadBundle) {
        self.bundles.lock().push_front(bundle);
    }

    fn pop_front(&self) -> Option<PayloadBundle> {
        let mut bundles = self.bundles.lock();
        let next = bundles.pop_front();
        if next.is_some() {
            self.set_state(QueueState::Draining);
        }
        next
    }

    fn take_all(&self) -> Vec<PayloadBundle> {
        self.bundles.lock().drain(..).collect()
    }

    /// Queue replays behind replays already queued (they are older) and
    /// ahead of live bundles.
    fn insert_replays(&self, replays: Vec<PayloadBundle>) {
        let mut bundles = self.bundles.lock();
        let mut at = bundles.iter().take_while(|b| b.is_replay()).count();
        for bundle in replays {
            bundles.insert(at, bundle);
            at += 1;
        }
    }

    /// Pull every queued replay back out so the next tick restarts from the
    /// oldest record.
    fn withdraw_replays(&self) {
        self.bundles.lock().retain(|b| !b.is_replay());
        self.in_flight.lock().clear();
    }

    fn release(&self, key: u64) {
        self.in_flight.lock().remove(&key);
    }

    fn hold(&self, copy: PayloadBundle) {
        *self.current.lock() = Some(copy);
    }

    fn take_current(&self) -> Option<PayloadBundle> {
        self.current.lock().take()
    }

    /// Reclaim the held copy. `false` means shutdown already parked it and
    /// the drain loop must let the bundle go.
    fn settle(&self) -> bool {
        self.take_current().is_some()
    }
}

struct DrainWorker {
    queue: Arc<DestinationQueue>,
    shared: Arc<Shared>,
}

impl DrainWorker {
    async fn run(self) {
        let mut shutdown = self.shared.shutdown.subscribe();
        let mut paused = self.shared.paused.subscribe();
        let interval = self.shared.options.replay_interval;
        // First tick right away: picks up records left by an earlier process.
        let mut next_replay = Instant::now();

        debug!(destination = %self.queue.destination, "drain loop started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            if *paused.borrow_and_update() {
                self.queue.set_state(QueueState::Idle);
                tokio::select! {
                    _ = paused.changed() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            if Instant::now() >= next_replay {
                self.replay().await;
                next_replay = Instant::now() + interval;
            }

            match self.queue.pop_front() {
                Some(bundle) => {
                    if let Some(hold) = self.process(bundle).await {
                        self.queue.set_state(QueueState::Idle);
                        tokio::select! {
                            _ = sleep(hold) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
                None => {
                    self.queue.set_state(QueueState::Idle);
                    tokio::select! {
                        _ = self.queue.wake.notified() => {}
                        _ = sleep_until(next_replay) => {}
                        _ = shutdown.changed() => {}
                        _ = paused.changed() => {}
                    }
                }
            }
        }

        self.queue.set_state(QueueState::Shutdown);
        debug!(destination = %self.queue.destination, "drain loop stopped");
        self.shared.loop_finished();
    }

    async fn replay(&self) {
        if self.shared.store.is_none() {
            return;
        }
        let batch = self.shared.options.replay_batch_size;
        let in_flight = self.queue.in_flight.lock().len();
        let destination = self.queue.destination.clone();
        let records = match self
            .shared
            .offload(move |store| store.peek_oldest(&destination, batch + in_flight))
            .await
        {
            Some(Ok(records)) => records,
            Some(Err(err)) => {
                error!(destination = %self.queue.destination, error = %err, "offline store read failed");
                return;
            }
            None => return,
        };
        let fresh: Vec<_> = {
            let taken = self.queue.in_flight.lock();
            records
                .into_iter()
                .filter(|r| !taken.contains(&r.key))
                .take(batch)
                .collect()
        };
        if fresh.is_empty() {
            return;
        }
        if !self.shared.probe.is_reachable().await {
            debug!(destination = %self.queue.destination, pending = fresh.len(), "endpoint unreachable, replay postponed");
            return;
        }
        self.queue.offline.store(false, Ordering::SeqCst);

        debug!(destination = %self.queue.destination, count = fresh.len(), "replaying offline payloads");
        {
            let mut taken = self.queue.in_flight.lock();
            taken.extend(fresh.iter().map(|r| r.key));
        }
        self.queue
            .insert_replays(fresh.into_iter().map(PayloadBundle::from_record).collect());
    }

    /// Deliver one bundle. Returns how long to hold the queue before the next
    /// attempt, if it must be held.
    async fn process(&self, mut bundle: PayloadBundle) -> Option<Duration> {
        let items = self.shared.telemetry_items.load(Ordering::Relaxed);
        let payload = match serialize_guarded(&mut bundle, items) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(destination = %bundle.destination, bundle_id = %bundle.id, error = %err, "failed to build payload");
                self.forget_stored(bundle.stored.clone()).await;
                bundle.complete(DeliveryOutcome::BundlingFailed);
                self.shared.events.publish(InternalEvent::BundlingError {
                    destination: bundle.destination.clone(),
                    bundle_id: Some(bundle.id),
                    message: err,
                });
                return None;
            }
        };

        self.queue.hold(bundle.in_flight_copy(&payload));

        if self.queue.offline.load(Ordering::SeqCst)
            && self.shared.store.is_some()
            && !bundle.is_replay()
        {
            let reachable = self.shared.probe.is_reachable().await;
            if !self.queue.settle() {
                return None;
            }
            if reachable {
                self.queue.offline.store(false, Ordering::SeqCst);
            } else {
                self.queue.set_state(QueueState::PersistingOffline);
                if self
                    .shared
                    .persist(&bundle.destination, bundle.id, bundle.attempt_count, &payload)
                    .await
                {
                    bundle.complete(DeliveryOutcome::Persisted);
                    return None;
                }
            }
            self.queue.hold(bundle.in_flight_copy(&payload));
        }

        self.queue.set_state(QueueState::Delivering);
        bundle.attempted = true;
        let result = self.shared.transport.post(&bundle.destination, &payload).await;
        if !self.queue.settle() {
            debug!(destination = %bundle.destination, bundle_id = %bundle.id, "in-flight payload already parked by shutdown");
            return None;
        }

        match classify(result) {
            Classified::Delivered(status) => {
                debug!(destination = %bundle.destination, bundle_id = %bundle.id, status, "payload delivered");
                self.queue.offline.store(false, Ordering::SeqCst);
                self.forget_stored(bundle.stored.clone()).await;
                self.shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
                bundle.complete(DeliveryOutcome::Delivered);
                self.shared.events.publish(InternalEvent::CommunicationSuccess {
                    destination: bundle.destination.clone(),
                    bundle_id: bundle.id,
                    status,
                });
                None
            }
            Classified::Rejected { status, body } => {
                warn!(destination = %bundle.destination, bundle_id = %bundle.id, status, "payload rejected by endpoint");
                self.forget_stored(bundle.stored.clone()).await;
                self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                bundle.complete(DeliveryOutcome::Rejected(status));
                self.shared.events.publish(InternalEvent::ApiError {
                    destination: bundle.destination.clone(),
                    bundle_id: bundle.id,
                    status,
                    body,
                });
                None
            }
            Classified::RateLimited(hint) => {
                let hold = hint.unwrap_or(self.shared.retry.rate_limit_backoff);
                debug!(destination = %bundle.destination, bundle_id = %bundle.id, hold_ms = hold.as_millis() as u64, "rate limited");
                self.requeue(bundle);
                Some(hold)
            }
            Classified::Recoverable(reason) => self.on_recoverable(bundle, &payload, reason).await,
        }
    }

    async fn on_recoverable(&self, mut bundle: PayloadBundle, payload: &[u8], reason: String) -> Option<Duration> {
        bundle.attempt_count += 1;
        let attempt = bundle.attempt_count;
        self.queue.offline.store(true, Ordering::SeqCst);

        warn!(destination = %bundle.destination, bundle_id = %bundle.id, attempt, error = %reason, "transmission failed");
        self.shared.events.publish(InternalEvent::CommunicationError {
            destination: bundle.destination.clone(),
            bundle_id: bundle.id,
            attempt,
            error: reason,
        });

        if attempt >= self.shared.retry.max_attempts {
            self.forget_stored(bundle.stored.clone()).await;
            self.shared.counters.omitted.fetch_add(1, Ordering::Relaxed);
            bundle.complete(DeliveryOutcome::Omitted);
            self.shared.events.publish(InternalEvent::TransmissionOmitted {
                destination: bundle.destination.clone(),
                bundle_id: bundle.id,
                attempts: attempt,
            });
            return None;
        }

        if self.shared.store.is_some() {
            self.queue.set_state(QueueState::PersistingOffline);
            if let Some(record) = bundle.stored.clone() {
                let key = record.key;
                if let Some(Err(err)) = self
                    .shared
                    .offload(move |store| store.update_attempts(&record, attempt))
                    .await
                {
                    error!(destination = %bundle.destination, key, error = %err, "offline store update failed");
                }
                self.queue.withdraw_replays();
                return None;
            }
            if self
                .shared
                .persist(&bundle.destination, bundle.id, attempt, payload)
                .await
            {
                bundle.complete(DeliveryOutcome::Persisted);
                return None;
            }
        }

        // No store (or it failed): keep the bundle at the head and back off.
        let hold = self.shared.retry.delay_for(attempt);
        self.requeue(bundle);
        Some(hold)
    }

    /// Put `bundle` back at the head. Once shutdown has started nobody drains
    /// the queue anymore, so whatever is queued gets parked here.
    fn requeue(&self, bundle: PayloadBundle) {
        self.queue.push_front(bundle);
        if *self.shared.shutdown.borrow() {
            for bundle in self.queue.take_all() {
                self.shared.park(bundle);
            }
        }
    }

    async fn forget_stored(&self, record: Option<StoredRecord>) {
        let Some(record) = record else {
            return;
        };
        let key = record.key;
        let destination = record.destination.clone();
        if let Some(Err(err)) = self.shared.offload(move |store| store.remove(&record)).await {
            error!(destination = %destination, key, error = %err, "offline store remove failed");
        }
        self.queue.release(key);
    }
}

/// Owns the destination queues and spawns one drain loop per destination on
/// the dispatch runtime.
pub struct DispatchController {
    shared: Arc<Shared>,
    runtime: Handle,
    queues: Mutex<HashMap<Destination, Arc<DestinationQueue>>>,
    accepting: AtomicBool,
}

/// Collaborators a [`DispatchController`] delivers through.
pub struct DispatchParts {
    pub transport: Arc<dyn Transport>,
    pub store: Option<Arc<dyn OfflineStore>>,
    pub probe: Arc<dyn ConnectivityProbe>,
    pub events: Arc<EventStream>,
}

impl DispatchController {
    pub fn new(
        runtime: Handle,
        parts: DispatchParts,
        options: DispatchOptions,
        retry: RetryOptions,
        telemetry_items: usize,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                transport: parts.transport,
                store: parts.store,
                probe: parts.probe,
                events: parts.events,
                options,
                retry,
                telemetry_items: AtomicUsize::new(telemetry_items),
                paused,
                shutdown,
                live_loops: Mutex::new(0),
                loops_done: Condvar::new(),
                counters: Counters::default(),
            }),
            runtime,
            queues: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
        }
    }

    fn queue(&self, destination: &Destination) -> Option<Arc<DestinationQueue>> {
        let mut queues = self.queues.lock();
        if !self.accepting.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(queue) = queues.get(destination) {
            return Some(Arc::clone(queue));
        }

        let queue = Arc::new(DestinationQueue::new(destination.clone()));
        queues.insert(destination.clone(), Arc::clone(&queue));
        self.shared.loop_started();
        let worker = DrainWorker {
            queue: Arc::clone(&queue),
            shared: Arc::clone(&self.shared),
        };
        self.runtime.spawn(worker.run());
        Some(queue)
    }

    /// Make sure `destination` has a queue and a running drain loop, so its
    /// offline records get replayed even before anything new is logged.
    pub fn register(&self, destination: &Destination) {
        let _ = self.queue(destination);
    }

    /// Hand a bundle over to its destination's drain loop.
    pub fn enqueue(&self, bundle: PayloadBundle) {
        let Some(queue) = self.queue(&bundle.destination) else {
            self.shared.park(bundle);
            return;
        };
        self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        if let Some(evicted) = queue.push_back(bundle, self.shared.options.max_queue_depth) {
            self.shared.drop_bundle(evicted, DropReason::QueueOverflow);
        }
        queue.wake.notify_one();

        // Lost the race against shutdown: nobody will drain this queue anymore.
        if !self.accepting.load(Ordering::SeqCst) {
            for bundle in queue.take_all() {
                self.shared.park(bundle);
            }
        }
    }

    /// Stop draining every destination until [`resume_delivery`](Self::resume_delivery).
    /// Logging keeps enqueueing (and backpressure keeps applying).
    pub fn pause_delivery(&self) {
        self.shared.paused.send_replace(true);
    }

    pub fn resume_delivery(&self) {
        self.shared.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    pub fn state(&self, destination: &Destination) -> Option<QueueState> {
        self.queues.lock().get(destination).map(|q| q.state())
    }

    pub fn queue_len(&self, destination: &Destination) -> usize {
        self.queues.lock().get(destination).map_or(0, |q| q.len())
    }

    pub fn destinations(&self) -> Vec<Destination> {
        self.queues.lock().keys().cloned().collect()
    }

    pub fn stats(&self) -> DispatchStats {
        self.shared.counters.snapshot()
    }

    pub fn store(&self) -> Option<Arc<dyn OfflineStore>> {
        self.shared.store.clone()
    }

    pub(crate) fn set_telemetry_items(&self, items: usize) {
        self.shared.telemetry_items.store(items, Ordering::Relaxed);
    }

    /// Telemetry items attached to each payload.
    pub(crate) fn telemetry_items(&self) -> usize {
        self.shared.telemetry_items.load(Ordering::Relaxed)
    }

    /// `true` when every queue is empty and no drain loop is mid-delivery.
    pub fn is_idle(&self) -> bool {
        self.queues.lock().values().all(|q| q.is_idle())
    }

    /// Block the calling thread until [`is_idle`](Self::is_idle) or `timeout`.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.is_idle() {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting work, signal every drain loop, wait for them up to
    /// `shutdown_timeout`, then park whatever is still in flight or queued.
    pub fn shutdown(&self) {
        {
            let _queues = self.queues.lock();
            if !self.accepting.swap(false, Ordering::SeqCst) {
                return;
            }
        }
        self.shared.shutdown.send_replace(true);

        if !self.shared.wait_for_loops(self.shared.options.shutdown_timeout) {
            warn!(
                timeout_ms = self.shared.options.shutdown_timeout.as_millis() as u64,
                "drain loops still running at shutdown"
            );
        }

        let queues: Vec<_> = self.queues.lock().values().cloned().collect();
        for queue in queues {
            if let Some(bundle) = queue.take_current() {
                warn!(destination = %bundle.destination, bundle_id = %bundle.id, "payload still in flight at shutdown");
                self.shared.park(bundle);
            }
            for bundle in queue.take_all() {
                self.shared.park(bundle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleBody;
    use crate::level::ErrorLevel;
    use crate::payload::Reportable;
    use std::collections::BTreeMap;

    fn bundle(n: usize) -> PayloadBundle {
        PayloadBundle::new(
            Destination::new("t", "test"),
            ErrorLevel::Error,
            BundleBody::Pending(Reportable::from(format!("b{}", n))),
            BTreeMap::new(),
            Vec::new(),
            None,
        )
    }

    #[test]
    fn classify_outcome_table() {
        assert_eq!(classify(Ok(TransportResponse::new(200, ""))), Classified::Delivered(200));
        assert_eq!(
            classify(Ok(TransportResponse::new(429, "").with_retry_after(Duration::from_secs(3)))),
            Classified::RateLimited(Some(Duration::from_secs(3)))
        );
        assert_eq!(
            classify(Ok(TransportResponse::new(403, "bad token"))),
            Classified::Rejected { status: 403, body: "bad token".into() }
        );
        assert!(matches!(classify(Ok(TransportResponse::new(503, ""))), Classified::Recoverable(_)));
        assert!(matches!(classify(Err(TransportError::Timeout)), Classified::Recoverable(_)));
    }

    #[test]
    fn push_back_evicts_oldest_fresh_bundle() {
        let queue = DestinationQueue::new(Destination::new("t", "test"));
        let mut retried = bundle(0);
        retried.attempt_count = 1;
        let retried_id = retried.id;
        queue.push_back(retried, 3);
        let first_fresh = bundle(1);
        let first_fresh_id = first_fresh.id;
        queue.push_back(first_fresh, 3);
        queue.push_back(bundle(2), 3);

        let evicted = queue.push_back(bundle(3), 3).expect("evicts at depth");
        assert_eq!(evicted.id, first_fresh_id);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_front().unwrap().id, retried_id);
    }

    #[test]
    fn sent_bundle_is_never_evicted() {
        let queue = DestinationQueue::new(Destination::new("t", "test"));
        let mut rate_limited = bundle(0);
        rate_limited.attempted = true;
        let rate_limited_id = rate_limited.id;
        queue.push_front(rate_limited);
        let waiting = bundle(1);
        let waiting_id = waiting.id;
        queue.push_back(waiting, 2);

        let evicted = queue.push_back(bundle(2), 2).expect("evicts at depth");
        assert_eq!(evicted.id, waiting_id);
        assert_eq!(queue.pop_front().unwrap().id, rate_limited_id);
    }

    #[test]
    fn settle_fails_once_shutdown_took_the_copy() {
        let queue = DestinationQueue::new(Destination::new("t", "test"));
        let b = bundle(0);
        queue.hold(b.in_flight_copy(b"{}"));
        assert_eq!(queue.take_current().map(|c| c.id), Some(b.id));
        assert!(!queue.settle());

        queue.hold(b.in_flight_copy(b"{}"));
        assert!(queue.settle());
        assert!(queue.take_current().is_none());
    }

    #[test]
    fn replays_go_behind_queued_replays_and_ahead_of_live() {
        let queue = DestinationQueue::new(Destination::new("t", "test"));
        queue.push_back(bundle(0), 10);
        let record = |key| crate::store::StoredRecord {
            key,
            destination: Destination::new("t", "test"),
            payload: vec![key as u8],
            enqueued_at: chrono::Utc::now(),
            attempt_count: 1,
        };
        queue.insert_replays(vec![PayloadBundle::from_record(record(1))]);
        queue.insert_replays(vec![PayloadBundle::from_record(record(2))]);

        let keys: Vec<Option<u64>> = std::iter::from_fn(|| queue.pop_front())
            .map(|b| b.stored.as_ref().map(|r| r.key))
            .collect();
        assert_eq!(keys, vec![Some(1), Some(2), None]);
    }

    #[test]
    fn pop_marks_queue_draining() {
        let queue = DestinationQueue::new(Destination::new("t", "test"));
        queue.push_back(bundle(0), 10);
        assert!(!queue.is_idle());
        let _b = queue.pop_front();
        assert_eq!(queue.state(), QueueState::Draining);
        assert!(!queue.is_idle());
    }
}
