use crate::config::Destination;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Why a payload was dropped without a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The destination queue was at `max_queue_depth`.
    QueueOverflow,
    /// The dispatch side is shut down and no offline store could take it.
    Shutdown,
}

/// Internal notifier events published on the process-wide [`EventStream`].
#[derive(Debug, Clone)]
pub enum InternalEvent {
    /// Building the payload failed; nothing was sent.
    BundlingError {
        destination: Destination,
        bundle_id: Option<Uuid>,
        message: String,
    },
    /// The endpoint rejected the payload (4xx other than 429).
    ApiError {
        destination: Destination,
        bundle_id: Uuid,
        status: u16,
        body: String,
    },
    /// A recoverable transmission failure (network, timeout, 5xx).
    CommunicationError {
        destination: Destination,
        bundle_id: Uuid,
        attempt: u32,
        error: String,
    },
    CommunicationSuccess {
        destination: Destination,
        bundle_id: Uuid,
        status: u16,
    },
    /// Retries are exhausted; the payload is gone.
    TransmissionOmitted {
        destination: Destination,
        bundle_id: Uuid,
        attempts: u32,
    },
    PayloadDrop {
        destination: Destination,
        bundle_id: Uuid,
        reason: DropReason,
    },
    /// A logger applied new settings.
    Reconfigured { destination: Destination },
}

/// Discriminant of [`InternalEvent`], handy for counting and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BundlingError,
    ApiError,
    CommunicationError,
    CommunicationSuccess,
    TransmissionOmitted,
    PayloadDrop,
    Reconfigured,
}

impl InternalEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            InternalEvent::BundlingError { .. } => EventKind::BundlingError,
            InternalEvent::ApiError { .. } => EventKind::ApiError,
            InternalEvent::CommunicationError { .. } => EventKind::CommunicationError,
            InternalEvent::CommunicationSuccess { .. } => EventKind::CommunicationSuccess,
            InternalEvent::TransmissionOmitted { .. } => EventKind::TransmissionOmitted,
            InternalEvent::PayloadDrop { .. } => EventKind::PayloadDrop,
            InternalEvent::Reconfigured { .. } => EventKind::Reconfigured,
        }
    }

    pub fn destination(&self) -> &Destination {
        match self {
            InternalEvent::BundlingError { destination, .. }
            | InternalEvent::ApiError { destination, .. }
            | InternalEvent::CommunicationError { destination, .. }
            | InternalEvent::CommunicationSuccess { destination, .. }
            | InternalEvent::TransmissionOmitted { destination, .. }
            | InternalEvent::PayloadDrop { destination, .. }
            | InternalEvent::Reconfigured { destination } => destination,
        }
    }

    pub fn bundle_id(&self) -> Option<Uuid> {
        match self {
            InternalEvent::BundlingError { bundle_id, .. } => *bundle_id,
            InternalEvent::ApiError { bundle_id, .. }
            | InternalEvent::CommunicationError { bundle_id, .. }
            | InternalEvent::CommunicationSuccess { bundle_id, .. }
            | InternalEvent::TransmissionOmitted { bundle_id, .. }
            | InternalEvent::PayloadDrop { bundle_id, .. } => Some(*bundle_id),
            InternalEvent::Reconfigured { .. } => None,
        }
    }
}

/// Fan-out of [`InternalEvent`]s to any number of subscribers.
///
/// Each subscriber owns an unbounded channel, so publishing never waits on a
/// slow reader and every subscriber sees every event once, in emission order.
#[derive(Default)]
pub struct EventStream {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<InternalEvent>>>,
}

impl EventStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<InternalEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber; closed receivers are pruned.
    pub fn publish(&self, event: InternalEvent) {
        tracing::trace!(kind = ?event.kind(), destination = %event.destination(), "internal event");
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(n: u16) -> InternalEvent {
        InternalEvent::CommunicationSuccess {
            destination: Destination::new("t", "test"),
            bundle_id: Uuid::new_v4(),
            status: n,
        }
    }

    #[test]
    fn every_subscriber_sees_every_event_in_order() {
        let stream = EventStream::new();
        let mut a = stream.subscribe();
        let mut b = stream.subscribe();
        for status in [200, 201, 202] {
            stream.publish(success(status));
        }
        for rx in [&mut a, &mut b] {
            let statuses: Vec<u16> = std::iter::from_fn(|| rx.try_recv().ok())
                .map(|e| match e {
                    InternalEvent::CommunicationSuccess { status, .. } => status,
                    other => panic!("unexpected {:?}", other),
                })
                .collect();
            assert_eq!(statuses, vec![200, 201, 202]);
        }
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let stream = EventStream::new();
        let rx = stream.subscribe();
        let _keep = stream.subscribe();
        drop(rx);
        stream.publish(success(200));
        assert_eq!(stream.subscriber_count(), 1);
    }
}
