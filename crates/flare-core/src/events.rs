//! Internal diagnostic events
//!
//! The pipeline publishes [`InternalEvent`]s so monitors can observe queue
//! health and delivery failures without reaching into delivery internals.
//! Dispatch is synchronous and fire-and-forget: every observer is called in
//! turn on the publishing thread, a panicking observer is isolated, and slow
//! observers are not buffered for.

use crate::outcome::DeliveryOutcome;
use crate::payload::Destination;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Why a payload left a queue without being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Evicted to make room under the drop-oldest policy.
    QueueOverflow,
    /// Refused under the drop-newest policy.
    QueueFull,
    /// The collector rejected it with a non-retryable response.
    Rejected,
    /// Retry budget exhausted.
    RetriesExhausted,
    /// Discarded by an explicit flush.
    Flushed,
    /// Discarded during controller shutdown.
    Shutdown,
    /// The owning notifier went away with the payload still queued.
    Disposed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::QueueOverflow => "queue_overflow",
            DropReason::QueueFull => "queue_full",
            DropReason::Rejected => "rejected",
            DropReason::RetriesExhausted => "retries_exhausted",
            DropReason::Flushed => "flushed",
            DropReason::Shutdown => "shutdown",
            DropReason::Disposed => "disposed",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who imposed a rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitSource {
    /// The client-side token bucket.
    Local,
    /// The collector answered 429.
    Server,
}

impl RateLimitSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitSource::Local => "local",
            RateLimitSource::Server => "server",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InternalEvent {
    QueueDepthChanged {
        destination: Destination,
        depth: usize,
    },
    PayloadDropped {
        destination: Destination,
        payload_id: Uuid,
        reason: DropReason,
    },
    DeliveryAttempted {
        destination: Destination,
        payload_id: Uuid,
        attempt: u32,
        outcome: DeliveryOutcome,
    },
    RateLimited {
        destination: Destination,
        source: RateLimitSource,
        retry_in: Duration,
    },
    PayloadTruncated {
        destination: Destination,
        payload_id: Uuid,
        original_size: usize,
        final_size: usize,
    },
    PayloadPersisted {
        destination: Destination,
        payload_id: Uuid,
    },
}

impl InternalEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InternalEvent::QueueDepthChanged { .. } => "queue_depth_changed",
            InternalEvent::PayloadDropped { .. } => "payload_dropped",
            InternalEvent::DeliveryAttempted { .. } => "delivery_attempted",
            InternalEvent::RateLimited { .. } => "rate_limited",
            InternalEvent::PayloadTruncated { .. } => "payload_truncated",
            InternalEvent::PayloadPersisted { .. } => "payload_persisted",
        }
    }

    pub fn destination(&self) -> &Destination {
        match self {
            InternalEvent::QueueDepthChanged { destination, .. }
            | InternalEvent::PayloadDropped { destination, .. }
            | InternalEvent::DeliveryAttempted { destination, .. }
            | InternalEvent::RateLimited { destination, .. }
            | InternalEvent::PayloadTruncated { destination, .. }
            | InternalEvent::PayloadPersisted { destination, .. } => destination,
        }
    }
}

/// Handle returned by [`EventHub::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer = Arc<dyn Fn(&InternalEvent) + Send + Sync>;

#[derive(Default)]
struct HubInner {
    next_id: u64,
    observers: Vec<(SubscriptionId, Observer)>,
}

/// Observer list for internal events. Cloning shares the same list.
#[derive(Clone, Default)]
pub struct EventHub {
    inner: Arc<RwLock<HubInner>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&InternalEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.observers.push((id, Arc::new(observer)));
        id
    }

    /// Subscribe through an unbounded channel, convenient for async consumers.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<InternalEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = inner.observers.len();
        inner.observers.retain(|(existing, _)| *existing != id);
        inner.observers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .observers
            .len()
    }

    pub fn publish(&self, event: InternalEvent) {
        // Snapshot so observers may (un)subscribe from inside a callback.
        let observers: Vec<Observer> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .observers
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(&event))).is_err() {
                tracing::warn!(
                    flare.event = "observer_panicked",
                    event = event.name(),
                    "Diagnostic observer panicked; continuing"
                );
            }
        }
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
