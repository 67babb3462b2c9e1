//! Per-destination bounded payload queue
//!
//! Payloads are delivered oldest first. The queue never holds more than
//! `max_depth` payloads, counting the one the drain loop currently has in
//! flight. When full, the overflow policy decides whether the oldest pending
//! payload is evicted or the new one is refused; either way a
//! `PayloadDropped` event is published instead of an error being returned.
//!
//! The in-flight payload stays owned by the queue while the drain loop works
//! on a copy, so a shutdown that aborts the loop mid-send can still settle it.

use crate::completion::{Completion, ReportStatus};
use flare_core::{
    Destination, DropReason, EventHub, FlareConfig, InternalEvent, OverflowPolicy, Payload,
    TruncationEngine,
};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::debug;

/// Limits and truncation settings of one queue
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_depth: usize,
    pub overflow_policy: OverflowPolicy,
    pub truncation: TruncationEngine,
}

impl QueueSettings {
    pub fn from_config(config: &FlareConfig) -> Self {
        Self {
            max_depth: config.queue.max_depth,
            overflow_policy: config.queue.overflow_policy,
            truncation: TruncationEngine::from_config(&config.truncation),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&FlareConfig::default())
    }
}

/// What happened to a payload handed to [`PayloadQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// Accepted after evicting the oldest pending payload.
    AcceptedWithEviction,
    /// Refused because the queue is full and the policy keeps older payloads.
    Rejected,
    /// Refused because the queue was closed for shutdown.
    Closed,
}

impl EnqueueOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            EnqueueOutcome::Accepted | EnqueueOutcome::AcceptedWithEviction
        )
    }
}

#[derive(Debug)]
pub(crate) struct QueuedPayload {
    pub(crate) payload: Payload,
    pub(crate) attempts: u32,
    pub(crate) completion: Option<Completion>,
}

impl QueuedPayload {
    pub(crate) fn new(payload: Payload, completion: Option<Completion>) -> Self {
        Self {
            payload,
            attempts: 0,
            completion,
        }
    }

    pub(crate) fn complete(&mut self, status: ReportStatus) {
        if let Some(completion) = self.completion.take() {
            completion.complete(status);
        }
    }
}

/// Copy of the in-flight payload handed to the drain loop.
#[derive(Debug)]
pub(crate) struct Attempt {
    pub(crate) payload: Payload,
    /// 1-based number of this attempt.
    pub(crate) number: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<QueuedPayload>,
    in_flight: Option<QueuedPayload>,
    resume_at: Option<Instant>,
    closed: bool,
}

impl QueueState {
    fn occupied(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }
}

pub struct PayloadQueue {
    destination: Destination,
    settings: QueueSettings,
    state: Mutex<QueueState>,
    events: EventHub,
}

impl PayloadQueue {
    pub fn new(destination: Destination, settings: QueueSettings, events: EventHub) -> Self {
        Self {
            destination,
            settings,
            state: Mutex::new(QueueState::default()),
            events,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn max_depth(&self) -> usize {
        self.settings.max_depth
    }

    pub fn truncation(&self) -> &TruncationEngine {
        &self.settings.truncation
    }

    /// Pending payloads, not counting one in flight.
    pub fn count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Earliest time the drain loop may take the next payload, when paused.
    pub fn resume_at(&self) -> Option<Instant> {
        self.lock().resume_at
    }

    pub fn enqueue(&self, payload: Payload) -> EnqueueOutcome {
        self.enqueue_item(QueuedPayload::new(payload, None))
    }

    pub(crate) fn enqueue_item(&self, mut item: QueuedPayload) -> EnqueueOutcome {
        let mut events = Vec::new();
        let mut evicted = None;

        let outcome = {
            let mut state = self.lock();

            let outcome = if state.closed {
                EnqueueOutcome::Closed
            } else if state.occupied() < self.settings.max_depth {
                EnqueueOutcome::Accepted
            } else {
                match self.settings.overflow_policy {
                    OverflowPolicy::DropOldest => match state.pending.pop_front() {
                        Some(oldest) => {
                            evicted = Some(oldest);
                            EnqueueOutcome::AcceptedWithEviction
                        }
                        // Only the in-flight payload is held; nothing to evict.
                        None => EnqueueOutcome::Rejected,
                    },
                    OverflowPolicy::DropNewest => EnqueueOutcome::Rejected,
                }
            };

            if outcome.is_accepted() {
                state.pending.push_back(item);
                events.push(self.depth_event(state.pending.len()));
                outcome
            } else {
                drop(state);
                let reason = if outcome == EnqueueOutcome::Closed {
                    DropReason::Shutdown
                } else {
                    DropReason::QueueFull
                };
                debug!(
                    destination = %self.destination,
                    payload_id = %item.payload.id(),
                    reason = reason.as_str(),
                    "Refusing new payload"
                );
                events.push(self.dropped_event(&item.payload, reason));
                item.complete(ReportStatus::Dropped(reason));
                outcome
            }
        };

        if let Some(mut oldest) = evicted {
            debug!(
                destination = %self.destination,
                payload_id = %oldest.payload.id(),
                reason = DropReason::QueueOverflow.as_str(),
                "Queue full, evicting oldest payload"
            );
            events.insert(0, self.dropped_event(&oldest.payload, DropReason::QueueOverflow));
            oldest.complete(ReportStatus::Dropped(DropReason::QueueOverflow));
        }

        self.publish_all(events);
        outcome
    }

    pub fn peek_oldest(&self) -> Option<Payload> {
        self.lock()
            .pending
            .front()
            .map(|item| item.payload.clone())
    }

    /// Remove the oldest pending payload without delivering it.
    pub fn dequeue_oldest(&self) -> Option<Payload> {
        let (item, depth) = {
            let mut state = self.lock();
            let item = state.pending.pop_front()?;
            (item, state.pending.len())
        };
        self.events.publish(self.depth_event(depth));
        Some(item.payload)
    }

    /// Discard every pending payload. Returns how many were dropped.
    pub fn flush(&self) -> usize {
        self.discard_pending(DropReason::Flushed)
    }

    pub(crate) fn discard_pending(&self, reason: DropReason) -> usize {
        let items: Vec<QueuedPayload> = self.lock().pending.drain(..).collect();
        if items.is_empty() {
            return 0;
        }

        let count = items.len();
        debug!(
            destination = %self.destination,
            count,
            reason = reason.as_str(),
            "Discarding pending payloads"
        );

        let mut events = Vec::with_capacity(count + 1);
        for mut item in items {
            events.push(self.dropped_event(&item.payload, reason));
            item.complete(ReportStatus::Dropped(reason));
        }
        events.push(self.depth_event(0));
        self.publish_all(events);
        count
    }

    /// Take every pending payload out, leaving the queue empty.
    pub(crate) fn take_all(&self) -> Vec<QueuedPayload> {
        let items: Vec<QueuedPayload> = self.lock().pending.drain(..).collect();
        if !items.is_empty() {
            self.events.publish(self.depth_event(0));
        }
        items
    }

    /// Refuse further payloads. Pending and in-flight payloads are kept for
    /// the caller to settle.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Whether the drain loop could take a payload at `now`.
    pub(crate) fn is_ready(&self, now: Instant) -> bool {
        let state = self.lock();
        state.in_flight.is_none()
            && !state.pending.is_empty()
            && state.resume_at.map_or(true, |at| at <= now)
    }

    /// Move the oldest payload into the in-flight slot and hand out a copy
    /// for delivery.
    pub(crate) fn take_ready(&self, now: Instant) -> Option<Attempt> {
        let (attempt, depth) = {
            let mut state = self.lock();
            if state.in_flight.is_some() || state.resume_at.map_or(false, |at| at > now) {
                return None;
            }
            let mut item = state.pending.pop_front()?;
            item.attempts += 1;
            let attempt = Attempt {
                payload: item.payload.clone(),
                number: item.attempts,
            };
            state.in_flight = Some(item);
            state.resume_at = None;
            (attempt, state.pending.len())
        };
        self.events.publish(self.depth_event(depth));
        Some(attempt)
    }

    /// Release the in-flight slot and signal the producer, if waiting.
    pub(crate) fn settle(&self, status: ReportStatus) {
        let item = self.lock().in_flight.take();
        if let Some(mut item) = item {
            item.complete(status);
        }
    }

    /// Put the in-flight payload back at the head, as last attempted, and
    /// pause until `resume_at` so it stays first in line.
    pub(crate) fn requeue_front(&self, attempted: Payload, resume_at: Instant) {
        let depth = {
            let mut state = self.lock();
            let Some(mut item) = state.in_flight.take() else {
                return;
            };
            item.payload = attempted;
            state.resume_at = Some(resume_at);
            state.pending.push_front(item);
            state.pending.len()
        };
        self.events.publish(self.depth_event(depth));
    }

    /// Drop the in-flight payload for good.
    pub(crate) fn discard_in_flight(&self, reason: DropReason, status: ReportStatus) {
        let Some(mut item) = self.lock().in_flight.take() else {
            return;
        };
        debug!(
            destination = %self.destination,
            payload_id = %item.payload.id(),
            attempts = item.attempts,
            reason = reason.as_str(),
            "Dropping payload"
        );
        self.events
            .publish(self.dropped_event(&item.payload, reason));
        item.complete(status);
    }

    /// Reclaim a payload left in flight by a drain loop that was aborted.
    pub(crate) fn take_in_flight(&self) -> Option<QueuedPayload> {
        self.lock().in_flight.take()
    }

    pub(crate) fn events(&self) -> &EventHub {
        &self.events
    }

    fn depth_event(&self, depth: usize) -> InternalEvent {
        InternalEvent::QueueDepthChanged {
            destination: self.destination.clone(),
            depth,
        }
    }

    fn dropped_event(&self, payload: &Payload, reason: DropReason) -> InternalEvent {
        InternalEvent::PayloadDropped {
            destination: self.destination.clone(),
            payload_id: payload.id(),
            reason,
        }
    }

    fn publish_all(&self, events: Vec<InternalEvent>) {
        for event in events {
            self.events.publish(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PayloadQueue {
    fn drop(&mut self) {
        let count = self.discard_pending(DropReason::Disposed);
        if count > 0 {
            debug!(
                destination = %self.destination,
                count,
                "Queue disposed with pending payloads"
            );
        }
    }
}

impl std::fmt::Debug for PayloadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadQueue")
            .field("destination", &self.destination.to_string())
            .field("max_depth", &self.settings.max_depth)
            .field("count", &self.count())
            .finish()
    }
}
