//! Queue registry and background drain loop
//!
//! One [`QueueController`] is shared by every notifier of a process. It keeps
//! weak references to the live queues, scans them round-robin, and delivers
//! at most one payload per queue per scan cycle under a global rate limit.

use crate::completion::ReportStatus;
use crate::error::{PipelineError, Result};
use crate::queue::{Attempt, PayloadQueue, QueueSettings};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::store::PayloadStore;
use flare_core::config::ShutdownConfig;
use flare_core::{
    DeliveryOutcome, Destination, DropReason, EventHub, FlareConfig, InternalEvent,
    Payload, RateLimitSource, ShutdownMode,
};
use flare_transport::PayloadSender;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What a shutdown did with the payloads still queued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Payloads delivered while flushing.
    pub delivered: usize,
    pub persisted: usize,
    pub dropped: usize,
    /// The deadline passed before the drain loop stopped or, when flushing,
    /// before every queue was empty.
    pub timed_out: bool,
}

/// Builder for [`QueueController`]
pub struct QueueControllerBuilder {
    sender: Arc<dyn PayloadSender>,
    events: EventHub,
    limiter: RateLimiter,
    retry: RetryPolicy,
    store: Option<Arc<dyn PayloadStore>>,
    persist_undelivered: bool,
    scan_interval: Duration,
    shutdown: ShutdownConfig,
}

impl QueueControllerBuilder {
    pub fn events(mut self, events: EventHub) -> Self {
        self.events = events;
        self
    }

    pub fn rate_limit(mut self, max_per_window: u32, window: Duration) -> Self {
        self.limiter = RateLimiter::new(max_per_window, window);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(mut self, store: Arc<dyn PayloadStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn persist_undelivered(mut self, persist: bool) -> Self {
        self.persist_undelivered = persist;
        self
    }

    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn shutdown(mut self, shutdown: ShutdownConfig) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn build(self) -> QueueController {
        let core = Arc::new(DrainCore {
            registry: Mutex::new(Registry::default()),
            limiter: Mutex::new(self.limiter),
            sender: self.sender,
            store: self.store,
            events: self.events,
            retry: self.retry,
            persist_undelivered: self.persist_undelivered,
            scan_interval: self.scan_interval,
        });

        QueueController {
            shared: Arc::new(Shared {
                core,
                shutdown: self.shutdown,
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }
}

/// Registry of live queues plus the drain loop that empties them.
///
/// Cloning shares the same controller. The drain loop stops when
/// [`shutdown`](Self::shutdown) is called or the last clone is dropped.
#[derive(Clone)]
pub struct QueueController {
    shared: Arc<Shared>,
}

struct Shared {
    core: Arc<DrainCore>,
    shutdown: ShutdownConfig,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl QueueController {
    pub fn builder(sender: Arc<dyn PayloadSender>) -> QueueControllerBuilder {
        let defaults = FlareConfig::default();
        QueueControllerBuilder {
            sender,
            events: EventHub::new(),
            limiter: RateLimiter::per_minute(defaults.delivery.max_reports_per_minute),
            retry: RetryPolicy::from(&defaults.delivery),
            store: None,
            persist_undelivered: defaults.delivery.persist_undelivered,
            scan_interval: defaults.delivery.scan_interval(),
            shutdown: defaults.shutdown,
        }
    }

    /// Controller settings from a resolved configuration.
    pub fn from_config(
        config: &FlareConfig,
        sender: Arc<dyn PayloadSender>,
        events: EventHub,
    ) -> QueueControllerBuilder {
        Self::builder(sender)
            .events(events)
            .rate_limit(config.delivery.max_reports_per_minute, Duration::from_secs(60))
            .retry_policy(RetryPolicy::from(&config.delivery))
            .persist_undelivered(config.delivery.persist_undelivered)
            .scan_interval(config.delivery.scan_interval())
            .shutdown(config.shutdown.clone())
    }

    pub fn events(&self) -> &EventHub {
        &self.shared.core.events
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.lock_task()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Spawn the drain loop on the current tokio runtime. Calling it again
    /// while the loop runs does nothing.
    pub fn start(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(PipelineError::ShutDown);
        }

        let mut task = self.lock_task();
        if task.as_ref().map_or(false, |handle| !handle.is_finished()) {
            return Ok(());
        }

        let core = Arc::clone(&self.shared.core);
        let cancel = self.shared.cancel.clone();
        *task = Some(tokio::spawn(drain_loop(core, cancel)));

        info!(flare.event = "drain_loop_started", "Drain loop started");
        Ok(())
    }

    /// Register an externally created queue. The registry only keeps a weak
    /// reference; the queue goes away when its owners drop it.
    pub fn register(&self, queue: &Arc<PayloadQueue>) {
        self.shared.core.registry().register(queue);
    }

    /// The live queue for `destination`, created and registered if needed.
    ///
    /// A destination shares one queue across notifiers; the settings of the
    /// notifier that created it apply. A newly created queue is seeded from
    /// the offline store.
    pub async fn queue_for(
        &self,
        destination: Destination,
        settings: QueueSettings,
    ) -> Result<Arc<PayloadQueue>> {
        if self.is_shut_down() {
            return Err(PipelineError::ShutDown);
        }

        let core = &self.shared.core;
        let queue = {
            let mut registry = core.registry();
            if let Some(existing) = registry.find(&destination) {
                return Ok(existing);
            }
            let queue = Arc::new(PayloadQueue::new(
                destination.clone(),
                settings,
                core.events.clone(),
            ));
            registry.register(&queue);
            queue
        };

        // Shutdown may have closed every live queue just before this one
        // was registered.
        if self.is_shut_down() {
            queue.close();
            return Err(PipelineError::ShutDown);
        }

        debug!(destination = %destination, "Created payload queue");

        if let Some(store) = &core.store {
            match store.load_pending(&destination).await {
                Ok(pending) if !pending.is_empty() => {
                    info!(
                        flare.event = "pending_loaded",
                        destination = %destination,
                        count = pending.len(),
                        "Loaded pending payloads from offline store"
                    );
                    for payload in pending {
                        queue.enqueue(payload);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(
                    destination = %destination,
                    error = %e,
                    "Could not load pending payloads"
                ),
            }
        }

        Ok(queue)
    }

    /// Number of registered queues still alive.
    pub fn queue_count(&self) -> usize {
        self.shared.core.live_queues().len()
    }

    /// Pending payloads across all live queues.
    pub fn pending_count(&self) -> usize {
        self.shared
            .core
            .live_queues()
            .iter()
            .map(|queue| queue.count())
            .sum()
    }

    /// Stop the drain loop and settle what is left, bounded by the
    /// configured shutdown timeout.
    ///
    /// In flush mode queues keep draining until empty or the deadline; what
    /// remains goes to the offline store when one is configured and is
    /// dropped otherwise. In drop mode everything pending is dropped.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.shared.shut_down.swap(true, Ordering::SeqCst) {
            return ShutdownReport::default();
        }

        let deadline = Instant::now() + self.shared.shutdown.timeout();
        let core = &self.shared.core;
        for queue in core.live_queues() {
            queue.close();
        }
        self.shared.cancel.cancel();

        let mut report = ShutdownReport::default();
        let handle = self.lock_task().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Drain loop did not stop before the shutdown deadline; aborting it");
                handle.abort();
                // Wait for the abort so the loop cannot settle anything after this.
                let _ = handle.await;
                report.timed_out = true;
            }
        }

        let flush = self.shared.shutdown.mode == ShutdownMode::Flush;
        if flush {
            while core.has_pending() {
                let now = Instant::now();
                if now >= deadline {
                    report.timed_out = true;
                    break;
                }
                let cycle = core.scan_cycle().await;
                report.delivered += cycle.delivered;
                if cycle.delivered == 0 {
                    let wait = cycle.wait.unwrap_or(core.scan_interval);
                    sleep(wait.min(deadline.saturating_duration_since(now))).await;
                }
            }
        }

        for queue in core.live_queues() {
            // An aborted loop leaves its payload in flight; it goes first.
            let leftovers = queue.take_in_flight().into_iter().chain(queue.take_all());
            for mut item in leftovers {
                if flush && core.persist(&queue, &item.payload).await {
                    report.persisted += 1;
                    item.complete(ReportStatus::Persisted);
                    continue;
                }

                report.dropped += 1;
                core.events.publish(InternalEvent::PayloadDropped {
                    destination: queue.destination().clone(),
                    payload_id: item.payload.id(),
                    reason: DropReason::Shutdown,
                });
                item.complete(ReportStatus::Dropped(DropReason::Shutdown));
            }
        }

        info!(
            flare.event = "controller_shutdown",
            delivered = report.delivered,
            persisted = report.persisted,
            dropped = report.dropped,
            timed_out = report.timed_out,
            "Queue controller shut down"
        );
        report
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.shared
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for QueueController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueController")
            .field("queues", &self.queue_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[derive(Default)]
struct Registry {
    queues: Vec<Weak<PayloadQueue>>,
    cursor: usize,
}

impl Registry {
    fn register(&mut self, queue: &Arc<PayloadQueue>) {
        self.prune();
        if !self
            .queues
            .iter()
            .any(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(queue)))
        {
            self.queues.push(Arc::downgrade(queue));
        }
    }

    fn find(&mut self, destination: &Destination) -> Option<Arc<PayloadQueue>> {
        self.prune();
        self.queues
            .iter()
            .filter_map(Weak::upgrade)
            .find(|queue| queue.destination() == destination)
    }

    fn prune(&mut self) {
        self.queues.retain(|weak| weak.strong_count() > 0);
        if self.cursor >= self.queues.len() {
            self.cursor = 0;
        }
    }

    /// Live queues, starting after the one served first last cycle.
    fn rotation(&mut self) -> Vec<Arc<PayloadQueue>> {
        self.prune();
        let len = self.queues.len();
        if len == 0 {
            return Vec::new();
        }

        let start = self.cursor % len;
        self.cursor = (start + 1) % len;
        (0..len)
            .filter_map(|offset| self.queues[(start + offset) % len].upgrade())
            .collect()
    }
}

#[derive(Debug, Default)]
struct CycleSummary {
    delivered: usize,
    /// Set when the cycle stopped early on the rate limit.
    wait: Option<Duration>,
}

struct DrainCore {
    registry: Mutex<Registry>,
    limiter: Mutex<RateLimiter>,
    sender: Arc<dyn PayloadSender>,
    store: Option<Arc<dyn PayloadStore>>,
    events: EventHub,
    retry: RetryPolicy,
    persist_undelivered: bool,
    scan_interval: Duration,
}

async fn drain_loop(core: Arc<DrainCore>, cancel: CancellationToken) {
    // A cycle runs to completion so no payload is left marked in flight.
    while !cancel.is_cancelled() {
        let cycle = core.scan_cycle().await;

        let wait = cycle.wait.unwrap_or(core.scan_interval);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(wait) => {}
        }
    }
    debug!(flare.event = "drain_loop_stopped", "Drain loop stopped");
}

impl DrainCore {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_queues(&self) -> Vec<Arc<PayloadQueue>> {
        let mut registry = self.registry();
        registry.prune();
        registry.queues.iter().filter_map(Weak::upgrade).collect()
    }

    fn has_pending(&self) -> bool {
        self.live_queues().iter().any(|queue| !queue.is_empty())
    }

    /// One pass over every queue: at most one delivery per queue.
    async fn scan_cycle(&self) -> CycleSummary {
        let mut summary = CycleSummary::default();
        let queues = self.registry().rotation();

        for queue in queues {
            let now = Instant::now();
            if !queue.is_ready(now) {
                continue;
            }

            let acquired = self
                .limiter
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_acquire_at(now);
            if let Err(retry_in) = acquired {
                debug!(
                    destination = %queue.destination(),
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Rate limit reached"
                );
                self.events.publish(InternalEvent::RateLimited {
                    destination: queue.destination().clone(),
                    source: RateLimitSource::Local,
                    retry_in,
                });
                summary.wait = Some(retry_in);
                break;
            }

            let Some(attempt) = queue.take_ready(now) else {
                continue;
            };
            if self.deliver(&queue, attempt).await {
                summary.delivered += 1;
            }
        }

        summary
    }

    /// Attempt one payload and settle it. Returns whether it was delivered.
    async fn deliver(&self, queue: &Arc<PayloadQueue>, attempt: Attempt) -> bool {
        let destination = queue.destination().clone();
        let Attempt {
            mut payload,
            number,
        } = attempt;

        let truncation = queue.truncation().truncate_with_report(&mut payload);
        if truncation.changed {
            debug!(
                payload_id = %payload.id(),
                original_size = truncation.original_size,
                final_size = truncation.final_size,
                strategies = ?truncation.strategies_applied,
                "Payload truncated"
            );
            self.events.publish(InternalEvent::PayloadTruncated {
                destination: destination.clone(),
                payload_id: payload.id(),
                original_size: truncation.original_size,
                final_size: truncation.final_size,
            });
        }

        let outcome = AssertUnwindSafe(self.sender.send(&payload))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                error!(
                    flare.event = "sender_panicked",
                    sender = self.sender.name(),
                    panic = %message,
                    "Sender panicked during delivery"
                );
                DeliveryOutcome::InternalError { message }
            });

        self.events.publish(InternalEvent::DeliveryAttempted {
            destination: destination.clone(),
            payload_id: payload.id(),
            attempt: number,
            outcome: outcome.clone(),
        });

        if outcome.is_success() {
            debug!(payload_id = %payload.id(), attempt = number, "Payload delivered");
            queue.settle(ReportStatus::Delivered);
            return true;
        }

        if outcome.is_retryable() && self.retry.should_retry(number) {
            let delay = outcome
                .retry_after()
                .unwrap_or_else(|| self.retry.delay_for(number));

            if outcome.is_server_rate_limited() {
                self.events.publish(InternalEvent::RateLimited {
                    destination: destination.clone(),
                    source: RateLimitSource::Server,
                    retry_in: delay,
                });
            }

            warn!(
                payload_id = %payload.id(),
                attempt = number,
                max_retries = self.retry.max_retries,
                retry_in_ms = delay.as_millis() as u64,
                outcome = %outcome,
                "Delivery failed; will retry"
            );
            queue.requeue_front(payload, Instant::now() + delay);
            return false;
        }

        if matches!(outcome, DeliveryOutcome::CommunicationError { .. })
            && self.persist(queue, &payload).await
        {
            queue.settle(ReportStatus::Persisted);
            return false;
        }

        let reason = if outcome.is_retryable() {
            DropReason::RetriesExhausted
        } else {
            DropReason::Rejected
        };
        queue.discard_in_flight(reason, ReportStatus::Failed(outcome));
        false
    }

    /// Hand a payload to the offline store. Returns whether it was stored.
    async fn persist(&self, queue: &PayloadQueue, payload: &Payload) -> bool {
        let Some(store) = self.store.as_ref().filter(|_| self.persist_undelivered) else {
            return false;
        };

        match store.save_undelivered(payload).await {
            Ok(()) => {
                info!(
                    flare.event = "payload_persisted",
                    payload_id = %payload.id(),
                    "Payload handed to offline store"
                );
                queue.events().publish(InternalEvent::PayloadPersisted {
                    destination: queue.destination().clone(),
                    payload_id: payload.id(),
                });
                true
            }
            Err(e) => {
                warn!(
                    payload_id = %payload.id(),
                    error = %e,
                    "Offline store refused payload"
                );
                false
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "sender panicked".to_string()
    }
}
