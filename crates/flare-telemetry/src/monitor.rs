//! Diagnostic event monitor
//!
//! Subscribes to a pipeline [`EventHub`] and turns every [`InternalEvent`]
//! into a structured log line plus `metrics` updates:
//!
//! | Event | Metric |
//! |-------|--------|
//! | `QueueDepthChanged` | gauge `flare.queue.depth{environment}` |
//! | `PayloadDropped` | counter `flare.payloads.dropped{reason}` |
//! | `DeliveryAttempted` | counter `flare.delivery.attempts{outcome}` |
//! | `RateLimited` | counter `flare.rate_limited{source}` |
//! | `PayloadTruncated` | counter `flare.payloads.truncated`, histogram `flare.payloads.truncated_bytes` |
//! | `PayloadPersisted` | counter `flare.payloads.persisted` |

use flare_core::{EventHub, InternalEvent, RateLimitSource, SubscriptionId};
use metrics::{counter, gauge, histogram};
use tracing::{debug, info, trace, warn};

/// Subscription that stays active until the monitor is dropped.
pub struct EventMonitor {
    hub: EventHub,
    subscription: SubscriptionId,
}

impl EventMonitor {
    pub fn attach(hub: &EventHub) -> Self {
        let subscription = hub.subscribe(record_event);
        debug!(flare.event = "monitor_attached", "Event monitor attached");
        Self {
            hub: hub.clone(),
            subscription,
        }
    }
}

impl Drop for EventMonitor {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.subscription);
    }
}

impl std::fmt::Debug for EventMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMonitor")
            .field("subscription", &self.subscription)
            .finish()
    }
}

/// Log and record one event.
pub fn record_event(event: &InternalEvent) {
    match event {
        InternalEvent::QueueDepthChanged { destination, depth } => {
            trace!(destination = %destination, depth, "Queue depth changed");
            gauge!("flare.queue.depth", "environment" => destination.environment.clone())
                .set(*depth as f64);
        }
        InternalEvent::PayloadDropped {
            destination,
            payload_id,
            reason,
        } => {
            warn!(
                flare.event = "payload_dropped",
                destination = %destination,
                payload_id = %payload_id,
                reason = reason.as_str(),
                "Payload dropped"
            );
            counter!("flare.payloads.dropped", "reason" => reason.as_str()).increment(1);
        }
        InternalEvent::DeliveryAttempted {
            destination,
            payload_id,
            attempt,
            outcome,
        } => {
            if outcome.is_success() {
                debug!(
                    flare.event = "delivery_attempted",
                    destination = %destination,
                    payload_id = %payload_id,
                    attempt,
                    outcome = outcome.label(),
                    "Payload delivered"
                );
            } else {
                warn!(
                    flare.event = "delivery_attempted",
                    destination = %destination,
                    payload_id = %payload_id,
                    attempt,
                    outcome = outcome.label(),
                    detail = %outcome,
                    "Delivery attempt failed"
                );
            }
            counter!("flare.delivery.attempts", "outcome" => outcome.label()).increment(1);
        }
        InternalEvent::RateLimited {
            destination,
            source,
            retry_in,
        } => {
            let retry_in_ms = retry_in.as_millis() as u64;
            match source {
                RateLimitSource::Local => debug!(
                    flare.event = "rate_limited",
                    destination = %destination,
                    source = source.as_str(),
                    retry_in_ms,
                    "Local rate limit reached"
                ),
                RateLimitSource::Server => info!(
                    flare.event = "rate_limited",
                    destination = %destination,
                    source = source.as_str(),
                    retry_in_ms,
                    "Collector asked to slow down"
                ),
            }
            counter!("flare.rate_limited", "source" => source.as_str()).increment(1);
        }
        InternalEvent::PayloadTruncated {
            destination,
            payload_id,
            original_size,
            final_size,
        } => {
            debug!(
                flare.event = "payload_truncated",
                destination = %destination,
                payload_id = %payload_id,
                original_size,
                final_size,
                "Payload truncated"
            );
            counter!("flare.payloads.truncated").increment(1);
            histogram!("flare.payloads.truncated_bytes")
                .record(original_size.saturating_sub(*final_size) as f64);
        }
        InternalEvent::PayloadPersisted {
            destination,
            payload_id,
        } => {
            info!(
                flare.event = "payload_persisted",
                destination = %destination,
                payload_id = %payload_id,
                "Payload handed to offline store"
            );
            counter!("flare.payloads.persisted").increment(1);
        }
    }
}
