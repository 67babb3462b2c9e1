//! Producer interface
//!
//! A [`Notifier`] is what application code and logging adapters hold. It
//! filters, packages and scrubs reports, then enqueues them on the shared
//! queue of its destination. Reporting never returns an error; the outcome is
//! a [`ReportStatus`] plus whatever diagnostic events the pipeline raises.

use crate::completion::{Completion, ReportStatus};
use crate::controller::QueueController;
use crate::error::Result;
use crate::queue::{EnqueueOutcome, PayloadQueue, QueueSettings, QueuedPayload};
use flare_core::{
    Destination, DropReason, FlareConfig, Level, Payload, Report, Scrubber,
};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

/// Immediate result of a non-blocking [`Notifier::report`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReportReceipt {
    /// Payload id, when the report got as far as being packaged.
    pub id: Option<Uuid>,
    pub status: ReportStatus,
}

impl ReportReceipt {
    pub fn is_queued(&self) -> bool {
        matches!(self.status, ReportStatus::Queued)
    }
}

pub struct Notifier {
    config: FlareConfig,
    scrubber: Scrubber,
    queue: Arc<PayloadQueue>,
    controller: QueueController,
}

impl Notifier {
    /// Validate `config` and attach to the queue of its destination,
    /// creating the queue on first use.
    pub async fn new(config: FlareConfig, controller: &QueueController) -> Result<Self> {
        config.validate()?;
        let scrubber = config.scrubber()?;
        let queue = controller
            .queue_for(config.destination(), QueueSettings::from_config(&config))
            .await?;

        debug!(
            destination = %queue.destination(),
            enabled = config.enabled,
            min_level = %config.min_level,
            "Notifier ready"
        );

        Ok(Self {
            config,
            scrubber,
            queue,
            controller: controller.clone(),
        })
    }

    pub fn config(&self) -> &FlareConfig {
        &self.config
    }

    pub fn destination(&self) -> &Destination {
        self.queue.destination()
    }

    pub fn queue(&self) -> &Arc<PayloadQueue> {
        &self.queue
    }

    pub fn controller(&self) -> &QueueController {
        &self.controller
    }

    /// Enqueue a report and return immediately.
    pub fn report(&self, report: Report) -> ReportReceipt {
        let payload = match self.prepare(report) {
            Ok(payload) => payload,
            Err(status) => return ReportReceipt { id: None, status },
        };

        let id = payload.id();
        let status = match self.submit(payload, None) {
            EnqueueOutcome::Rejected => ReportStatus::Dropped(DropReason::QueueFull),
            EnqueueOutcome::Closed => ReportStatus::Dropped(DropReason::Shutdown),
            EnqueueOutcome::Accepted | EnqueueOutcome::AcceptedWithEviction => {
                ReportStatus::Queued
            }
        };
        ReportReceipt {
            id: Some(id),
            status,
        }
    }

    pub fn log(&self, level: Level, message: impl Into<String>) -> ReportReceipt {
        self.report(Report::message(level, message))
    }

    pub fn error<E>(&self, error: &E) -> ReportReceipt
    where
        E: std::error::Error + ?Sized,
    {
        self.report(Report::error(error))
    }

    /// Enqueue a report and block the calling thread until the drain loop is
    /// done with it or `timeout` elapses.
    ///
    /// On timeout the result is [`ReportStatus::TimedOut`] and delivery
    /// carries on in the background. Blocks a thread, so call it from plain
    /// threads or `spawn_blocking`, never from inside an async task.
    pub fn report_blocking(&self, report: Report, timeout: Duration) -> ReportStatus {
        let payload = match self.prepare(report) {
            Ok(payload) => payload,
            Err(status) => return status,
        };

        let (completion, rx) = Completion::blocking();
        // A refused payload completes right away with its drop reason.
        self.submit(payload, Some(completion));

        match rx.recv_timeout(timeout) {
            Ok(status) => status,
            Err(RecvTimeoutError::Timeout) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "Blocking report timed out");
                ReportStatus::TimedOut
            }
            // The payload went away without a verdict, e.g. the drain loop was aborted.
            Err(RecvTimeoutError::Disconnected) => ReportStatus::Dropped(DropReason::Shutdown),
        }
    }

    /// Async counterpart of [`report_blocking`](Self::report_blocking).
    pub async fn report_and_wait(&self, report: Report, timeout: Duration) -> ReportStatus {
        let payload = match self.prepare(report) {
            Ok(payload) => payload,
            Err(status) => return status,
        };

        let (completion, rx) = Completion::async_pair();
        // A refused payload completes right away with its drop reason.
        self.submit(payload, Some(completion));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => ReportStatus::Dropped(DropReason::Shutdown),
            Err(_) => ReportStatus::TimedOut,
        }
    }

    /// Filter and package. `Err` carries the final status of a report that
    /// never reaches the queue.
    fn prepare(&self, report: Report) -> std::result::Result<Payload, ReportStatus> {
        if !self.config.enabled {
            trace!("Reporting disabled; ignoring report");
            return Err(ReportStatus::Ignored);
        }
        if report.level() < self.config.min_level {
            trace!(
                level = %report.level(),
                min_level = %self.config.min_level,
                "Report below level threshold; ignoring"
            );
            return Err(ReportStatus::Ignored);
        }

        Ok(report.into_payload(&self.config, &self.scrubber))
    }

    /// Shutdown closes the queue, so a payload arriving after it is refused
    /// under the queue lock and its completion fires with `Dropped(Shutdown)`.
    fn submit(&self, payload: Payload, completion: Option<Completion>) -> EnqueueOutcome {
        self.queue
            .enqueue_item(QueuedPayload::new(payload, completion))
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("destination", &self.queue.destination().to_string())
            .field("enabled", &self.config.enabled)
            .field("min_level", &self.config.min_level)
            .finish()
    }
}
