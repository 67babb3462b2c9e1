use flare_core::{DeliveryOutcome, DropReason};
use std::sync::mpsc;
use tokio::sync::oneshot;

/// Final (or, for non-blocking calls, immediate) state of a report.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportStatus {
    /// Accepted onto the queue; delivery happens in the background.
    Queued,
    Delivered,
    /// Delivery failed for good.
    Failed(DeliveryOutcome),
    /// Left the queue without a delivery attempt deciding its fate.
    Dropped(DropReason),
    /// Handed to the offline store.
    Persisted,
    /// A blocking call gave up waiting; delivery continues in the background.
    TimedOut,
    /// Filtered out before packaging (disabled, or below the level threshold).
    Ignored,
}

impl ReportStatus {
    pub fn is_delivered(&self) -> bool {
        matches!(self, ReportStatus::Delivered)
    }
}

/// Signal raised once the drain loop is done with one specific payload.
#[derive(Debug)]
pub(crate) enum Completion {
    Blocking(mpsc::SyncSender<ReportStatus>),
    Async(oneshot::Sender<ReportStatus>),
}

impl Completion {
    pub(crate) fn blocking() -> (Self, mpsc::Receiver<ReportStatus>) {
        let (tx, rx) = mpsc::sync_channel(1);
        (Completion::Blocking(tx), rx)
    }

    pub(crate) fn async_pair() -> (Self, oneshot::Receiver<ReportStatus>) {
        let (tx, rx) = oneshot::channel();
        (Completion::Async(tx), rx)
    }

    /// The waiter may have timed out and left; that is fine.
    pub(crate) fn complete(self, status: ReportStatus) {
        match self {
            Completion::Blocking(tx) => {
                let _ = tx.try_send(status);
            }
            Completion::Async(tx) => {
                let _ = tx.send(status);
            }
        }
    }
}
