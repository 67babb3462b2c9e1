use async_trait::async_trait;
use flare_core::{DeliveryOutcome, Payload};

/// Delivers one payload and classifies the result.
///
/// Implementations never return errors or panic on delivery failures: every
/// failure is expressed as a [`DeliveryOutcome`].
#[async_trait]
pub trait PayloadSender: Send + Sync {
    async fn send(&self, payload: &Payload) -> DeliveryOutcome;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}
