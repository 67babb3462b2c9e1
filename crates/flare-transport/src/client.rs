use crate::error::{Result, TransportError};
use crate::http::HttpSender;
use crate::mock::RecordingSender;
use crate::sender::PayloadSender;
use flare_core::FlareConfig;
use std::sync::Arc;
use tracing::{info, warn};

/// Picks the sender a configuration asks for.
pub struct SenderFactory;

impl SenderFactory {
    /// HTTP delivery when transmitting, otherwise a [`RecordingSender`].
    pub fn create_sender(config: &FlareConfig) -> Result<Arc<dyn PayloadSender>> {
        if config.transmit {
            info!(
                flare.event = "sender_created",
                sender = "http",
                url = %config.item_url(),
                "Creating HTTP sender"
            );
            let sender = HttpSender::from_flare_config(config)?;
            Ok(Arc::new(sender))
        } else {
            info!(
                flare.event = "sender_created",
                sender = "recording",
                "Transmission disabled; payloads will be recorded locally"
            );
            Ok(Arc::new(RecordingSender::new()))
        }
    }

    /// Check the settings that matter to delivery
    pub fn validate_config(config: &FlareConfig) -> Result<()> {
        if config.transmit && config.access_token.trim().is_empty() {
            return Err(TransportError::Configuration {
                message: "An access token is required to transmit".to_string(),
            });
        }

        if !config.endpoint.starts_with("http://") && !config.endpoint.starts_with("https://") {
            return Err(TransportError::Configuration {
                message: "Endpoint must start with http:// or https://".to_string(),
            });
        }

        if config.delivery.request_timeout_secs == 0 {
            warn!("Request timeout is set to 0, every delivery will time out");
        }

        Ok(())
    }
}
