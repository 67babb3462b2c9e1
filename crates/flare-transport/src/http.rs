use crate::error::{Result, TransportError};
use crate::response::{classify, parse_retry_after};
use crate::sender::PayloadSender;
use async_trait::async_trait;
use flare_core::{DeliveryOutcome, FlareConfig, Payload};
use reqwest::{header, Client, Proxy};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

pub const ACCESS_TOKEN_HEADER: &str = "X-Flare-Access-Token";

/// HTTP delivery settings
#[derive(Debug, Clone)]
pub struct HttpSenderConfig {
    pub item_url: String,
    pub timeout: Duration,
    pub proxy: Option<String>,
}

impl Default for HttpSenderConfig {
    fn default() -> Self {
        Self {
            item_url: FlareConfig::default().item_url(),
            timeout: Duration::from_secs(30),
            proxy: None,
        }
    }
}

impl From<&FlareConfig> for HttpSenderConfig {
    fn from(config: &FlareConfig) -> Self {
        Self {
            item_url: config.item_url(),
            timeout: config.delivery.request_timeout(),
            proxy: config.delivery.proxy.clone(),
        }
    }
}

/// Posts payloads to the collector's item endpoint.
pub struct HttpSender {
    client: Client,
    config: HttpSenderConfig,
}

impl HttpSender {
    pub fn new(config: HttpSenderConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_static(concat!("flare-rs/", env!("CARGO_PKG_VERSION"))),
        );

        let mut builder = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(proxy_url) = &config.proxy {
            let proxy = Proxy::all(proxy_url).map_err(|e| TransportError::Configuration {
                message: format!("Invalid proxy '{}': {}", proxy_url, e),
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| TransportError::Configuration {
            message: format!("Failed to create HTTP client: {}", e),
        })?;

        Ok(Self { client, config })
    }

    pub fn from_flare_config(config: &FlareConfig) -> Result<Self> {
        Self::new(config.into())
    }

    pub fn item_url(&self) -> &str {
        &self.config.item_url
    }

    async fn post(&self, payload: &Payload) -> Result<DeliveryOutcome> {
        let body = payload.to_json_bytes()?;
        let token = header::HeaderValue::from_str(payload.access_token()).map_err(|e| {
            TransportError::Configuration {
                message: format!("Access token is not a valid header value: {}", e),
            }
        })?;

        let response = timeout(
            self.config.timeout,
            self.client
                .post(&self.config.item_url)
                .header(ACCESS_TOKEN_HEADER, token)
                .body(body)
                .send(),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            timeout_ms: self.config.timeout.as_millis() as u64,
        })??;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let text = response.text().await?;
        debug!(status, body = %text, "Collector responded");

        Ok(classify(status, retry_after, &text))
    }
}

#[async_trait]
impl PayloadSender for HttpSender {
    #[instrument(skip(self, payload), fields(payload_id = %payload.id()))]
    async fn send(&self, payload: &Payload) -> DeliveryOutcome {
        match self.post(payload).await {
            Ok(outcome) => outcome,
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "Delivery failed before a response was read");
                DeliveryOutcome::CommunicationError {
                    message: err.to_string(),
                }
            }
            Err(err) => {
                warn!(error = %err, "Delivery failed inside the client");
                DeliveryOutcome::InternalError {
                    message: err.to_string(),
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
