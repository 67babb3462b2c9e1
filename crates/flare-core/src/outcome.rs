//! Classified result of one delivery attempt

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What happened when a payload was posted to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// 2xx with `err == 0`.
    Success { uuid: Option<String> },
    /// The collector answered but refused the payload.
    ApiError {
        status: u16,
        code: Option<i64>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after: Option<Duration>,
    },
    /// Network, DNS, TLS or timeout failure before a response was read.
    CommunicationError { message: String },
    /// A bug inside the client itself. Never retried.
    InternalError { message: String },
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success { .. })
    }

    /// 5xx, 429 and transport failures are retried; other 4xx are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryOutcome::ApiError { status, .. } => *status >= 500 || *status == 429,
            DeliveryOutcome::CommunicationError { .. } => true,
            DeliveryOutcome::Success { .. } | DeliveryOutcome::InternalError { .. } => false,
        }
    }

    pub fn is_server_rate_limited(&self) -> bool {
        matches!(self, DeliveryOutcome::ApiError { status: 429, .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DeliveryOutcome::ApiError { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short label used for metrics and log fields.
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Success { .. } => "success",
            DeliveryOutcome::ApiError { .. } => "api_error",
            DeliveryOutcome::CommunicationError { .. } => "communication_error",
            DeliveryOutcome::InternalError { .. } => "internal_error",
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::Success { uuid } => match uuid {
                Some(uuid) => write!(f, "delivered ({})", uuid),
                None => write!(f, "delivered"),
            },
            DeliveryOutcome::ApiError {
                status,
                code,
                message,
                ..
            } => match code {
                Some(code) => write!(f, "api error {} (err={}): {}", status, code, message),
                None => write!(f, "api error {}: {}", status, message),
            },
            DeliveryOutcome::CommunicationError { message } => {
                write!(f, "communication error: {}", message)
            }
            DeliveryOutcome::InternalError { message } => write!(f, "internal error: {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(status: u16) -> DeliveryOutcome {
        DeliveryOutcome::ApiError {
            status,
            code: Some(1),
            message: "nope".to_string(),
            retry_after: None,
        }
    }

    #[test]
    fn test_retry_classification() {
        assert!(api_error(500).is_retryable());
        assert!(api_error(503).is_retryable());
        assert!(api_error(429).is_retryable());
        assert!(!api_error(400).is_retryable());
        assert!(!api_error(401).is_retryable());
        assert!(!api_error(413).is_retryable());
        assert!(DeliveryOutcome::CommunicationError {
            message: "connection refused".to_string()
        }
        .is_retryable());
        assert!(!DeliveryOutcome::InternalError {
            message: "bug".to_string()
        }
        .is_retryable());
        assert!(!DeliveryOutcome::Success { uuid: None }.is_retryable());
    }

    #[test]
    fn test_labels_and_display() {
        assert_eq!(api_error(403).label(), "api_error");
        assert_eq!(api_error(403).to_string(), "api error 403 (err=1): nope");
        assert!(api_error(429).is_server_rate_limited());
    }
}
