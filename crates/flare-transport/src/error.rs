use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error(transparent)]
    Core(#[from] flare_core::FlareError),
}

impl TransportError {
    /// Whether the same request might succeed if sent again.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Http(e) => !e.is_builder() && !e.is_decode(),
            TransportError::Timeout { .. } => true,
            TransportError::Json(_)
            | TransportError::Configuration { .. }
            | TransportError::Core(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(TransportError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(!TransportError::Configuration {
            message: "bad proxy".to_string()
        }
        .is_retryable());

        let json_error = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(!TransportError::from(json_error).is_retryable());
    }
}
