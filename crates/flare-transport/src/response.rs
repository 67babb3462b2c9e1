//! Collector response model and outcome classification

use chrono::{DateTime, Utc};
use flare_core::DeliveryOutcome;
use serde::Deserialize;
use std::time::Duration;

/// Body returned by the collector: `{"err": 0, "result": {"uuid": "..."}}` on
/// success, `{"err": 1, "message": "..."}` otherwise.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub err: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: Option<ApiResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiResult {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
}

/// Turn a status code, optional `Retry-After` and raw body into an outcome.
///
/// A 2xx is only a success if the body does not carry a non-zero `err`.
/// Bodies that are not valid JSON are tolerated: the status alone decides.
pub fn classify(status: u16, retry_after: Option<Duration>, body: &str) -> DeliveryOutcome {
    let parsed = serde_json::from_str::<ApiResponse>(body).ok();

    if (200..300).contains(&status) {
        return match parsed {
            Some(response) if response.err != 0 => DeliveryOutcome::ApiError {
                status,
                code: Some(response.err),
                message: response
                    .message
                    .unwrap_or_else(|| "collector reported an error".to_string()),
                retry_after: None,
            },
            Some(response) => DeliveryOutcome::Success {
                uuid: response.result.and_then(|result| result.uuid.or(result.id)),
            },
            None => DeliveryOutcome::Success { uuid: None },
        };
    }

    let (code, message) = match parsed {
        Some(response) => (
            Some(response.err),
            response.message.unwrap_or_else(|| fallback_message(status, body)),
        ),
        None => (None, fallback_message(status, body)),
    };

    DeliveryOutcome::ApiError {
        status,
        code,
        message,
        retry_after: if status == 429 || status >= 500 {
            retry_after
        } else {
            None
        },
    }
}

fn fallback_message(status: u16, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|code| code.canonical_reason())
            .unwrap_or("unexpected status")
            .to_string()
    } else {
        body.chars().take(512).collect()
    }
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    let delta = at.signed_duration_since(Utc::now());
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
