//! Scrubbing of sensitive values before a payload is queued

use crate::config::PrivacyConfig;
use crate::payload::{Body, Payload};
use crate::{FlareError, Result};
use regex::Regex;
use serde_json::{Map, Value};

pub const REDACTED: &str = "[REDACTED]";

/// Redacts values whose key matches a scrub field, and free-text matches of
/// the configured patterns.
#[derive(Debug, Clone)]
pub struct Scrubber {
    patterns: Vec<Regex>,
    fields: Vec<String>,
}

impl Scrubber {
    pub fn new(config: &PrivacyConfig) -> Result<Self> {
        let mut patterns = Vec::new();

        for pattern_str in &config.scrub_patterns {
            let regex = Regex::new(pattern_str).map_err(|source| FlareError::ScrubPattern {
                pattern: pattern_str.clone(),
                source,
            })?;
            patterns.push(regex);
        }

        Ok(Self {
            patterns,
            fields: config
                .scrub_fields
                .iter()
                .map(|field| field.to_lowercase())
                .collect(),
        })
    }

    /// A scrubber that changes nothing.
    pub fn disabled() -> Self {
        Self {
            patterns: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.patterns.is_empty() && self.fields.is_empty()
    }

    /// Scrub custom data, message text and extras, and exception messages.
    pub fn scrub_payload(&self, payload: &mut Payload) {
        if self.is_noop() {
            return;
        }

        self.scrub_map(payload.custom_mut());

        if let Some(title) = payload.title_mut() {
            *title = self.scrub_text(title);
        }

        match payload.body_mut() {
            Body::Message(message) => {
                message.body = self.scrub_text(&message.body);
                self.scrub_map(&mut message.extra);
            }
            Body::Trace(trace) => {
                if let Some(text) = trace.exception.message.as_mut() {
                    *text = self.scrub_text(text);
                }
            }
            Body::TraceChain(chain) => {
                for trace in chain.iter_mut() {
                    if let Some(text) = trace.exception.message.as_mut() {
                        *text = self.scrub_text(text);
                    }
                }
            }
            Body::CrashReport(_) => {}
        }
    }

    /// Replace every pattern match. Patterns with a capture group keep the
    /// first group (typically the key) and redact the rest.
    pub fn scrub_text(&self, text: &str) -> String {
        let mut scrubbed = text.to_string();

        for pattern in &self.patterns {
            scrubbed = pattern
                .replace_all(&scrubbed, |caps: &regex::Captures| {
                    // An optional group may not have participated in the match.
                    caps.get(1).map_or(REDACTED.to_string(), |key| {
                        format!("{}={}", key.as_str(), REDACTED)
                    })
                })
                .to_string();
        }

        scrubbed
    }

    pub fn scrub_map(&self, map: &mut Map<String, Value>) {
        for (key, value) in map.iter_mut() {
            if self.should_redact_field(key) {
                *value = Value::String(REDACTED.to_string());
            } else {
                self.scrub_value(value);
            }
        }
    }

    fn scrub_value(&self, value: &mut Value) {
        match value {
            Value::Object(map) => self.scrub_map(map),
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.scrub_value(item);
                }
            }
            Value::String(s) => {
                *s = self.scrub_text(s);
            }
            _ => {}
        }
    }

    fn should_redact_field(&self, field_name: &str) -> bool {
        let field_lower = field_name.to_lowercase();
        self.fields
            .iter()
            .any(|redacted| field_lower.contains(redacted.as_str()))
    }
}
