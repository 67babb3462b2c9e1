//! Producer-side reports and their packaging into payloads

use crate::config::FlareConfig;
use crate::payload::{Body, CrashReport, Data, ExceptionInfo, Frame, Level, Message, Payload, Trace};
use crate::scrub::Scrubber;
use serde::Serialize;
use serde_json::{Map, Value};

/// Message used when a report could not be turned into a payload.
pub const PACKAGING_FAILED_MESSAGE: &str = "payload packaging failed";

/// A logical event as described by application code.
///
/// Building a report never fails. Problems such as custom data that does not
/// serialize are collected and surface as a minimal "packaging failed"
/// payload when the report is packaged.
#[derive(Debug, Clone)]
pub struct Report {
    level: Level,
    body: Body,
    title: Option<String>,
    custom: Map<String, Value>,
    packaging_errors: Vec<String>,
}

impl Report {
    fn new(level: Level, body: Body) -> Self {
        Self {
            level,
            body,
            title: None,
            custom: Map::new(),
            packaging_errors: Vec::new(),
        }
    }

    pub fn message(level: Level, text: impl Into<String>) -> Self {
        Self::new(level, Body::Message(Message::new(text)))
    }

    /// Report an error at `Level::Error`. The `source()` chain becomes a
    /// trace chain, outermost error first.
    pub fn error<E>(error: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut chain = vec![Trace {
            frames: Vec::new(),
            exception: ExceptionInfo {
                class: short_type_name(std::any::type_name::<E>()).to_string(),
                message: Some(error.to_string()),
                description: None,
            },
        }];

        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(Trace {
                frames: Vec::new(),
                exception: ExceptionInfo {
                    class: "Cause".to_string(),
                    message: Some(cause.to_string()),
                    description: None,
                },
            });
            source = cause.source();
        }

        let body = if chain.len() == 1 {
            Body::Trace(chain.remove(0))
        } else {
            Body::TraceChain(chain)
        };
        Self::new(Level::Error, body)
    }

    /// A raw crash dump, reported at `Level::Critical`.
    pub fn crash(raw: impl Into<String>) -> Self {
        Self::new(Level::Critical, Body::CrashReport(CrashReport { raw: raw.into() }))
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(value) => {
                self.custom.insert(key, value);
            }
            Err(e) => self
                .packaging_errors
                .push(format!("custom field '{}': {}", key, e)),
        }
        self
    }

    /// Attach stack frames to the outermost trace. Ignored for message and
    /// crash-report bodies.
    pub fn with_frames(mut self, frames: Vec<Frame>) -> Self {
        match &mut self.body {
            Body::Trace(trace) => trace.frames = frames,
            Body::TraceChain(chain) => {
                if let Some(trace) = chain.first_mut() {
                    trace.frames = frames;
                }
            }
            Body::Message(_) | Body::CrashReport(_) => {}
        }
        self
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Package for the destination in `config`, scrubbing before the payload
    /// leaves the producer.
    pub fn into_payload(self, config: &FlareConfig, scrubber: &Scrubber) -> Payload {
        if !self.packaging_errors.is_empty() {
            return packaging_failed(config, self.level, &self.packaging_errors);
        }

        let level = self.level;
        let mut data = Data::new(config.environment.clone(), level, self.body);
        data.title = self.title;
        data.custom = self.custom;
        data.code_version = config.code_version.clone();

        let mut payload = Payload::new(config.access_token.clone(), data);
        scrubber.scrub_payload(&mut payload);

        // Measuring here both validates the encoding and primes the size cache.
        if let Err(e) = payload.serialized_size() {
            return packaging_failed(config, level, &[e.to_string()]);
        }

        payload
    }
}

fn packaging_failed(config: &FlareConfig, level: Level, errors: &[String]) -> Payload {
    tracing::warn!(
        flare.event = "packaging_failed",
        errors = ?errors,
        "Report could not be packaged; sending placeholder"
    );

    let mut message = Message::new(PACKAGING_FAILED_MESSAGE);
    message.extra.insert(
        "errors".to_string(),
        Value::Array(errors.iter().cloned().map(Value::String).collect()),
    );

    let mut data = Data::new(config.environment.clone(), level, Body::Message(message));
    data.code_version = config.code_version.clone();
    Payload::new(config.access_token.clone(), data)
}

fn short_type_name(full: &str) -> &str {
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::{Error as _, Serializer};
    use std::fmt;

    #[derive(Debug)]
    struct Outer {
        inner: Inner,
    }

    #[derive(Debug)]
    struct Inner;

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "could not load profile")
        }
    }

    impl fmt::Display for Inner {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "connection reset")
        }
    }

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.inner)
        }
    }

    impl std::error::Error for Inner {}

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("not today"))
        }
    }

    fn config() -> FlareConfig {
        let mut config = FlareConfig::new("token-abcd", "staging");
        config.code_version = Some("1.2.3".to_string());
        config
    }

    #[test]
    fn test_message_report_packaging() {
        let payload = Report::message(Level::Warning, "cache miss storm")
            .with_title("Cache")
            .with_custom("hits", 12)
            .into_payload(&config(), &Scrubber::disabled());

        let data = payload.data();
        assert_eq!(payload.access_token(), "token-abcd");
        assert_eq!(data.environment, "staging");
        assert_eq!(data.level, Level::Warning);
        assert_eq!(data.title.as_deref(), Some("Cache"));
        assert_eq!(data.custom["hits"], 12);
        assert_eq!(data.code_version.as_deref(), Some("1.2.3"));
    }

    #[test]
    fn test_error_report_walks_source_chain() {
        let error = Outer { inner: Inner };
        let report = Report::error(&error);

        assert_eq!(report.level(), Level::Error);
        match report.body() {
            Body::TraceChain(chain) => {
                assert_eq!(chain.len(), 2);
                assert_eq!(chain[0].exception.class, "Outer");
                assert_eq!(chain[0].exception.message.as_deref(), Some("could not load profile"));
                assert_eq!(chain[1].exception.message.as_deref(), Some("connection reset"));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_single_error_becomes_trace_with_frames() {
        let report = Report::error(&Inner).with_frames(vec![Frame::new("src/lib.rs").with_lineno(3)]);

        match report.body() {
            Body::Trace(trace) => {
                assert_eq!(trace.exception.class, "Inner");
                assert_eq!(trace.frames.len(), 1);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_unserializable_custom_data_yields_placeholder() {
        let payload = Report::message(Level::Error, "original")
            .with_custom("bad", Unserializable)
            .into_payload(&config(), &Scrubber::disabled());

        match &payload.data().body {
            Body::Message(message) => {
                assert_eq!(message.body, PACKAGING_FAILED_MESSAGE);
                let errors = message.extra["errors"].as_array().unwrap();
                assert!(errors[0].as_str().unwrap().contains("not today"));
            }
            other => panic!("unexpected body {:?}", other),
        }
        assert_eq!(payload.level(), Level::Error);
        assert!(payload.data().custom.is_empty());
    }

    #[test]
    fn test_packaging_scrubs_custom_data() {
        let config = config();
        let scrubber = config.scrubber().unwrap();
        let payload = Report::message(Level::Info, "login")
            .with_custom("password", "hunter2")
            .into_payload(&config, &scrubber);

        assert_eq!(payload.data().custom["password"], crate::scrub::REDACTED);
    }

    #[test]
    fn test_optional_group_pattern_packages_without_panic() {
        let mut config = config();
        config.privacy.scrub_patterns = vec![r"(secret=)?hunter2".to_string()];
        config.validate().unwrap();
        let scrubber = config.scrubber().unwrap();

        let payload = Report::message(Level::Error, "password is hunter2")
            .into_payload(&config, &scrubber);

        match &payload.data().body {
            Body::Message(message) => assert_eq!(message.body, "password is [REDACTED]"),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name("my_crate::errors::LoadError"), "LoadError");
        assert_eq!(short_type_name("alloc::boxed::Box<dyn Error>"), "Box");
        assert_eq!(short_type_name("Plain"), "Plain");
    }
}
