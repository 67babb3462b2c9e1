//! Wire payload model
//!
//! A [`Payload`] is the unit of work that travels through the queue and is
//! posted to the collector. Its JSON form is `{"access_token": ..., "data": {...}}`.
//! The serialized byte size is computed lazily and cached until the body is
//! mutated.

use crate::{FlareError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Severity of a reported event, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Critical => "critical",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = FlareError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warning),
            "error" => Ok(Level::Error),
            "critical" | "fatal" => Ok(Level::Critical),
            other => Err(FlareError::Config {
                message: format!("Unknown level '{}'", other),
            }),
        }
    }
}

/// Where payloads are delivered: an access token scoped to an environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub access_token: String,
    pub environment: String,
}

impl Destination {
    pub fn new(access_token: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            environment: environment.into(),
        }
    }

    /// Token with everything but the last four characters masked, for logs.
    pub fn redacted_token(&self) -> String {
        let visible: String = self
            .access_token
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("****{}", visible)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.environment, self.redacted_token())
    }
}

/// The event body. Serialized externally tagged: `{"message": {...}}`,
/// `{"trace": {...}}`, `{"trace_chain": [...]}` or `{"crash_report": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Body {
    Message(Message),
    Trace(Trace),
    TraceChain(Vec<Trace>),
    CrashReport(CrashReport),
}

impl Body {
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Message(_) => "message",
            Body::Trace(_) => "trace",
            Body::TraceChain(_) => "trace_chain",
            Body::CrashReport(_) => "crash_report",
        }
    }

    /// One-line human summary used for titles and minimal bodies.
    pub fn summary(&self) -> String {
        match self {
            Body::Message(message) => message.body.clone(),
            Body::Trace(trace) => trace.exception.summary(),
            Body::TraceChain(chain) => chain
                .first()
                .map(|trace| trace.exception.summary())
                .unwrap_or_default(),
            Body::CrashReport(report) => report.raw.lines().next().unwrap_or_default().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub body: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub frames: Vec<Frame>,
    pub exception: ExceptionInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colno: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Frame {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            lineno: None,
            colno: None,
            method: None,
            code: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_lineno(mut self, lineno: u32) -> Self {
        self.lineno = Some(lineno);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ExceptionInfo {
    pub fn summary(&self) -> String {
        match &self.message {
            Some(message) => format!("{}: {}", self.class, message),
            None => self.class.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifierInfo {
    pub name: String,
    pub version: String,
}

impl Default for NotifierInfo {
    fn default() -> Self {
        Self {
            name: "flare-rs".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// The `data` section of a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    pub environment: String,
    pub level: Level,
    /// Unix seconds at packaging time.
    pub timestamp: i64,
    pub uuid: Uuid,
    pub body: Body,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub custom: Map<String, Value>,
    pub platform: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_version: Option<String>,
    pub notifier: NotifierInfo,
}

impl Data {
    pub fn new(environment: impl Into<String>, level: Level, body: Body) -> Self {
        Self {
            environment: environment.into(),
            level,
            timestamp: chrono::Utc::now().timestamp(),
            uuid: Uuid::new_v4(),
            body,
            title: None,
            custom: Map::new(),
            platform: std::env::consts::OS.to_string(),
            language: "rust".to_string(),
            code_version: None,
            notifier: NotifierInfo::default(),
        }
    }
}

/// Serializable envelope of one event.
///
/// Identity (`access_token`, `data.uuid`, `data.timestamp`, `data.environment`)
/// is fixed at construction; only the body, title and custom data can be
/// mutated afterwards, and every mutation drops the cached size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    access_token: String,
    data: Data,
    #[serde(skip)]
    serialized_size: Option<usize>,
}

impl Payload {
    pub fn new(access_token: impl Into<String>, data: Data) -> Self {
        Self {
            access_token: access_token.into(),
            data,
            serialized_size: None,
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    pub fn id(&self) -> Uuid {
        self.data.uuid
    }

    pub fn timestamp(&self) -> i64 {
        self.data.timestamp
    }

    pub fn level(&self) -> Level {
        self.data.level
    }

    pub fn destination(&self) -> Destination {
        Destination::new(self.access_token.clone(), self.data.environment.clone())
    }

    pub fn body_mut(&mut self) -> &mut Body {
        self.serialized_size = None;
        &mut self.data.body
    }

    pub fn custom_mut(&mut self) -> &mut Map<String, Value> {
        self.serialized_size = None;
        &mut self.data.custom
    }

    pub fn title_mut(&mut self) -> &mut Option<String> {
        self.serialized_size = None;
        &mut self.data.title
    }

    /// Full access for in-crate transforms that rebuild the data section.
    pub(crate) fn data_mut(&mut self) -> &mut Data {
        self.serialized_size = None;
        &mut self.data
    }

    /// Canonical JSON encoding (map keys are sorted by `serde_json`).
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Byte length of the canonical JSON encoding, cached until the next mutation.
    pub fn serialized_size(&mut self) -> Result<usize> {
        if let Some(size) = self.serialized_size {
            return Ok(size);
        }
        let size = self.to_json_bytes()?.len();
        self.serialized_size = Some(size);
        Ok(size)
    }

    #[cfg(test)]
    pub(crate) fn has_cached_size(&self) -> bool {
        self.serialized_size.is_some()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.access_token == other.access_token && self.data == other.data
    }
}
