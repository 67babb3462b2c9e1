use crate::payload::{Body, Data, Frame, Message, Payload, Trace};
use crate::{FlareError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Appended to every string cut by truncation.
pub const TRUNCATION_MARKER: &str = "...";

/// Byte budget for the message and title left by [`TruncationStrategy::MinimalBody`].
pub const MINIMAL_TEXT_LIMIT: usize = 255;

const OMITTED_FRAMES_FILENAME: &str = "...";
const OMITTED_FRAMES_SUFFIX: &str = " frames omitted";

/// Keys of `data` that carry identity or routing and are never rewritten.
const PROTECTED_KEYS: &[&str] = &[
    "environment",
    "level",
    "uuid",
    "timestamp",
    "platform",
    "language",
    "notifier",
];

/// One size-reduction step. Applying a strategy either shrinks the payload or
/// leaves it untouched; reapplying it to its own output is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TruncationStrategy {
    /// Pass-through; measures without changing anything.
    Raw,
    /// Keep the first `head` and last `tail` frames of every trace and
    /// replace the rest with a single marker frame.
    Frames { head: usize, tail: usize },
    /// Cut every string longer than `limit` bytes.
    Strings { limit: usize },
    /// Replace the body with a short message and drop custom data.
    /// Crash reports are left alone.
    MinimalBody,
}

impl TruncationStrategy {
    pub fn default_chain() -> Vec<Self> {
        vec![
            TruncationStrategy::Raw,
            TruncationStrategy::Frames { head: 10, tail: 10 },
            TruncationStrategy::Strings { limit: 1024 },
            TruncationStrategy::Strings { limit: 512 },
            TruncationStrategy::Strings { limit: 256 },
            TruncationStrategy::MinimalBody,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            TruncationStrategy::Raw => "raw",
            TruncationStrategy::Frames { .. } => "frames",
            TruncationStrategy::Strings { .. } => "strings",
            TruncationStrategy::MinimalBody => "minimal_body",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            TruncationStrategy::Strings { limit } if *limit <= TRUNCATION_MARKER.len() => {
                Err(FlareError::Config {
                    message: format!(
                        "strings truncation limit must exceed {} bytes, got {}",
                        TRUNCATION_MARKER.len(),
                        limit
                    ),
                })
            }
            _ => Ok(()),
        }
    }

    /// Apply this strategy in place. Returns whether the payload changed.
    pub fn apply(&self, payload: &mut Payload) -> bool {
        match self {
            TruncationStrategy::Raw => false,
            TruncationStrategy::Frames { head, tail } => truncate_frames(payload, *head, *tail),
            TruncationStrategy::Strings { limit } => truncate_strings(payload, *limit),
            TruncationStrategy::MinimalBody => minimal_body(payload),
        }
    }
}

fn truncate_frames(payload: &mut Payload, head: usize, tail: usize) -> bool {
    let needs_work = match &payload.data().body {
        Body::Trace(trace) => frames_need_truncation(&trace.frames, head, tail),
        Body::TraceChain(chain) => chain
            .iter()
            .any(|trace| frames_need_truncation(&trace.frames, head, tail)),
        Body::Message(_) | Body::CrashReport(_) => false,
    };
    if !needs_work {
        return false;
    }

    match payload.body_mut() {
        Body::Trace(trace) => prune_trace(trace, head, tail),
        Body::TraceChain(chain) => chain
            .iter_mut()
            .fold(false, |changed, trace| prune_trace(trace, head, tail) || changed),
        Body::Message(_) | Body::CrashReport(_) => false,
    }
}

fn frames_need_truncation(frames: &[Frame], head: usize, tail: usize) -> bool {
    if frames.len() <= head.saturating_add(tail) {
        return false;
    }
    let interior = &frames[head..frames.len() - tail];
    !(interior.len() == 1 && omitted_count(&interior[0]).is_some())
}

fn prune_trace(trace: &mut Trace, head: usize, tail: usize) -> bool {
    if !frames_need_truncation(&trace.frames, head, tail) {
        return false;
    }

    let len = trace.frames.len();
    let interior: Vec<Frame> = trace.frames.drain(head..len - tail).collect();
    let omitted: usize = interior
        .iter()
        .map(|frame| omitted_count(frame).unwrap_or(1))
        .sum();

    trace.frames.insert(head, omitted_marker(omitted));
    true
}

fn omitted_marker(count: usize) -> Frame {
    Frame::new(OMITTED_FRAMES_FILENAME).with_method(format!("{}{}", count, OMITTED_FRAMES_SUFFIX))
}

fn omitted_count(frame: &Frame) -> Option<usize> {
    if frame.filename != OMITTED_FRAMES_FILENAME || frame.lineno.is_some() {
        return None;
    }
    frame
        .method
        .as_deref()?
        .strip_suffix(OMITTED_FRAMES_SUFFIX)?
        .parse()
        .ok()
}

fn truncate_strings(payload: &mut Payload, limit: usize) -> bool {
    let mut value = match serde_json::to_value(payload.data()) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(error = %e, "Could not encode payload data for string truncation");
            return false;
        }
    };

    let mut changed = false;
    if let Some(map) = value.as_object_mut() {
        for (key, field) in map.iter_mut() {
            if PROTECTED_KEYS.contains(&key.as_str()) {
                continue;
            }
            changed |= truncate_strings_in(field, limit);
        }
    }
    if !changed {
        return false;
    }

    match serde_json::from_value::<Data>(value) {
        Ok(data) => {
            *payload.data_mut() = data;
            true
        }
        Err(e) => {
            tracing::debug!(error = %e, "String truncation produced undecodable data; skipped");
            false
        }
    }
}

fn truncate_strings_in(value: &mut Value, limit: usize) -> bool {
    match value {
        Value::String(s) => truncate_str(s, limit),
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| truncate_strings_in(item, limit) || changed),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |changed, item| truncate_strings_in(item, limit) || changed),
        _ => false,
    }
}

/// Cut `s` to at most `limit` bytes (marker included) on a char boundary.
pub(crate) fn truncate_str(s: &mut String, limit: usize) -> bool {
    if s.len() <= limit {
        return false;
    }
    let mut cut = limit.saturating_sub(TRUNCATION_MARKER.len());
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    s.push_str(TRUNCATION_MARKER);
    true
}

fn minimal_body(payload: &mut Payload) -> bool {
    let data = payload.data();
    if matches!(data.body, Body::CrashReport(_)) {
        return false;
    }

    let mut text = data.body.summary();
    truncate_str(&mut text, MINIMAL_TEXT_LIMIT);
    let mut message = Message::new(text);
    message
        .extra
        .insert("truncated".to_string(), Value::Bool(true));
    let minimal = Body::Message(message);

    let title = data.title.clone().map(|mut title| {
        truncate_str(&mut title, MINIMAL_TEXT_LIMIT);
        title
    });

    if data.body == minimal && data.custom.is_empty() && data.title == title {
        return false;
    }

    let data = payload.data_mut();
    data.body = minimal;
    data.custom.clear();
    data.title = title;
    true
}
