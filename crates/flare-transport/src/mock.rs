use crate::sender::PayloadSender;
use async_trait::async_trait;
use flare_core::{DeliveryOutcome, Payload};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Accepts every payload without network I/O and keeps a copy.
/// Used when transmission is disabled.
#[derive(Debug, Default, Clone)]
pub struct RecordingSender {
    sent: Arc<Mutex<Vec<Payload>>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Payload> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl PayloadSender for RecordingSender {
    async fn send(&self, payload: &Payload) -> DeliveryOutcome {
        tracing::debug!(payload_id = %payload.id(), "Transmission disabled; payload recorded");
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload.clone());
        DeliveryOutcome::Success {
            uuid: Some(payload.id().to_string()),
        }
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// One scripted reaction of a [`ScriptedSender`].
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Respond(DeliveryOutcome),
    /// Wait before answering.
    Delay(Duration, DeliveryOutcome),
    /// Panic inside `send`, as a buggy client would.
    Panic(String),
}

#[derive(Debug, Default)]
struct ScriptState {
    steps: VecDeque<ScriptStep>,
    attempts: Vec<Payload>,
}

/// Test sender that replays a script of outcomes, then falls back to a
/// default outcome once the script is exhausted.
#[derive(Debug, Clone)]
pub struct ScriptedSender {
    state: Arc<Mutex<ScriptState>>,
    default: DeliveryOutcome,
    latency: Duration,
}

impl Default for ScriptedSender {
    fn default() -> Self {
        Self::new(DeliveryOutcome::Success { uuid: None })
    }
}

impl ScriptedSender {
    pub fn new(default: DeliveryOutcome) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState::default())),
            default,
            latency: Duration::ZERO,
        }
    }

    /// Every call sleeps this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push(&self, step: ScriptStep) -> &Self {
        self.lock().steps.push_back(step);
        self
    }

    pub fn respond(&self, outcome: DeliveryOutcome) -> &Self {
        self.push(ScriptStep::Respond(outcome))
    }

    pub fn attempts(&self) -> Vec<Payload> {
        self.lock().attempts.clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.lock().attempts.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PayloadSender for ScriptedSender {
    async fn send(&self, payload: &Payload) -> DeliveryOutcome {
        let step = {
            let mut state = self.lock();
            state.attempts.push(payload.clone());
            state.steps.pop_front()
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match step {
            Some(ScriptStep::Respond(outcome)) => outcome,
            Some(ScriptStep::Delay(delay, outcome)) => {
                tokio::time::sleep(delay).await;
                outcome
            }
            Some(ScriptStep::Panic(message)) => panic!("{}", message),
            None => self.default.clone(),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
