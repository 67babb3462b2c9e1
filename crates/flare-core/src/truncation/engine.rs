use super::TruncationStrategy;
use crate::config::TruncationConfig;
use crate::payload::Payload;

/// Outcome of one truncation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncationReport {
    /// The payload was modified by at least one strategy.
    pub changed: bool,
    pub original_size: usize,
    pub final_size: usize,
    /// `final_size` fits the ceiling.
    pub within_limit: bool,
    /// Names of the strategies whose result was kept, in order.
    pub strategies_applied: Vec<&'static str>,
}

/// Applies an ordered strategy chain until the payload fits `max_size` bytes.
///
/// Payloads already within the ceiling are never touched. A strategy whose
/// output would be larger than its input is rolled back, so the serialized
/// size never grows. A payload still over the ceiling after the last strategy
/// is returned as-is; delivery is attempted anyway.
#[derive(Debug, Clone)]
pub struct TruncationEngine {
    max_size: usize,
    strategies: Vec<TruncationStrategy>,
}

impl TruncationEngine {
    pub fn new(max_size: usize, strategies: Vec<TruncationStrategy>) -> Self {
        Self {
            max_size,
            strategies,
        }
    }

    pub fn from_config(config: &TruncationConfig) -> Self {
        Self::new(config.max_payload_size_bytes, config.strategies.clone())
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn strategies(&self) -> &[TruncationStrategy] {
        &self.strategies
    }

    /// Shrink the payload in place. Returns whether anything changed.
    pub fn truncate(&self, payload: &mut Payload) -> bool {
        self.truncate_with_report(payload).changed
    }

    pub fn truncate_with_report(&self, payload: &mut Payload) -> TruncationReport {
        let original_size = match payload.serialized_size() {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(
                    flare.event = "truncation_skipped",
                    payload_id = %payload.id(),
                    error = %e,
                    "Payload could not be measured; sending unmodified"
                );
                return TruncationReport {
                    changed: false,
                    original_size: 0,
                    final_size: 0,
                    within_limit: false,
                    strategies_applied: Vec::new(),
                };
            }
        };

        let mut report = TruncationReport {
            changed: false,
            original_size,
            final_size: original_size,
            within_limit: original_size <= self.max_size,
            strategies_applied: Vec::new(),
        };

        for strategy in &self.strategies {
            if report.final_size <= self.max_size {
                break;
            }

            let snapshot = payload.clone();
            if !strategy.apply(payload) {
                continue;
            }

            match payload.serialized_size() {
                Ok(size) if size <= report.final_size => {
                    report.changed = true;
                    report.final_size = size;
                    report.strategies_applied.push(strategy.name());
                }
                Ok(size) => {
                    tracing::debug!(
                        strategy = strategy.name(),
                        before = report.final_size,
                        after = size,
                        "Truncation strategy grew the payload; reverted"
                    );
                    *payload = snapshot;
                }
                Err(e) => {
                    tracing::debug!(
                        strategy = strategy.name(),
                        error = %e,
                        "Truncated payload could not be measured; reverted"
                    );
                    *payload = snapshot;
                }
            }
        }

        report.within_limit = report.final_size <= self.max_size;
        if !report.within_limit {
            tracing::debug!(
                payload_id = %payload.id(),
                size = report.final_size,
                limit = self.max_size,
                "Payload still exceeds ceiling after all strategies"
            );
        }

        report
    }
}
