//! In-process metrics recorder
//!
//! Keeps every counter, gauge and histogram registered through the `metrics`
//! facade readable from inside the process, for `flare` diagnostics output
//! and for tests.

use crate::{Error, Result};
use metrics::{
    Counter, Gauge, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder, SharedString, Unit,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

#[derive(Debug, Default)]
struct Samples(Mutex<Vec<f64>>);

impl HistogramFn for Samples {
    fn record(&self, value: f64) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value);
    }
}

#[derive(Debug)]
struct RecorderState {
    counters: Mutex<HashMap<Key, Arc<AtomicU64>>>,
    /// Gauges hold `f64` bits.
    gauges: Mutex<HashMap<Key, Arc<AtomicU64>>>,
    histograms: Mutex<HashMap<Key, Arc<Samples>>>,
    started: Instant,
}

/// Recorder backed by atomics. Clones share the same values.
#[derive(Debug, Clone)]
pub struct FlareMetricsRecorder {
    state: Arc<RecorderState>,
}

impl Default for FlareMetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlareMetricsRecorder {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RecorderState {
                counters: Mutex::new(HashMap::new()),
                gauges: Mutex::new(HashMap::new()),
                histograms: Mutex::new(HashMap::new()),
                started: Instant::now(),
            }),
        }
    }

    /// Install a clone as the process-wide recorder. Fails if one is
    /// already installed.
    pub fn install(&self) -> Result<()> {
        metrics::set_global_recorder(self.clone()).map_err(|e| Error::System {
            message: format!("Failed to install metrics recorder: {}", e),
        })
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: lock(&self.state.counters)
                .iter()
                .map(|(key, value)| (render_key(key), value.load(Ordering::Relaxed)))
                .collect(),
            gauges: lock(&self.state.gauges)
                .iter()
                .map(|(key, bits)| (render_key(key), f64::from_bits(bits.load(Ordering::Relaxed))))
                .collect(),
            histograms: lock(&self.state.histograms)
                .iter()
                .map(|(key, samples)| (render_key(key), lock(&samples.0).clone()))
                .collect(),
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let snapshot = self.snapshot();
        MetricsSummary {
            uptime_seconds: self.state.started.elapsed().as_secs(),
            counter_total: snapshot.counters.values().sum(),
            counter_count: snapshot.counters.len(),
            gauge_count: snapshot.gauges.len(),
            histogram_count: snapshot.histograms.len(),
        }
    }

    pub fn reset(&self) {
        lock(&self.state.counters).clear();
        lock(&self.state.gauges).clear();
        lock(&self.state.histograms).clear();
    }
}

impl Recorder for FlareMetricsRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        let atomic = Arc::clone(lock(&self.state.counters).entry(key.clone()).or_default());
        Counter::from_arc(atomic)
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        let atomic = Arc::clone(lock(&self.state.gauges).entry(key.clone()).or_default());
        Gauge::from_arc(atomic)
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        let samples = Arc::clone(lock(&self.state.histograms).entry(key.clone()).or_default());
        Histogram::from_arc(samples)
    }
}

/// Point-in-time copy of every metric, keyed `name{label=value,...}` with
/// labels in registration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, Vec<f64>>,
}

impl MetricsSnapshot {
    /// Counter value, zero when never registered.
    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    pub fn gauge(&self, key: &str) -> Option<f64> {
        self.gauges.get(key).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSummary {
    pub uptime_seconds: u64,
    /// Sum over all counters.
    pub counter_total: u64,
    pub counter_count: usize,
    pub gauge_count: usize,
    pub histogram_count: usize,
}

fn render_key(key: &Key) -> String {
    let labels: Vec<String> = key
        .labels()
        .map(|label| format!("{}={}", label.key(), label.value()))
        .collect();
    if labels.is_empty() {
        key.name().to_string()
    } else {
        format!("{}{{{}}}", key.name(), labels.join(","))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
