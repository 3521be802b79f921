//! In-process telemetry for the Davit autoscaler.
//!
//! A small registry of counters, gauges, and millisecond histograms keyed by
//! metric name plus sorted label pairs. The control loop records check
//! timings and handler counts here; an exporter can drain [`Registry::snapshot`]
//! into whatever sink the deployment uses.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

/// A metric identity: name plus sorted label pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Key {
    name: &'static str,
    labels: Vec<(String, String)>,
}

impl Key {
    /// Builds a key, sorting labels so insertion order never splits a series.
    #[must_use]
    pub fn new(name: &'static str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        labels.sort();
        Self { name, labels }
    }

    /// The metric name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// The sorted label pairs.
    #[must_use]
    pub fn labels(&self) -> &[(String, String)] {
        &self.labels
    }
}

/// Aggregated state of one histogram series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct HistogramSummary {
    /// Number of recorded samples.
    pub count: u64,
    /// Sum of recorded values.
    pub sum: f64,
    /// Smallest recorded value.
    pub min: f64,
    /// Largest recorded value.
    pub max: f64,
}

impl HistogramSummary {
    fn record(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    /// Mean of the recorded values, or 0 when empty.
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// A point-in-time copy of every series in the registry.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Snapshot {
    /// Monotonic counters.
    pub counters: Vec<(Key, u64)>,
    /// Last-write-wins gauges.
    pub gauges: Vec<(Key, f64)>,
    /// Histogram summaries.
    pub histograms: Vec<(Key, HistogramSummary)>,
}

/// The telemetry registry. Cheap to clone; all clones share state.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    counters: RwLock<HashMap<Key, u64>>,
    gauges: RwLock<HashMap<Key, f64>>,
    histograms: RwLock<HashMap<Key, HistogramSummary>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `delta` to a counter series.
    pub fn incr_counter(&self, name: &'static str, labels: &[(&str, &str)], delta: u64) {
        let key = Key::new(name, labels);
        *self.inner.counters.write().entry(key).or_insert(0) += delta;
    }

    /// Sets a gauge series.
    pub fn set_gauge(&self, name: &'static str, labels: &[(&str, &str)], value: f64) {
        let key = Key::new(name, labels);
        self.inner.gauges.write().insert(key, value);
    }

    /// Records a histogram sample.
    pub fn record(&self, name: &'static str, labels: &[(&str, &str)], value: f64) {
        let key = Key::new(name, labels);
        self.inner
            .histograms
            .write()
            .entry(key)
            .or_default()
            .record(value);
    }

    /// Starts a timer that records elapsed milliseconds into a histogram
    /// series when dropped.
    #[must_use]
    pub fn start_timer(&self, name: &'static str, labels: &[(&str, &str)]) -> Timer {
        Timer {
            registry: self.clone(),
            key: Key::new(name, labels),
            started: Instant::now(),
        }
    }

    /// Reads a counter series, defaulting to 0.
    #[must_use]
    pub fn counter(&self, name: &'static str, labels: &[(&str, &str)]) -> u64 {
        let key = Key::new(name, labels);
        self.inner.counters.read().get(&key).copied().unwrap_or(0)
    }

    /// Reads a gauge series.
    #[must_use]
    pub fn gauge(&self, name: &'static str, labels: &[(&str, &str)]) -> Option<f64> {
        let key = Key::new(name, labels);
        self.inner.gauges.read().get(&key).copied()
    }

    /// Reads a histogram series.
    #[must_use]
    pub fn histogram(&self, name: &'static str, labels: &[(&str, &str)]) -> Option<HistogramSummary> {
        let key = Key::new(name, labels);
        self.inner.histograms.read().get(&key).copied()
    }

    /// Copies every series out of the registry.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            counters: self
                .inner
                .counters
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            gauges: self
                .inner
                .gauges
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            histograms: self
                .inner
                .histograms
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }
}

/// Records elapsed wall-clock milliseconds into a histogram on drop.
#[derive(Debug)]
pub struct Timer {
    registry: Registry,
    key: Key,
    started: Instant,
}

impl Drop for Timer {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.registry
            .inner
            .histograms
            .write()
            .entry(self.key.clone())
            .or_default()
            .record(elapsed_ms);
    }
}

/// Metric names emitted by the control loop.
pub mod names {
    /// Time spent in a check's metric query, milliseconds.
    pub const CHECK_QUERY_MS: &str = "check_query_ms";
    /// Time spent in a check's strategy invocation, milliseconds.
    pub const CHECK_STRATEGY_MS: &str = "check_strategy_ms";
    /// Number of handlers the manager currently tracks.
    pub const ACTIVE_HANDLERS: &str = "manager_active_handlers";
    /// Recoverable source errors observed.
    pub const SOURCE_ERRORS: &str = "source_errors";
    /// Scaling actions submitted to target adapters.
    pub const SCALE_ATTEMPTS: &str = "scale_attempts";
    /// Scaling actions that returned an error.
    pub const SCALE_FAILURES: &str = "scale_failures";
}
