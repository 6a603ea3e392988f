use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Metric tags as borrowed key/value pairs.
pub type Tags<'a> = &'a [(&'a str, &'a str)];

/// Capability for emitting metrics from state-changing operations.
///
/// Implementations must be fire-and-forget: a call never fails and never
/// blocks the transition path on I/O.
pub trait MetricsSink: Send + Sync {
    /// Add `value` to a counter.
    fn increment_counter(&self, name: &str, value: f64, tags: Tags<'_>);
    /// Set a gauge to `value`.
    fn record_gauge(&self, name: &str, value: f64, tags: Tags<'_>);
    /// Record one histogram observation.
    fn record_histogram(&self, name: &str, value: f64, tags: Tags<'_>);
    /// Record a duration.
    fn record_timing(&self, name: &str, duration: Duration, tags: Tags<'_>);
}

/// Discards every metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &str, _value: f64, _tags: Tags<'_>) {}
    fn record_gauge(&self, _name: &str, _value: f64, _tags: Tags<'_>) {}
    fn record_histogram(&self, _name: &str, _value: f64, _tags: Tags<'_>) {}
    fn record_timing(&self, _name: &str, _duration: Duration, _tags: Tags<'_>) {}
}

/// Kind of a recorded metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// From [`MetricsSink::increment_counter`].
    Counter,
    /// From [`MetricsSink::record_gauge`].
    Gauge,
    /// From [`MetricsSink::record_histogram`].
    Histogram,
    /// From [`MetricsSink::record_timing`], stored in milliseconds.
    Timing,
}

/// One captured metric call.
#[derive(Debug, Clone)]
pub struct MetricRecord {
    /// What kind of call produced this record.
    pub kind: MetricKind,
    /// Metric name.
    pub name: String,
    /// Value (milliseconds for timings).
    pub value: f64,
    /// Owned copy of the tags.
    pub tags: HashMap<String, String>,
}

/// Keeps every metric call in memory.
///
/// Useful for tests and for embedders that scrape the core periodically.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    records: Mutex<Vec<MetricRecord>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, kind: MetricKind, name: &str, value: f64, tags: Tags<'_>) {
        let tags = tags
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        self.records.lock().push(MetricRecord {
            kind,
            name: name.to_string(),
            value,
            tags,
        });
    }

    /// All captured records, in emission order.
    pub fn records(&self) -> Vec<MetricRecord> {
        self.records.lock().clone()
    }

    /// Captured counter increments.
    pub fn counters(&self) -> Vec<MetricRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.kind == MetricKind::Counter)
            .cloned()
            .collect()
    }

    /// Sum of every increment of counter `name`.
    pub fn counter_total(&self, name: &str) -> f64 {
        self.records
            .lock()
            .iter()
            .filter(|r| r.kind == MetricKind::Counter && r.name == name)
            .map(|r| r.value)
            .sum()
    }

    /// Latest value of gauge `name`.
    pub fn last_gauge(&self, name: &str) -> Option<f64> {
        self.records
            .lock()
            .iter()
            .rev()
            .find(|r| r.kind == MetricKind::Gauge && r.name == name)
            .map(|r| r.value)
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl MetricsSink for RecordingMetrics {
    fn increment_counter(&self, name: &str, value: f64, tags: Tags<'_>) {
        self.push(MetricKind::Counter, name, value, tags);
    }

    fn record_gauge(&self, name: &str, value: f64, tags: Tags<'_>) {
        self.push(MetricKind::Gauge, name, value, tags);
    }

    fn record_histogram(&self, name: &str, value: f64, tags: Tags<'_>) {
        self.push(MetricKind::Histogram, name, value, tags);
    }

    fn record_timing(&self, name: &str, duration: Duration, tags: Tags<'_>) {
        self.push(
            MetricKind::Timing,
            name,
            duration.as_secs_f64() * 1000.0,
            tags,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_metrics_sums_counters() {
        let metrics = RecordingMetrics::new();
        metrics.increment_counter("task.created", 1.0, &[("tenant", "a")]);
        metrics.increment_counter("task.created", 2.0, &[("tenant", "b")]);
        metrics.increment_counter("task.failed", 1.0, &[]);
        assert_eq!(metrics.counter_total("task.created"), 3.0);
        assert_eq!(metrics.counters().len(), 3);
    }

    #[test]
    fn test_recording_metrics_kinds() {
        let metrics = RecordingMetrics::new();
        metrics.record_gauge("agents.active", 4.0, &[]);
        metrics.record_gauge("agents.active", 5.0, &[]);
        metrics.record_histogram("score", 42.0, &[]);
        metrics.record_timing("finalize", Duration::from_millis(250), &[]);

        assert_eq!(metrics.last_gauge("agents.active"), Some(5.0));
        let records = metrics.records();
        assert_eq!(records.len(), 4);
        assert_eq!(records[3].kind, MetricKind::Timing);
        assert_eq!(records[3].value, 250.0);

        metrics.clear();
        assert!(metrics.records().is_empty());
    }

    #[test]
    fn test_noop_metrics_accepts_everything() {
        let sink: &dyn MetricsSink = &NoopMetrics;
        sink.increment_counter("x", 1.0, &[("a", "b")]);
        sink.record_timing("y", Duration::from_secs(1), &[]);
    }
}
