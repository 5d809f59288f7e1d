#![cfg(test)]

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::experiment::{Experiment, Variant};
use crate::rollout::MetricsSource;
use crate::segment::UserSegment;
use crate::telemetry::Telemetry;

/// Two evenly weighted variants, A as control, full traffic, no targeting.
pub fn exp1() -> Experiment {
    Experiment::new(
        "exp1",
        "Checkout button color",
        vec![
            Variant::new("A", 50.0).control().with_value("blue"),
            Variant::new("B", 50.0).with_value("green"),
        ],
    )
}

pub fn segment_registry(segments: Vec<UserSegment>) -> HashMap<String, UserSegment> {
    segments.into_iter().map(|s| (s.id.clone(), s)).collect()
}

/// Metric values that can be changed while an engine holds the source.
#[derive(Default)]
pub struct StaticMetrics {
    values: Mutex<HashMap<String, f64>>,
}

impl StaticMetrics {
    pub fn set(&self, metric: &str, value: f64) {
        self.values.lock().insert(metric.to_string(), value);
    }
}

impl MetricsSource for StaticMetrics {
    fn metric(&self, _strategy_id: &str, metric: &str, _window: Duration) -> Option<f64> {
        self.values.lock().get(metric).copied()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedMetric {
    pub name: String,
    pub value: Option<f64>,
    pub labels: Vec<(String, String)>,
}

#[derive(Default)]
pub struct RecordingTelemetry {
    pub recorded: Mutex<Vec<RecordedMetric>>,
}

impl RecordingTelemetry {
    pub fn count(&self, name: &str) -> usize {
        self.recorded
            .lock()
            .iter()
            .filter(|m| m.name == name)
            .count()
    }

    pub fn labels_of(&self, name: &str) -> Vec<Vec<(String, String)>> {
        self.recorded
            .lock()
            .iter()
            .filter(|m| m.name == name)
            .map(|m| m.labels.clone())
            .collect()
    }

    fn push(&self, name: &str, value: Option<f64>, labels: &[(&str, &str)]) {
        self.recorded.lock().push(RecordedMetric {
            name: name.to_string(),
            value,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
    }
}

impl Telemetry for RecordingTelemetry {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.push(name, None, labels);
    }

    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.push(name, Some(value), labels);
    }
}
