//! Metric emission hooks.

pub const FLAG_EVALUATIONS_TOTAL: &str = "flag_evaluations_total";
pub const FLAG_EVALUATION_DURATION_MS: &str = "flag_evaluation_duration_ms";
pub const EXPERIMENT_EXPOSURES_TOTAL: &str = "experiment_exposures_total";
pub const EXPERIMENT_CONVERSIONS_TOTAL: &str = "experiment_conversions_total";
pub const EXPERIMENT_CONVERSION_VALUE: &str = "experiment_conversion_value";

/// Trait used by [crate::FlagEngine] to report counters and histograms to the embedding
/// service's metrics backend.
///
/// The engine never calls these while holding one of its locks, so implementations may block.
pub trait Telemetry: Send + Sync {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]);

    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}
