use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use thiserror::Error;

use crate::rollout::{default_strategies, RolloutStrategy};
use crate::segment::{default_segments, UserSegment};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Settings of a [crate::FlagEngine]. Every field has a default, so a JSON document only needs
/// the fields it overrides. Durations are whole seconds.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub experimentation_enabled: bool,
    pub segmentation_enabled: bool,
    pub analytics_enabled: bool,

    /// Confidence level a result needs to be significant, e.g. 0.95.
    pub statistical_significance: f64,
    /// Unique users across all variants before a result can be anything but in progress.
    pub min_sample_size: u64,

    #[serde_as(as = "DurationSeconds<u64>")]
    pub analytics_retention: Duration,

    pub experiment_defaults: ExperimentDefaults,

    /// Strategy applied to flags that do not name one. None leaves them ungated.
    pub default_rollout_strategy: Option<String>,
    pub rollout_strategies: Vec<RolloutStrategy>,
    pub default_segments: Vec<UserSegment>,

    pub intervals: Intervals,
}

/// Values [crate::FlagEngine::new_experiment] fills in.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentDefaults {
    #[serde_as(as = "DurationSeconds<u64>")]
    pub duration: Duration,
    pub traffic_percent: f64,
}

/// How often each background job runs.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Intervals {
    #[serde_as(as = "DurationSeconds<u64>")]
    pub experiment_monitor: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub analytics_processing: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub rollout_monitor: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub data_cleanup: Duration,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("statistical significance must be between 0 and 1 exclusive, got {0}")]
    Significance(f64),
    #[error("experiment default traffic percent must be between 0 and 100, got {0}")]
    TrafficPercent(f64),
    #[error("interval {0} must be greater than zero")]
    ZeroInterval(&'static str),
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            experimentation_enabled: true,
            segmentation_enabled: true,
            analytics_enabled: true,
            statistical_significance: 0.95,
            min_sample_size: 1000,
            analytics_retention: Duration::from_secs(30 * DAY),
            experiment_defaults: ExperimentDefaults::default(),
            default_rollout_strategy: None,
            rollout_strategies: default_strategies(),
            default_segments: default_segments(),
            intervals: Intervals::default(),
        }
    }
}

impl Default for ExperimentDefaults {
    fn default() -> Self {
        ExperimentDefaults {
            duration: Duration::from_secs(7 * DAY),
            traffic_percent: 10.0,
        }
    }
}

impl Default for Intervals {
    fn default() -> Self {
        Intervals {
            experiment_monitor: Duration::from_secs(5 * MINUTE),
            analytics_processing: Duration::from_secs(MINUTE),
            rollout_monitor: Duration::from_secs(10 * MINUTE),
            data_cleanup: Duration::from_secs(HOUR),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<EngineConfig, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let significance = self.statistical_significance;
        if !(significance > 0.0 && significance < 1.0) {
            return Err(ConfigError::Significance(significance));
        }
        let traffic = self.experiment_defaults.traffic_percent;
        if !(0.0..=100.0).contains(&traffic) {
            return Err(ConfigError::TrafficPercent(traffic));
        }
        let intervals = [
            ("experiment_monitor", self.intervals.experiment_monitor),
            ("analytics_processing", self.intervals.analytics_processing),
            ("rollout_monitor", self.intervals.rollout_monitor),
            ("data_cleanup", self.intervals.data_cleanup),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        Ok(())
    }
}
