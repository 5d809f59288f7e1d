use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::{serde_as, DurationSeconds};

use crate::error::{Result, ValidationError};
use crate::flag_value::FlagValue;
use crate::results::ExperimentResults;
use crate::rule::Rule;
use crate::util::is_false;

/// Key inside a variant's config holding the value served for the experiment's flag.
pub const VARIANT_VALUE_KEY: &str = "value";

/// A controlled comparison of variants behind a flag.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: ExperimentStatus,
    #[serde(default, rename = "type")]
    pub kind: ExperimentKind,

    /// The flag this experiment serves values for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_key: Option<String>,

    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default)]
    pub duration: Option<Duration>,

    /// Share of eligible users, `0..=100`, that enter the experiment at all.
    pub traffic_percent: f64,
    pub variants: Vec<Variant>,

    #[serde(default)]
    pub targeting_rules: Vec<Rule>,
    /// Ids of segments in the segment registry; a user must be in at least one of them.
    #[serde(default)]
    pub user_segments: Vec<String>,

    #[serde(default)]
    pub primary_metric: String,
    #[serde(default)]
    pub secondary_metrics: Vec<String>,
    #[serde(default)]
    pub guardrail_metrics: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub owner: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<ExperimentResults>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    #[default]
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Archived,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Draft => "draft",
            ExperimentStatus::Scheduled => "scheduled",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Paused => "paused",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentKind {
    #[default]
    Ab,
    Multivariate,
    Bandit,
}

/// One arm of an experiment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Relative probability mass; weights are normalised by their sum.
    pub weight: f64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_control: bool,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl Variant {
    pub fn new(id: impl Into<String>, weight: f64) -> Self {
        let id = id.into();
        Variant {
            name: id.clone(),
            id,
            description: String::new(),
            weight,
            is_control: false,
            config: Map::new(),
        }
    }

    pub fn control(mut self) -> Self {
        self.is_control = true;
        self
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        let _ = self
            .config
            .insert(VARIANT_VALUE_KEY.to_string(), value.into());
        self
    }

    /// The value this variant serves, if its config declares one.
    pub fn value(&self) -> Option<FlagValue> {
        self.config.get(VARIANT_VALUE_KEY).map(FlagValue::from)
    }
}

impl Experiment {
    pub fn new(id: impl Into<String>, name: impl Into<String>, variants: Vec<Variant>) -> Self {
        Experiment {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            status: ExperimentStatus::Draft,
            kind: ExperimentKind::Ab,
            flag_key: None,
            start_time: None,
            end_time: None,
            duration: None,
            traffic_percent: 100.0,
            variants,
            targeting_rules: Vec::new(),
            user_segments: Vec::new(),
            primary_metric: String::new(),
            secondary_metrics: Vec::new(),
            guardrail_metrics: Vec::new(),
            tags: Vec::new(),
            owner: String::new(),
            results: None,
        }
    }

    pub fn for_flag(mut self, flag_key: impl Into<String>) -> Self {
        self.flag_key = Some(flag_key.into());
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == ExperimentStatus::Running
    }

    pub fn affects_flag(&self, flag_key: &str) -> bool {
        self.flag_key.as_deref() == Some(flag_key)
    }

    pub fn total_weight(&self) -> f64 {
        self.variants.iter().map(|v| v.weight).sum()
    }

    /// The variant marked as control, or the first declared variant.
    pub fn control(&self) -> Option<&Variant> {
        self.variants
            .iter()
            .find(|v| v.is_control)
            .or_else(|| self.variants.first())
    }

    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == variant_id)
    }

    /// The end of the experiment when it starts at `start`, if it has a duration.
    pub(crate) fn end_time_from(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let duration = chrono::Duration::from_std(self.duration?).ok()?;
        start.checked_add_signed(duration)
    }

    /// Checks the definition constraints. Reports the first violated one.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingExperimentId.into());
        }
        if self.name.is_empty() {
            return Err(ValidationError::MissingExperimentName.into());
        }
        if self.variants.len() < 2 {
            return Err(ValidationError::TooFewVariants(self.variants.len()).into());
        }
        if !(0.0..=100.0).contains(&self.traffic_percent) {
            return Err(ValidationError::TrafficPercentOutOfRange(self.traffic_percent).into());
        }

        let mut seen = HashSet::with_capacity(self.variants.len());
        for variant in &self.variants {
            if !seen.insert(variant.id.as_str()) {
                return Err(ValidationError::DuplicateVariant(variant.id.clone()).into());
            }
            if variant.weight < 0.0 || variant.weight.is_nan() {
                return Err(ValidationError::NegativeWeight(variant.id.clone()).into());
            }
        }
        if self.total_weight() <= 0.0 {
            return Err(ValidationError::ZeroTotalWeight.into());
        }

        let controls = self.variants.iter().filter(|v| v.is_control).count();
        if controls > 1 {
            return Err(ValidationError::MultipleControls(controls).into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;
    use spectral::prelude::*;
    use test_case::test_case;

    fn valid() -> Experiment {
        Experiment::new(
            "exp1",
            "Checkout button",
            vec![Variant::new("A", 50.0).control(), Variant::new("B", 50.0)],
        )
    }

    #[test]
    fn valid_experiment_passes() {
        assert_that!(valid().validate()).is_ok();
    }

    #[test_case(|e: &mut Experiment| e.id.clear(), ValidationError::MissingExperimentId)]
    #[test_case(|e: &mut Experiment| e.name.clear(), ValidationError::MissingExperimentName)]
    #[test_case(|e: &mut Experiment| { e.variants.pop(); }, ValidationError::TooFewVariants(1))]
    #[test_case(|e: &mut Experiment| e.traffic_percent = 100.5, ValidationError::TrafficPercentOutOfRange(100.5))]
    #[test_case(|e: &mut Experiment| e.traffic_percent = -1.0, ValidationError::TrafficPercentOutOfRange(-1.0))]
    #[test_case(|e: &mut Experiment| e.variants[1].weight = -5.0, ValidationError::NegativeWeight("B".into()))]
    #[test_case(|e: &mut Experiment| { e.variants[0].weight = 0.0; e.variants[1].weight = 0.0; }, ValidationError::ZeroTotalWeight)]
    #[test_case(|e: &mut Experiment| e.variants[1].is_control = true, ValidationError::MultipleControls(2))]
    #[test_case(|e: &mut Experiment| e.variants[1].id = "A".into(), ValidationError::DuplicateVariant("A".into()))]
    fn invalid_experiments(mutate: fn(&mut Experiment), expected: ValidationError) {
        let mut experiment = valid();
        mutate(&mut experiment);
        assert_eq!(experiment.validate(), Err(Error::Validation(expected)));
    }

    #[test]
    fn zero_weight_variant_is_allowed_when_total_is_positive() {
        let mut experiment = valid();
        experiment.variants[1].weight = 0.0;
        assert_that!(experiment.validate()).is_ok();
    }

    #[test]
    fn control_falls_back_to_first_variant() {
        let mut experiment = valid();
        assert_eq!(experiment.control().map(|v| v.id.as_str()), Some("A"));
        experiment.variants[0].is_control = false;
        experiment.variants[1].is_control = true;
        assert_eq!(experiment.control().map(|v| v.id.as_str()), Some("B"));
        experiment.variants[1].is_control = false;
        assert_eq!(experiment.control().map(|v| v.id.as_str()), Some("A"));
    }

    #[test]
    fn end_time_comes_from_duration() {
        let mut experiment = valid();
        let start = Utc::now();
        assert_that!(experiment.end_time_from(start)).is_none();

        experiment.duration = Some(Duration::from_secs(3600));
        assert_that!(experiment.end_time_from(start))
            .contains_value(start + chrono::Duration::hours(1));
    }

    #[test]
    fn variant_value_comes_from_config() {
        let variant = Variant::new("B", 1.0).with_value("green");
        assert_that!(variant.value()).contains_value(FlagValue::Str("green".into()));
        assert_that!(Variant::new("A", 1.0).value()).is_none();
    }

    #[test]
    fn parse_experiment() {
        let experiment: Experiment = serde_json::from_value(json!({
            "id": "exp1",
            "name": "Checkout button",
            "type": "multivariate",
            "flag_key": "checkout-button",
            "duration": 604800,
            "traffic_percent": 25.0,
            "variants": [
                {"id": "A", "weight": 50, "is_control": true, "config": {"value": "blue"}},
                {"id": "B", "weight": 50, "config": {"value": "green"}}
            ],
            "targeting_rules": [{"attribute": "country", "operator": "in", "value": ["BR"]}],
            "user_segments": ["beta_users"]
        }))
        .expect("should parse");

        assert_eq!(experiment.status, ExperimentStatus::Draft);
        assert_eq!(experiment.kind, ExperimentKind::Multivariate);
        assert!(experiment.affects_flag("checkout-button"));
        assert_eq!(experiment.duration, Some(Duration::from_secs(604_800)));
        assert_eq!(experiment.variants[1].value(), Some(FlagValue::Str("green".into())));
        assert_that!(experiment.validate()).is_ok();
    }

    #[test]
    fn status_displays_in_snake_case() {
        assert_eq!(ExperimentStatus::Running.to_string(), "running");
        assert_eq!(
            serde_json::to_value(ExperimentStatus::Completed).unwrap(),
            json!("completed")
        );
    }
}
