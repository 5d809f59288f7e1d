use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::{serde_as, DurationSeconds};

use crate::bucket::bucket;
use crate::context::UserContext;
use crate::error::{Result, ValidationError};

/// A staged, percentage-based expansion of a flag's enabled population.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RolloutStrategy {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RolloutKind,
    #[serde(default)]
    pub config: Map<String, Value>,
    pub stages: Vec<RolloutStage>,
    #[serde(default)]
    pub safety_checks: Vec<SafetyCheck>,
    #[serde(default)]
    pub rollback_strategy: RollbackStrategy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutKind {
    Percentage,
    Canary,
    BlueGreen,
    Ring,
    Geographic,
    Scheduled,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RolloutStage {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Share of users, `0..=100`, that receive the flag while this stage is active.
    pub percentage: f64,
    /// How long the stage runs before it completes on its own. Zero means it never does.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default)]
    pub duration: Duration,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub failure_criteria: Vec<String>,
    #[serde(default)]
    pub auto_advance: bool,
}

/// A health condition over a metric. The check passes while `metric <operator> threshold` holds.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SafetyCheck {
    #[serde(default, rename = "type")]
    pub kind: String,
    pub metric: String,
    pub threshold: f64,
    pub operator: Comparison,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default)]
    pub window: Duration,
    pub action: SafetyAction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "<", alias = "lt", alias = "less_than")]
    LessThan,
    #[serde(rename = "<=", alias = "lte", alias = "less_than_or_equal")]
    LessThanOrEqual,
    #[serde(rename = ">", alias = "gt", alias = "greater_than")]
    GreaterThan,
    #[serde(rename = ">=", alias = "gte", alias = "greater_than_or_equal")]
    GreaterThanOrEqual,
    #[serde(rename = "==", alias = "eq", alias = "equals")]
    Equal,
    #[serde(rename = "!=", alias = "ne", alias = "not_equals")]
    NotEqual,
}

impl Comparison {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::LessThan => value < threshold,
            Comparison::LessThanOrEqual => value <= threshold,
            Comparison::GreaterThan => value > threshold,
            Comparison::GreaterThanOrEqual => value >= threshold,
            Comparison::Equal => value == threshold,
            Comparison::NotEqual => value != threshold,
        }
    }
}

/// What happens when a safety check fails. Ordered by severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyAction {
    Alert,
    Pause,
    Rollback,
}

impl fmt::Display for SafetyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SafetyAction::Alert => "alert",
            SafetyAction::Pause => "pause",
            SafetyAction::Rollback => "rollback",
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackStrategy {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub automatic: bool,
    #[serde(default)]
    pub triggers: Vec<String>,
}

/// MetricsSource supplies the observed value of a metric for a rollout, aggregated over the
/// trailing `window`. None means no data, which never fails a check.
pub trait MetricsSource: Send + Sync {
    fn metric(&self, strategy_id: &str, metric: &str, window: Duration) -> Option<f64>;
}

/// A safety check that did not hold, with the action the tracker should take for it.
#[derive(Clone, Debug, PartialEq)]
pub struct FailedCheck {
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub action: SafetyAction,
}

impl RolloutStrategy {
    pub fn new(id: impl Into<String>, kind: RolloutKind, stages: Vec<RolloutStage>) -> Self {
        let id = id.into();
        RolloutStrategy {
            name: id.clone(),
            id,
            kind,
            config: Map::new(),
            stages,
            safety_checks: Vec::new(),
            rollback_strategy: RollbackStrategy::default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingStrategyId.into());
        }
        if self.stages.is_empty() {
            return Err(ValidationError::NoStages(self.id.clone()).into());
        }
        for stage in &self.stages {
            if !(0.0..=100.0).contains(&stage.percentage) {
                return Err(ValidationError::StagePercentOutOfRange {
                    stage: stage.id.clone(),
                    percentage: stage.percentage,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Runs every safety check against `metrics` and returns the ones that failed.
    ///
    /// A failing rollback check only rolls back when the strategy's rollback is automatic;
    /// otherwise it is reported as a pause.
    pub fn failed_checks(&self, metrics: &dyn MetricsSource) -> Vec<FailedCheck> {
        self.safety_checks
            .iter()
            .filter_map(|check| {
                let value = metrics.metric(&self.id, &check.metric, check.window)?;
                if check.operator.holds(value, check.threshold) {
                    return None;
                }
                let action = match check.action {
                    SafetyAction::Rollback if !self.rollback_strategy.automatic => {
                        SafetyAction::Pause
                    }
                    action => action,
                };
                Some(FailedCheck {
                    metric: check.metric.clone(),
                    value,
                    threshold: check.threshold,
                    action,
                })
            })
            .collect()
    }
}

impl RolloutStage {
    pub fn new(id: impl Into<String>, percentage: f64, duration: Duration, auto_advance: bool) -> Self {
        let id = id.into();
        RolloutStage {
            name: id.clone(),
            id,
            percentage,
            duration,
            success_criteria: Vec::new(),
            failure_criteria: Vec::new(),
            auto_advance,
        }
    }

    fn elapses_by(&self, started_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.auto_advance || self.duration.is_zero() {
            return None;
        }
        let end = started_at.checked_add_signed(chrono::Duration::from_std(self.duration).ok()?)?;
        (end <= now).then_some(end)
    }
}

/// The mutable position of one strategy in its stage sequence.
///
/// Only the committed stage is stored. Stages that completed on their own since then are derived
/// from the clock, so [RolloutProgress::active_stage] is correct between monitor sweeps and
/// [RolloutProgress::tick] merely persists what it computes.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RolloutProgress {
    pub started_at: DateTime<Utc>,
    pub stage_index: usize,
    pub stage_started_at: DateTime<Utc>,
    pub paused: bool,
    pub rolled_back: bool,
}

impl RolloutProgress {
    pub fn new(now: DateTime<Utc>) -> Self {
        RolloutProgress {
            started_at: now,
            stage_index: 0,
            stage_started_at: now,
            paused: false,
            rolled_back: false,
        }
    }

    fn resolve(&self, strategy: &RolloutStrategy, now: DateTime<Utc>) -> (usize, DateTime<Utc>) {
        let mut index = self.stage_index.min(strategy.stages.len().saturating_sub(1));
        let mut started_at = self.stage_started_at;
        if self.paused || self.rolled_back {
            return (index, started_at);
        }

        while index + 1 < strategy.stages.len() {
            match strategy.stages[index].elapses_by(started_at, now) {
                Some(end) => {
                    index += 1;
                    started_at = end;
                }
                None => break,
            }
        }
        (index, started_at)
    }

    /// The first incomplete stage at `now`. The last stage never completes.
    pub fn active_stage<'a>(
        &self,
        strategy: &'a RolloutStrategy,
        now: DateTime<Utc>,
    ) -> Option<&'a RolloutStage> {
        let (index, _) = self.resolve(strategy, now);
        strategy.stages.get(index)
    }

    /// Commits stages that completed by `now`. Returns true when the active stage moved.
    pub fn tick(&mut self, strategy: &RolloutStrategy, now: DateTime<Utc>) -> bool {
        let (index, started_at) = self.resolve(strategy, now);
        let moved = index != self.stage_index;
        self.stage_index = index;
        self.stage_started_at = started_at;
        moved
    }

    /// Completes the active stage by operator action. Returns false on the last stage, or when
    /// the rollout was rolled back.
    pub fn advance(&mut self, strategy: &RolloutStrategy, now: DateTime<Utc>) -> bool {
        self.tick(strategy, now);
        if self.rolled_back || self.stage_index + 1 >= strategy.stages.len() {
            return false;
        }
        self.stage_index += 1;
        self.stage_started_at = now;
        true
    }

    /// Freezes the active stage. Nothing advances until [RolloutProgress::resume].
    pub fn pause(&mut self, strategy: &RolloutStrategy, now: DateTime<Utc>) {
        self.tick(strategy, now);
        self.paused = true;
    }

    /// Lifts a pause. The current stage runs its full duration again from `now`.
    pub fn resume(&mut self, now: DateTime<Utc>) {
        if self.paused {
            self.paused = false;
            self.stage_started_at = now;
        }
    }

    /// Withdraws the flag from every user. A rolled back rollout stays that way until its
    /// strategy is registered again.
    pub fn rollback(&mut self, strategy: &RolloutStrategy, now: DateTime<Utc>) {
        self.tick(strategy, now);
        self.rolled_back = true;
        self.paused = true;
    }

    /// Applies the action of a failed safety check. Alerts leave the progress untouched.
    pub fn apply(&mut self, action: SafetyAction, strategy: &RolloutStrategy, now: DateTime<Utc>) {
        match action {
            SafetyAction::Alert => {}
            SafetyAction::Pause => self.pause(strategy, now),
            SafetyAction::Rollback => self.rollback(strategy, now),
        }
    }
}

/// Whether `context` falls inside the population of the stage active at `now`.
pub fn should_receive(
    strategy: &RolloutStrategy,
    progress: &RolloutProgress,
    context: &UserContext,
    now: DateTime<Utc>,
) -> bool {
    if progress.rolled_back {
        return false;
    }
    match progress.active_stage(strategy, now) {
        Some(stage) => f64::from(bucket(&strategy.id, context.user_id())) < stage.percentage,
        None => false,
    }
}

const HOUR: u64 = 60 * 60;

/// The strategies every engine starts with unless configured otherwise.
pub fn default_strategies() -> Vec<RolloutStrategy> {
    let hours = |h: u64| Duration::from_secs(h * HOUR);
    vec![
        RolloutStrategy {
            name: "Gradual Percentage Rollout".into(),
            safety_checks: vec![
                SafetyCheck {
                    kind: "error_rate".into(),
                    metric: "error_rate".into(),
                    threshold: 5.0,
                    operator: Comparison::LessThan,
                    window: hours(1),
                    action: SafetyAction::Pause,
                },
                SafetyCheck {
                    kind: "latency".into(),
                    metric: "p95_latency".into(),
                    threshold: 2000.0,
                    operator: Comparison::LessThan,
                    window: Duration::from_secs(30 * 60),
                    action: SafetyAction::Pause,
                },
            ],
            rollback_strategy: RollbackStrategy {
                kind: "immediate".into(),
                automatic: true,
                triggers: vec!["safety_check_failure".into(), "manual".into()],
            },
            ..RolloutStrategy::new(
                "percentage_gradual",
                RolloutKind::Percentage,
                vec![
                    named(RolloutStage::new("stage1", 5.0, hours(24), true), "Initial"),
                    named(RolloutStage::new("stage2", 25.0, hours(48), true), "Expand"),
                    named(RolloutStage::new("stage3", 75.0, hours(72), true), "Majority"),
                    named(RolloutStage::new("stage4", 100.0, Duration::ZERO, false), "Full"),
                ],
            )
        },
        RolloutStrategy {
            name: "Canary Deployment".into(),
            ..RolloutStrategy::new(
                "canary_deployment",
                RolloutKind::Canary,
                vec![
                    named(RolloutStage::new("canary", 1.0, hours(2), false), "Canary"),
                    named(RolloutStage::new("production", 100.0, Duration::ZERO, false), "Production"),
                ],
            )
        },
        RolloutStrategy {
            name: "Ring-based Deployment".into(),
            ..RolloutStrategy::new(
                "ring_deployment",
                RolloutKind::Ring,
                vec![
                    named(RolloutStage::new("ring1", 100.0, hours(12), true), "Internal Users"),
                    named(RolloutStage::new("ring2", 100.0, hours(24), true), "Beta Users"),
                    named(RolloutStage::new("ring3", 100.0, Duration::ZERO, false), "All Users"),
                ],
            )
        },
    ]
}

fn named(stage: RolloutStage, name: &str) -> RolloutStage {
    RolloutStage {
        name: name.into(),
        ..stage
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::error::Error;
    use crate::test_common::StaticMetrics;
    use chrono::TimeZone;
    use maplit::hashmap;
    use spectral::prelude::*;
    use test_case::test_case;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn hours(h: i64) -> chrono::Duration {
        chrono::Duration::hours(h)
    }

    fn gradual() -> RolloutStrategy {
        default_strategies()
            .into_iter()
            .find(|s| s.id == "percentage_gradual")
            .expect("built-in strategy")
    }

    fn stage_id<'a>(progress: &RolloutProgress, strategy: &'a RolloutStrategy, now: DateTime<Utc>) -> &'a str {
        progress
            .active_stage(strategy, now)
            .map(|s| s.id.as_str())
            .unwrap_or("none")
    }

    fn metric_values(values: HashMap<&str, f64>) -> StaticMetrics {
        let source = StaticMetrics::default();
        for (metric, value) in values {
            source.set(metric, value);
        }
        source
    }

    #[test_case(0, "stage1")]
    #[test_case(23, "stage1")]
    #[test_case(24, "stage2")]
    #[test_case(71, "stage2")]
    #[test_case(72, "stage3")]
    #[test_case(144, "stage4")]
    #[test_case(10_000, "stage4")]
    fn stages_advance_with_time(elapsed_hours: i64, expected: &str) {
        let strategy = gradual();
        let progress = RolloutProgress::new(t0());
        assert_eq!(stage_id(&progress, &strategy, t0() + hours(elapsed_hours)), expected);
    }

    #[test]
    fn manual_stages_wait_for_the_operator() {
        let strategy = default_strategies()
            .into_iter()
            .find(|s| s.id == "canary_deployment")
            .expect("built-in strategy");
        let mut progress = RolloutProgress::new(t0());

        assert_eq!(stage_id(&progress, &strategy, t0() + hours(1000)), "canary");
        assert!(progress.advance(&strategy, t0() + hours(3)));
        assert_eq!(stage_id(&progress, &strategy, t0() + hours(3)), "production");
        assert!(!progress.advance(&strategy, t0() + hours(4)));
    }

    #[test]
    fn zero_duration_never_elapses() {
        let strategy = RolloutStrategy::new(
            "s",
            RolloutKind::Percentage,
            vec![
                RolloutStage::new("a", 10.0, Duration::ZERO, true),
                RolloutStage::new("b", 100.0, Duration::ZERO, true),
            ],
        );
        let progress = RolloutProgress::new(t0());
        assert_eq!(stage_id(&progress, &strategy, t0() + hours(1_000_000)), "a");
    }

    #[test]
    fn tick_commits_elapsed_stages() {
        let strategy = gradual();
        let mut progress = RolloutProgress::new(t0());

        assert!(!progress.tick(&strategy, t0() + hours(1)));
        assert!(progress.tick(&strategy, t0() + hours(30)));
        assert_eq!(progress.stage_index, 1);
        assert_eq!(progress.stage_started_at, t0() + hours(24));
        assert!(!progress.tick(&strategy, t0() + hours(31)));
    }

    #[test]
    fn pause_freezes_and_resume_restarts_the_stage_timer() {
        let strategy = gradual();
        let mut progress = RolloutProgress::new(t0());

        progress.pause(&strategy, t0() + hours(30));
        assert_eq!(stage_id(&progress, &strategy, t0() + hours(500)), "stage2");

        progress.resume(t0() + hours(500));
        assert_eq!(stage_id(&progress, &strategy, t0() + hours(547)), "stage2");
        assert_eq!(stage_id(&progress, &strategy, t0() + hours(548)), "stage3");
    }

    #[test]
    fn rollback_excludes_everyone() {
        let strategy = gradual();
        let mut progress = RolloutProgress::new(t0());
        progress.rollback(&strategy, t0() + hours(200));

        let included = (0..1000)
            .map(|i| UserContext::with_id(format!("user-{}", i)).build())
            .filter(|user| should_receive(&strategy, &progress, user, t0() + hours(200)))
            .count();
        assert_eq!(included, 0);

        progress.resume(t0() + hours(201));
        assert!(!should_receive(
            &strategy,
            &progress,
            &UserContext::with_id("u1").build(),
            t0() + hours(201)
        ));
    }

    #[test]
    fn population_follows_the_active_percentage() {
        let strategy = gradual();
        let progress = RolloutProgress::new(t0());
        let count_at = |elapsed: i64| {
            (0..10_000)
                .map(|i| UserContext::with_id(format!("user-{}", i)).build())
                .filter(|user| should_receive(&strategy, &progress, user, t0() + hours(elapsed)))
                .count() as f64
                / 10_000.0
        };

        assert_that!(count_at(0)).is_close_to(0.05, 0.02);
        assert_that!(count_at(24)).is_close_to(0.25, 0.02);
        assert_eq!(count_at(200), 1.0);
    }

    #[test]
    fn growing_stages_keep_earlier_users() {
        let strategy = gradual();
        let progress = RolloutProgress::new(t0());
        for i in 0..2000 {
            let user = UserContext::with_id(format!("user-{}", i)).build();
            if should_receive(&strategy, &progress, &user, t0()) {
                assert!(should_receive(&strategy, &progress, &user, t0() + hours(30)));
            }
        }
    }

    #[test]
    fn healthy_metrics_pass_every_check() {
        let metrics = metric_values(hashmap! { "error_rate" => 1.0, "p95_latency" => 300.0 });
        assert_that!(gradual().failed_checks(&metrics)).is_empty();
    }

    #[test]
    fn missing_metrics_never_fail() {
        let metrics = StaticMetrics::default();
        assert_that!(gradual().failed_checks(&metrics)).is_empty();
    }

    #[test]
    fn breached_threshold_fails_the_check() {
        let metrics = metric_values(hashmap! { "error_rate" => 7.5, "p95_latency" => 300.0 });
        let failed = gradual().failed_checks(&metrics);
        assert_eq!(
            failed,
            vec![FailedCheck {
                metric: "error_rate".into(),
                value: 7.5,
                threshold: 5.0,
                action: SafetyAction::Pause,
            }]
        );
    }

    #[test]
    fn rollback_needs_an_automatic_rollback_strategy() {
        let mut strategy = gradual();
        strategy.safety_checks[0].action = SafetyAction::Rollback;
        let metrics = metric_values(hashmap! { "error_rate" => 9.0 });

        assert_eq!(strategy.failed_checks(&metrics)[0].action, SafetyAction::Rollback);

        strategy.rollback_strategy.automatic = false;
        assert_eq!(strategy.failed_checks(&metrics)[0].action, SafetyAction::Pause);
    }

    #[test]
    fn validation() {
        assert_that!(gradual().validate()).is_ok();

        let empty = RolloutStrategy::new("s", RolloutKind::Canary, vec![]);
        assert_eq!(
            empty.validate(),
            Err(Error::Validation(ValidationError::NoStages("s".into())))
        );

        let too_big = RolloutStrategy::new(
            "s",
            RolloutKind::Canary,
            vec![RolloutStage::new("x", 120.0, Duration::ZERO, false)],
        );
        assert!(too_big.validate().is_err());
    }

    #[test]
    fn parse_strategy() {
        let strategy: RolloutStrategy = serde_json::from_str(
            r#"{
                "id": "geo",
                "type": "geographic",
                "stages": [
                    {"id": "br", "percentage": 50, "duration": 3600, "auto_advance": true},
                    {"id": "all", "percentage": 100}
                ],
                "safety_checks": [
                    {"metric": "error_rate", "threshold": 2, "operator": "<", "window": 600, "action": "rollback"}
                ],
                "rollback_strategy": {"type": "immediate", "automatic": true}
            }"#,
        )
        .expect("should parse");

        assert_eq!(strategy.kind, RolloutKind::Geographic);
        assert_eq!(strategy.stages[0].duration, Duration::from_secs(3600));
        assert_eq!(strategy.stages[1].duration, Duration::ZERO);
        assert_eq!(strategy.safety_checks[0].operator, Comparison::LessThan);
        assert_eq!(strategy.safety_checks[0].action, SafetyAction::Rollback);
        assert!(strategy.rollback_strategy.automatic);
    }
}
