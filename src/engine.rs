use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::analytics::{Analytics, AnalyticsMetrics, EvaluationEvent};
use crate::config::{ConfigError, EngineConfig};
use crate::context::UserContext;
use crate::error::{EntityKind, Error, Result, ValidationError};
use crate::eval::{self, Detail, Reason};
use crate::experiment::{Experiment, ExperimentStatus, Variant};
use crate::flag::Flag;
use crate::flag_value::FlagValue;
use crate::results::{self, ExperimentResults, ResultStatus};
use crate::rollout::{self, MetricsSource, RolloutProgress, RolloutStage, RolloutStrategy, SafetyAction};
use crate::scheduler::Scheduler;
use crate::segment::UserSegment;
use crate::telemetry::{
    Telemetry, EXPERIMENT_CONVERSIONS_TOTAL, EXPERIMENT_CONVERSION_VALUE,
    EXPERIMENT_EXPOSURES_TOTAL, FLAG_EVALUATIONS_TOTAL, FLAG_EVALUATION_DURATION_MS,
};
use crate::variant;

struct RolloutEntry {
    strategy: RolloutStrategy,
    progress: RolloutProgress,
}

struct Assignment {
    experiment_id: String,
    variant_id: String,
    value: Option<FlagValue>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Transition {
    Schedule(DateTime<Utc>),
    Start,
    Pause,
    Resume,
    Stop,
    Expire,
    Archive,
}

impl Transition {
    fn allowed_from(self, status: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        matches!(
            (self, status),
            (Transition::Schedule(_), Draft)
                | (Transition::Start, Draft | Scheduled)
                | (Transition::Pause, Running)
                | (Transition::Resume, Paused)
                | (Transition::Stop, Running)
                | (Transition::Expire, Running | Paused)
                | (Transition::Archive, Completed)
        )
    }

    fn target(self) -> ExperimentStatus {
        match self {
            Transition::Schedule(_) => ExperimentStatus::Scheduled,
            Transition::Start | Transition::Resume => ExperimentStatus::Running,
            Transition::Pause => ExperimentStatus::Paused,
            Transition::Stop | Transition::Expire => ExperimentStatus::Completed,
            Transition::Archive => ExperimentStatus::Archived,
        }
    }

    fn operation(self) -> &'static str {
        match self {
            Transition::Schedule(_) => "scheduled",
            Transition::Start => "started",
            Transition::Pause => "paused",
            Transition::Resume => "resumed",
            Transition::Stop => "stopped",
            Transition::Expire => "completed",
            Transition::Archive => "archived",
        }
    }
}

/// What a [FlagEngine::monitor_experiments] sweep changed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExperimentSweep {
    pub started: Vec<String>,
    pub completed: Vec<String>,
}

/// What a [FlagEngine::monitor_rollouts] sweep changed. `advanced` pairs a strategy id with the
/// id of its new active stage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RolloutSweep {
    pub advanced: Vec<(String, String)>,
    pub paused: Vec<String>,
    pub rolled_back: Vec<String>,
}

/// FlagEngine owns every registry of the experimentation core and evaluates flags against them.
///
/// Registries are guarded by reader/writer locks, always taken in the order experiments,
/// segments, rollouts, flags. Analytics keeps its own lock and is only entered after every
/// registry lock has been released, and logging and telemetry happen outside all of them.
pub struct FlagEngine {
    config: EngineConfig,
    experiments: RwLock<HashMap<String, Experiment>>,
    segments: RwLock<HashMap<String, UserSegment>>,
    rollouts: RwLock<HashMap<String, RolloutEntry>>,
    flags: RwLock<HashMap<String, Flag>>,
    analytics: Analytics,
    telemetry: Option<Arc<dyn Telemetry>>,
    metrics_source: Option<Arc<dyn MetricsSource>>,
}

impl Default for FlagEngine {
    fn default() -> Self {
        Self::seeded(EngineConfig::default())
    }
}

impl FlagEngine {
    /// Builds an engine seeded with the configured segments and rollout strategies. Invalid seeds
    /// are logged and skipped; an invalid config is rejected.
    pub fn new(config: EngineConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::seeded(config))
    }

    fn seeded(config: EngineConfig) -> Self {
        let now = Utc::now();
        let mut segments = HashMap::new();
        for segment in &config.default_segments {
            match segment.validate() {
                Ok(()) => {
                    segments.insert(segment.id.clone(), segment.clone());
                }
                Err(e) => warn!("skipping configured segment {:?}: {}", segment.id, e),
            }
        }
        let mut rollouts = HashMap::new();
        for strategy in &config.rollout_strategies {
            match strategy.validate() {
                Ok(()) => {
                    rollouts.insert(
                        strategy.id.clone(),
                        RolloutEntry {
                            strategy: strategy.clone(),
                            progress: RolloutProgress::new(now),
                        },
                    );
                }
                Err(e) => warn!("skipping configured rollout strategy {:?}: {}", strategy.id, e),
            }
        }

        FlagEngine {
            analytics: Analytics::new(config.analytics_retention),
            config,
            experiments: RwLock::new(HashMap::new()),
            segments: RwLock::new(segments),
            rollouts: RwLock::new(rollouts),
            flags: RwLock::new(HashMap::new()),
            telemetry: None,
            metrics_source: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Supplies the metric values rollout safety checks are evaluated against. Without one, safety
    /// checks never fail.
    pub fn with_metrics_source(mut self, metrics_source: Arc<dyn MetricsSource>) -> Self {
        self.metrics_source = Some(metrics_source);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn analytics(&self) -> &Analytics {
        &self.analytics
    }

    // Flags

    pub fn upsert_flag(&self, flag: Flag) -> Result<()> {
        flag.validate()?;
        self.flags.write().insert(flag.key.clone(), flag);
        Ok(())
    }

    pub fn flag(&self, key: &str) -> Option<Flag> {
        self.flags.read().get(key).cloned()
    }

    pub fn delete_flag(&self, key: &str) -> Result<Flag> {
        let removed = self.flags.write().remove(key);
        removed.ok_or_else(|| Error::not_found(EntityKind::Flag, key))
    }

    // Experiments

    /// A draft experiment filled in with the configured defaults.
    pub fn new_experiment(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        variants: Vec<Variant>,
    ) -> Experiment {
        let defaults = &self.config.experiment_defaults;
        Experiment {
            duration: Some(defaults.duration),
            traffic_percent: defaults.traffic_percent,
            ..Experiment::new(id, name, variants)
        }
    }

    /// Registers a new experiment. It must be a draft or scheduled; scheduled experiments are
    /// started by [FlagEngine::monitor_experiments] once their start time has passed.
    pub fn create_experiment(&self, mut experiment: Experiment) -> Result<()> {
        experiment.validate()?;
        if !matches!(
            experiment.status,
            ExperimentStatus::Draft | ExperimentStatus::Scheduled
        ) {
            return Err(ValidationError::InitialStatus(experiment.status).into());
        }
        experiment.results = Some(ExperimentResults::default());

        let id = experiment.id.clone();
        let summary = format!(
            "{} variants, {}% traffic",
            experiment.variants.len(),
            experiment.traffic_percent
        );
        {
            let mut experiments = self.experiments.write();
            if experiments.contains_key(&id) {
                return Err(Error::AlreadyExists {
                    kind: EntityKind::Experiment,
                    id,
                });
            }
            experiments.insert(id.clone(), experiment);
        }

        info!("experiment {} created ({})", id, summary);
        Ok(())
    }

    pub fn experiment(&self, id: &str) -> Result<Experiment> {
        let experiment = self.experiments.read().get(id).cloned();
        experiment.ok_or_else(|| Error::not_found(EntityKind::Experiment, id))
    }

    /// Every experiment, ordered by id.
    pub fn experiments(&self) -> Vec<Experiment> {
        let mut experiments: Vec<Experiment> = self.experiments.read().values().cloned().collect();
        experiments.sort_by(|a, b| a.id.cmp(&b.id));
        experiments
    }

    /// Replaces the definition of an experiment with the same id.
    ///
    /// Draft and scheduled experiments take the whole new definition. Live experiments, running
    /// or paused, only take a new description and end time; any change to what decides
    /// assignments is rejected.
    pub fn update_experiment(&self, update: Experiment) -> Result<()> {
        let id = update.id.clone();
        {
            let mut experiments = self.experiments.write();
            let current = experiments
                .get_mut(&id)
                .ok_or_else(|| Error::not_found(EntityKind::Experiment, id.as_str()))?;

            match current.status {
                ExperimentStatus::Draft | ExperimentStatus::Scheduled => {
                    update.validate()?;
                    let status = current.status;
                    *current = Experiment {
                        status,
                        results: Some(ExperimentResults::default()),
                        ..update
                    };
                }
                ExperimentStatus::Running | ExperimentStatus::Paused => {
                    let immutable = |field: &'static str| Error::Immutable {
                        id: id.clone(),
                        field,
                    };
                    if current.variants != update.variants {
                        return Err(immutable("variants"));
                    }
                    if current.traffic_percent != update.traffic_percent {
                        return Err(immutable("traffic_percent"));
                    }
                    if current.targeting_rules != update.targeting_rules {
                        return Err(immutable("targeting_rules"));
                    }
                    if current.user_segments != update.user_segments {
                        return Err(immutable("user_segments"));
                    }
                    if current.flag_key != update.flag_key {
                        return Err(immutable("flag_key"));
                    }
                    current.description = update.description;
                    current.end_time = update.end_time;
                }
                status => {
                    return Err(Error::InvalidState {
                        id,
                        status,
                        operation: "updated",
                    })
                }
            }
        }

        info!("experiment {} updated", id);
        Ok(())
    }

    /// Moves a draft to scheduled. The next experiment monitor sweep at or after `start_time`
    /// starts it.
    pub fn schedule_experiment(&self, id: &str, start_time: DateTime<Utc>) -> Result<()> {
        self.transition(id, Transition::Schedule(start_time), Utc::now())
    }

    pub fn start_experiment(&self, id: &str) -> Result<()> {
        self.transition(id, Transition::Start, Utc::now())
    }

    pub fn pause_experiment(&self, id: &str) -> Result<()> {
        self.transition(id, Transition::Pause, Utc::now())
    }

    pub fn resume_experiment(&self, id: &str) -> Result<()> {
        self.transition(id, Transition::Resume, Utc::now())
    }

    /// Completes a running experiment and stores its final results.
    pub fn stop_experiment(&self, id: &str) -> Result<()> {
        self.transition(id, Transition::Stop, Utc::now())
    }

    pub fn archive_experiment(&self, id: &str) -> Result<()> {
        self.transition(id, Transition::Archive, Utc::now())
    }

    /// Computes results from the current analytics without storing them.
    pub fn experiment_results(&self, id: &str) -> Result<ExperimentResults> {
        let experiment = self.experiment(id)?;
        let samples = self.analytics.variant_samples(id);
        Ok(self.calculate_results(&experiment, &samples, Utc::now()))
    }

    fn calculate_results(
        &self,
        experiment: &Experiment,
        samples: &HashMap<String, results::VariantSample>,
        now: DateTime<Utc>,
    ) -> ExperimentResults {
        results::calculate(
            experiment,
            samples,
            self.config.statistical_significance,
            self.config.min_sample_size,
            now,
        )
    }

    fn transition(&self, id: &str, transition: Transition, now: DateTime<Utc>) -> Result<()> {
        let samples = match transition {
            Transition::Stop | Transition::Expire => self.analytics.variant_samples(id),
            _ => HashMap::new(),
        };

        {
            let mut experiments = self.experiments.write();
            let experiment = experiments
                .get_mut(id)
                .ok_or_else(|| Error::not_found(EntityKind::Experiment, id))?;
            if !transition.allowed_from(experiment.status) {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    status: experiment.status,
                    operation: transition.operation(),
                });
            }

            experiment.status = transition.target();
            match transition {
                Transition::Schedule(start_time) => experiment.start_time = Some(start_time),
                Transition::Start => {
                    experiment.start_time = Some(now);
                    if let Some(end) = experiment.end_time_from(now) {
                        experiment.end_time = Some(end);
                    }
                    experiment.results = Some(ExperimentResults {
                        status: ResultStatus::InProgress,
                        start_time: Some(now),
                        ..ExperimentResults::default()
                    });
                }
                Transition::Stop | Transition::Expire => {
                    if transition == Transition::Stop || experiment.end_time.is_none() {
                        experiment.end_time = Some(now);
                    }
                    let results = self.calculate_results(experiment, &samples, now);
                    experiment.results = Some(results);
                }
                Transition::Pause | Transition::Resume | Transition::Archive => {}
            }
        }

        info!("experiment {} {}", id, transition.operation());
        Ok(())
    }

    // Segments

    pub fn create_segment(&self, segment: UserSegment) -> Result<()> {
        segment.validate()?;
        let id = segment.id.clone();
        {
            let mut segments = self.segments.write();
            if segments.contains_key(&id) {
                return Err(Error::AlreadyExists {
                    kind: EntityKind::Segment,
                    id,
                });
            }
            segments.insert(id.clone(), segment);
        }
        info!("segment {} created", id);
        Ok(())
    }

    pub fn segment(&self, id: &str) -> Result<UserSegment> {
        let segment = self.segments.read().get(id).cloned();
        segment.ok_or_else(|| Error::not_found(EntityKind::Segment, id))
    }

    /// Removes a segment. Experiments that still reference it stop matching on it.
    pub fn delete_segment(&self, id: &str) -> Result<UserSegment> {
        let removed = self.segments.write().remove(id);
        let segment = removed.ok_or_else(|| Error::not_found(EntityKind::Segment, id))?;
        info!("segment {} deleted", id);
        Ok(segment)
    }

    pub fn evaluate_user_segment(&self, segment_id: &str, context: &UserContext) -> Result<bool> {
        let segments = self.segments.read();
        let segment = segments
            .get(segment_id)
            .ok_or_else(|| Error::not_found(EntityKind::Segment, segment_id))?;
        Ok(segment.contains(context))
    }

    // Rollouts

    /// Registers a strategy, replacing one with the same id. The rollout starts over at its first
    /// stage.
    pub fn register_rollout_strategy(&self, strategy: RolloutStrategy) -> Result<()> {
        self.register_rollout_strategy_at(strategy, Utc::now())
    }

    pub fn register_rollout_strategy_at(
        &self,
        strategy: RolloutStrategy,
        now: DateTime<Utc>,
    ) -> Result<()> {
        strategy.validate()?;
        let id = strategy.id.clone();
        let stages = strategy.stages.len();
        self.rollouts.write().insert(
            id.clone(),
            RolloutEntry {
                strategy,
                progress: RolloutProgress::new(now),
            },
        );
        info!("rollout strategy {} registered with {} stages", id, stages);
        Ok(())
    }

    pub fn rollout_strategy(&self, id: &str) -> Result<RolloutStrategy> {
        self.with_rollout(id, |entry| entry.strategy.clone())
    }

    pub fn rollout_progress(&self, id: &str) -> Result<RolloutProgress> {
        self.with_rollout(id, |entry| entry.progress.clone())
    }

    pub fn active_rollout_stage(&self, id: &str) -> Result<RolloutStage> {
        self.active_rollout_stage_at(id, Utc::now())
    }

    pub fn active_rollout_stage_at(&self, id: &str, now: DateTime<Utc>) -> Result<RolloutStage> {
        let stage = self.with_rollout(id, |entry| {
            entry.progress.active_stage(&entry.strategy, now).cloned()
        })?;
        // strategies are validated to have at least one stage
        stage.ok_or_else(|| ValidationError::NoStages(id.to_string()).into())
    }

    pub fn should_receive(&self, strategy_id: &str, context: &UserContext) -> Result<bool> {
        let now = Utc::now();
        self.with_rollout(strategy_id, |entry| {
            rollout::should_receive(&entry.strategy, &entry.progress, context, now)
        })
    }

    /// Completes the active stage by hand. Returns the stage active afterwards, which is
    /// unchanged on the last stage.
    pub fn advance_rollout(&self, id: &str) -> Result<RolloutStage> {
        let now = Utc::now();
        let (moved, stage) = self.with_rollout_mut(id, |entry| {
            let moved = entry.progress.advance(&entry.strategy, now);
            (moved, entry.strategy.stages[entry.progress.stage_index].clone())
        })?;
        if moved {
            info!("rollout {} advanced to stage {}", id, stage.id);
        }
        Ok(stage)
    }

    pub fn pause_rollout(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        self.with_rollout_mut(id, |entry| entry.progress.pause(&entry.strategy, now))?;
        info!("rollout {} paused", id);
        Ok(())
    }

    pub fn resume_rollout(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        self.with_rollout_mut(id, |entry| entry.progress.resume(now))?;
        info!("rollout {} resumed", id);
        Ok(())
    }

    pub fn rollback_rollout(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        self.with_rollout_mut(id, |entry| entry.progress.rollback(&entry.strategy, now))?;
        info!("rollout {} rolled back", id);
        Ok(())
    }

    fn with_rollout<T>(&self, id: &str, f: impl FnOnce(&RolloutEntry) -> T) -> Result<T> {
        let rollouts = self.rollouts.read();
        let entry = rollouts
            .get(id)
            .ok_or_else(|| Error::not_found(EntityKind::RolloutStrategy, id))?;
        Ok(f(entry))
    }

    fn with_rollout_mut<T>(&self, id: &str, f: impl FnOnce(&mut RolloutEntry) -> T) -> Result<T> {
        let mut rollouts = self.rollouts.write();
        let entry = rollouts
            .get_mut(id)
            .ok_or_else(|| Error::not_found(EntityKind::RolloutStrategy, id))?;
        Ok(f(entry))
    }

    // Evaluation

    /// Evaluates a flag for `context`. Never fails: when nothing applies, `default` is served.
    pub fn evaluate_flag(&self, flag_key: &str, context: &UserContext, default: FlagValue) -> FlagValue {
        self.evaluate_flag_detail(flag_key, context, default).value
    }

    /// Evaluates a flag and explains the result.
    ///
    /// A running experiment bound to the flag wins when it assigns the user a variant that
    /// declares a value. Otherwise the flag's rollout decides whether the user gets the flag at
    /// all, and the flag itself decides the value.
    pub fn evaluate_flag_detail(
        &self,
        flag_key: &str,
        context: &UserContext,
        default: FlagValue,
    ) -> Detail<FlagValue> {
        let started = Instant::now();
        let now = Utc::now();

        let assignment = if self.config.experimentation_enabled {
            self.assign(flag_key, context)
        } else {
            None
        };

        let detail = match &assignment {
            Some(Assignment {
                experiment_id,
                variant_id,
                value: Some(value),
            }) => Detail {
                value: value.clone(),
                variant_id: Some(variant_id.clone()),
                reason: Reason::Experiment {
                    experiment_id: experiment_id.clone(),
                    variant_id: variant_id.clone(),
                },
            },
            _ => self.evaluate_flag_without_experiment(flag_key, context, default.clone(), now),
        };

        if let Some(assignment) = &assignment {
            self.record_exposure(&assignment.experiment_id, &assignment.variant_id, context, now);
        }
        self.record_evaluation(flag_key, context, &detail, default, started, now);
        detail
    }

    fn assign(&self, flag_key: &str, context: &UserContext) -> Option<Assignment> {
        let experiments = self.experiments.read();
        let experiment = experiments
            .values()
            .filter(|e| e.is_running() && e.affects_flag(flag_key))
            .min_by(|a, b| a.id.cmp(&b.id))?;

        let segments = self.segments.read();
        let variant = variant::assign(
            experiment,
            context,
            &*segments,
            self.config.segmentation_enabled,
        )?;
        Some(Assignment {
            experiment_id: experiment.id.clone(),
            variant_id: variant.id.clone(),
            value: variant.value(),
        })
    }

    fn evaluate_flag_without_experiment(
        &self,
        flag_key: &str,
        context: &UserContext,
        default: FlagValue,
        now: DateTime<Utc>,
    ) -> Detail<FlagValue> {
        let flag = self.flags.read().get(flag_key).cloned();
        let flag = match flag {
            Some(flag) => flag,
            None => return Detail::err_default(eval::Error::FlagNotFound, default),
        };

        let strategy_id = flag
            .rollout_strategy
            .clone()
            .or_else(|| self.config.default_rollout_strategy.clone());
        if let Some(strategy_id) = strategy_id {
            let included = self
                .rollouts
                .read()
                .get(&strategy_id)
                .map(|entry| rollout::should_receive(&entry.strategy, &entry.progress, context, now));
            match included {
                Some(true) => {}
                Some(false) => {
                    return Detail::with_reason(default, Reason::RolloutExcluded { strategy_id })
                }
                None => warn!(
                    "flag {} uses unknown rollout strategy {}, serving it ungated",
                    flag_key, strategy_id
                ),
            }
        }

        flag.evaluate(default)
    }

    fn record_exposure(
        &self,
        experiment_id: &str,
        variant_id: &str,
        context: &UserContext,
        now: DateTime<Utc>,
    ) {
        if self.config.analytics_enabled {
            self.analytics
                .record_exposure_at(experiment_id, variant_id, context.user_id(), now);
        }
        if let Some(telemetry) = &self.telemetry {
            telemetry.increment_counter(
                EXPERIMENT_EXPOSURES_TOTAL,
                &[("experiment_id", experiment_id), ("variant_id", variant_id)],
            );
        }
    }

    fn record_evaluation(
        &self,
        flag_key: &str,
        context: &UserContext,
        detail: &Detail<FlagValue>,
        default: FlagValue,
        started: Instant,
        now: DateTime<Utc>,
    ) {
        let duration = started.elapsed();
        let reason = detail.reason.label();
        if self.config.analytics_enabled {
            self.analytics.record_evaluation(EvaluationEvent {
                user_id: context.user_id().to_string(),
                flag_key: flag_key.to_string(),
                value: detail.value.clone(),
                default_value: default,
                reason: reason.to_string(),
                duration,
                timestamp: now,
            });
        }
        if let Some(telemetry) = &self.telemetry {
            telemetry.increment_counter(
                FLAG_EVALUATIONS_TOTAL,
                &[("flag_key", flag_key), ("reason", reason)],
            );
            telemetry.record_histogram(
                FLAG_EVALUATION_DURATION_MS,
                duration.as_secs_f64() * 1000.0,
                &[("flag_key", flag_key)],
            );
        }
    }

    /// Records that `user_id`, exposed to `variant_id`, converted.
    pub fn record_conversion(
        &self,
        experiment_id: &str,
        variant_id: &str,
        user_id: &str,
        event_type: &str,
        value: f64,
    ) -> Result<()> {
        {
            let experiments = self.experiments.read();
            let experiment = experiments
                .get(experiment_id)
                .ok_or_else(|| Error::not_found(EntityKind::Experiment, experiment_id))?;
            if experiment.variant(variant_id).is_none() {
                return Err(Error::not_found(EntityKind::Variant, variant_id));
            }
        }

        if self.config.analytics_enabled {
            self.analytics
                .record_conversion(experiment_id, variant_id, user_id, event_type, value);
        }
        if let Some(telemetry) = &self.telemetry {
            let labels = [
                ("experiment_id", experiment_id),
                ("variant_id", variant_id),
                ("event_type", event_type),
            ];
            telemetry.increment_counter(EXPERIMENT_CONVERSIONS_TOTAL, &labels);
            if value > 0.0 {
                telemetry.record_histogram(EXPERIMENT_CONVERSION_VALUE, value, &labels);
            }
        }
        Ok(())
    }

    // Background work

    /// Starts scheduled experiments that are due, completes running or paused ones past their end
    /// time, refreshes interim results and stops running experiments early once they are
    /// significant.
    pub fn monitor_experiments(&self, now: DateTime<Utc>) -> ExperimentSweep {
        let mut sweep = ExperimentSweep::default();
        if !self.config.experimentation_enabled {
            return sweep;
        }

        let (mut due, mut live) = {
            let experiments = self.experiments.read();
            let due: Vec<String> = experiments
                .values()
                .filter(|e| e.status == ExperimentStatus::Scheduled)
                .filter(|e| e.start_time.map_or(true, |start| start <= now))
                .map(|e| e.id.clone())
                .collect();
            let live: Vec<Experiment> = experiments
                .values()
                .filter(|e| {
                    matches!(e.status, ExperimentStatus::Running | ExperimentStatus::Paused)
                })
                .cloned()
                .collect();
            (due, live)
        };
        due.sort();
        live.sort_by(|a, b| a.id.cmp(&b.id));

        for id in due {
            match self.transition(&id, Transition::Start, now) {
                Ok(()) => sweep.started.push(id),
                Err(e) => warn!("could not start scheduled experiment {}: {}", id, e),
            }
        }

        let significance = self.config.statistical_significance;
        for experiment in live {
            let id = experiment.id.as_str();
            let expired = experiment.end_time.is_some_and(|end| end <= now);

            let stop = if expired {
                Some(Transition::Expire)
            } else if !experiment.is_running() {
                None
            } else {
                let samples = self.analytics.variant_samples(id);
                let results = self.calculate_results(&experiment, &samples, now);
                let significant = results.significant_result && results.confidence >= significance;
                {
                    let mut experiments = self.experiments.write();
                    if let Some(current) = experiments.get_mut(id).filter(|e| e.is_running()) {
                        current.results = Some(results);
                    }
                }
                if significant {
                    info!("experiment {} reached significance, stopping early", id);
                }
                significant.then_some(Transition::Stop)
            };

            if let Some(transition) = stop {
                match self.transition(id, transition, now) {
                    Ok(()) => sweep.completed.push(id.to_string()),
                    Err(e) => warn!("could not complete experiment {}: {}", id, e),
                }
            }
        }

        debug!(
            "experiment sweep started {} and completed {} experiments",
            sweep.started.len(),
            sweep.completed.len()
        );
        sweep
    }

    /// Commits elapsed rollout stages and runs safety checks, pausing or rolling back rollouts
    /// whose checks fail.
    pub fn monitor_rollouts(&self, now: DateTime<Utc>) -> RolloutSweep {
        let active: Vec<RolloutStrategy> = self
            .rollouts
            .read()
            .values()
            .filter(|e| !e.progress.paused && !e.progress.rolled_back)
            .map(|e| e.strategy.clone())
            .collect();

        let mut failures = HashMap::new();
        if let Some(metrics) = &self.metrics_source {
            for strategy in &active {
                let failed = strategy.failed_checks(metrics.as_ref());
                if let Some(action) = failed.iter().map(|f| f.action).max() {
                    failures.insert(strategy.id.clone(), (action, failed));
                }
            }
        }

        let mut sweep = RolloutSweep::default();
        {
            let mut rollouts = self.rollouts.write();
            for (id, entry) in rollouts.iter_mut() {
                if entry.progress.tick(&entry.strategy, now) {
                    let stage = &entry.strategy.stages[entry.progress.stage_index];
                    sweep.advanced.push((id.clone(), stage.id.clone()));
                }
                let action = match failures.get(id) {
                    Some((action, _)) if !entry.progress.paused && !entry.progress.rolled_back => {
                        *action
                    }
                    _ => continue,
                };
                entry.progress.apply(action, &entry.strategy, now);
                match action {
                    SafetyAction::Pause => sweep.paused.push(id.clone()),
                    SafetyAction::Rollback => sweep.rolled_back.push(id.clone()),
                    SafetyAction::Alert => {}
                }
            }
        }
        sweep.advanced.sort();
        sweep.paused.sort();
        sweep.rolled_back.sort();

        for (id, (_, failed)) in &failures {
            for check in failed {
                warn!(
                    "rollout {} safety check on {} failed: {} against threshold {}, action {}",
                    id, check.metric, check.value, check.threshold, check.action
                );
            }
        }
        for (id, stage) in &sweep.advanced {
            info!("rollout {} advanced to stage {}", id, stage);
        }
        for id in &sweep.paused {
            info!("rollout {} paused by safety check", id);
        }
        for id in &sweep.rolled_back {
            info!("rollout {} rolled back by safety check", id);
        }
        sweep
    }

    pub fn process_analytics(&self, now: DateTime<Utc>) -> AnalyticsMetrics {
        self.analytics.process_metrics(now)
    }

    /// Prunes analytics events older than the retention window.
    pub fn cleanup_analytics(&self, now: DateTime<Utc>) -> usize {
        self.analytics.cleanup_expired(now)
    }

    /// Starts the periodic sweeps on the current tokio runtime. Dropping the returned scheduler
    /// without calling [Scheduler::shutdown] leaves the jobs running.
    pub fn spawn_background(self: &Arc<Self>) -> Scheduler {
        let mut scheduler = Scheduler::new();
        let intervals = &self.config.intervals;

        if self.config.experimentation_enabled {
            let engine = Arc::clone(self);
            scheduler.register_periodic("experiment_monitor", intervals.experiment_monitor, move || {
                engine.monitor_experiments(Utc::now());
            });
        }
        if self.config.analytics_enabled {
            let engine = Arc::clone(self);
            scheduler.register_periodic(
                "analytics_processing",
                intervals.analytics_processing,
                move || {
                    engine.process_analytics(Utc::now());
                },
            );
            let engine = Arc::clone(self);
            scheduler.register_periodic("data_cleanup", intervals.data_cleanup, move || {
                engine.cleanup_analytics(Utc::now());
            });
        }
        let engine = Arc::clone(self);
        scheduler.register_periodic("rollout_monitor", intervals.rollout_monitor, move || {
            engine.monitor_rollouts(Utc::now());
        });

        scheduler.start();
        scheduler
    }
}
