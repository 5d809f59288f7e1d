use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, DurationRound, Utc};
use log::debug;
use parking_lot::RwLock;
use serde::Serialize;

use crate::flag_value::FlagValue;
use crate::results::VariantSample;
use crate::util::safe_ratio;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExposureEvent {
    pub user_id: String,
    pub experiment_id: String,
    pub variant_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConversionEvent {
    pub user_id: String,
    pub experiment_id: String,
    pub variant_id: String,
    pub event_type: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvaluationEvent {
    pub user_id: String,
    pub flag_key: String,
    pub value: FlagValue,
    /// What the caller asked for when the flag could not decide.
    pub default_value: FlagValue,
    pub reason: String,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ExperimentAnalytics {
    pub experiment_id: String,
    pub total_exposures: u64,
    pub total_conversions: u64,
    pub overall_conversion_rate: f64,
    pub variants: HashMap<String, VariantAnalytics>,
    pub timeline: Vec<TimelinePoint>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct VariantAnalytics {
    pub variant_id: String,
    pub exposures: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
    /// Mean conversion value, 0 without conversions.
    pub average_value: f64,
    pub unique_users: u64,
}

/// Activity within one hour, starting at `timestamp`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimelinePoint {
    pub timestamp: DateTime<Utc>,
    pub exposures: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FlagAnalytics {
    pub flag_key: String,
    pub total_evaluations: u64,
    pub unique_users: u64,
    /// Evaluations that served the caller's default value.
    pub default_evaluations: u64,
    pub value_distribution: HashMap<String, u64>,
}

/// Counters across every experiment and flag, refreshed by [Analytics::process_metrics].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AnalyticsMetrics {
    pub total_exposures: u64,
    pub total_conversions: u64,
    pub total_evaluations: u64,
    pub exposures_by_variant: HashMap<String, HashMap<String, u64>>,
    pub conversions_by_variant: HashMap<String, HashMap<String, u64>>,
    pub flag_evaluations: HashMap<String, u64>,
    pub conversion_rates: HashMap<String, HashMap<String, f64>>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct EventLogs {
    exposures: HashMap<String, Vec<ExposureEvent>>,
    conversions: HashMap<String, Vec<ConversionEvent>>,
    evaluations: HashMap<String, Vec<EvaluationEvent>>,
}

/// Append-only event logs for experiments and flags.
///
/// Every query is computed from the events that survived the last retention sweep, so counts
/// never include pruned data.
pub struct Analytics {
    retention: Duration,
    logs: RwLock<EventLogs>,
    metrics: RwLock<AnalyticsMetrics>,
}

impl Analytics {
    pub fn new(retention: Duration) -> Self {
        Analytics {
            retention,
            logs: RwLock::new(EventLogs::default()),
            metrics: RwLock::new(AnalyticsMetrics::default()),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn record_exposure(&self, experiment_id: &str, variant_id: &str, user_id: &str) {
        self.record_exposure_at(experiment_id, variant_id, user_id, Utc::now());
    }

    pub fn record_exposure_at(
        &self,
        experiment_id: &str,
        variant_id: &str,
        user_id: &str,
        timestamp: DateTime<Utc>,
    ) {
        let event = ExposureEvent {
            user_id: user_id.to_string(),
            experiment_id: experiment_id.to_string(),
            variant_id: variant_id.to_string(),
            timestamp,
        };
        self.logs
            .write()
            .exposures
            .entry(experiment_id.to_string())
            .or_default()
            .push(event);
    }

    pub fn record_conversion(
        &self,
        experiment_id: &str,
        variant_id: &str,
        user_id: &str,
        event_type: &str,
        value: f64,
    ) {
        self.record_conversion_at(
            experiment_id,
            variant_id,
            user_id,
            event_type,
            value,
            Utc::now(),
        );
    }

    pub fn record_conversion_at(
        &self,
        experiment_id: &str,
        variant_id: &str,
        user_id: &str,
        event_type: &str,
        value: f64,
        timestamp: DateTime<Utc>,
    ) {
        let event = ConversionEvent {
            user_id: user_id.to_string(),
            experiment_id: experiment_id.to_string(),
            variant_id: variant_id.to_string(),
            event_type: event_type.to_string(),
            value,
            timestamp,
        };
        self.logs
            .write()
            .conversions
            .entry(experiment_id.to_string())
            .or_default()
            .push(event);
    }

    pub fn record_evaluation(&self, event: EvaluationEvent) {
        self.logs
            .write()
            .evaluations
            .entry(event.flag_key.clone())
            .or_default()
            .push(event);
    }

    pub fn experiment_analytics(&self, experiment_id: &str) -> ExperimentAnalytics {
        let logs = self.logs.read();
        let exposures = logs
            .exposures
            .get(experiment_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let conversions = logs
            .conversions
            .get(experiment_id)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut variants: HashMap<String, VariantAnalytics> = HashMap::new();
        let mut users: HashMap<&str, HashSet<&str>> = HashMap::new();
        let mut value_sums: HashMap<&str, f64> = HashMap::new();

        for exposure in exposures {
            variant_entry(&mut variants, &exposure.variant_id).exposures += 1;
            users
                .entry(exposure.variant_id.as_str())
                .or_default()
                .insert(exposure.user_id.as_str());
        }
        for conversion in conversions {
            variant_entry(&mut variants, &conversion.variant_id).conversions += 1;
            *value_sums.entry(conversion.variant_id.as_str()).or_default() += conversion.value;
        }
        for (variant_id, variant) in variants.iter_mut() {
            variant.conversion_rate = safe_ratio(variant.conversions, variant.exposures);
            variant.unique_users = users.get(variant_id.as_str()).map_or(0, |u| u.len() as u64);
            if variant.conversions > 0 {
                let sum = value_sums.get(variant_id.as_str()).copied().unwrap_or_default();
                variant.average_value = sum / variant.conversions as f64;
            }
        }

        let total_exposures = exposures.len() as u64;
        let total_conversions = conversions.len() as u64;
        ExperimentAnalytics {
            experiment_id: experiment_id.to_string(),
            total_exposures,
            total_conversions,
            overall_conversion_rate: safe_ratio(total_conversions, total_exposures),
            variants,
            timeline: timeline(exposures, conversions),
        }
    }

    pub fn flag_analytics(&self, flag_key: &str) -> FlagAnalytics {
        let logs = self.logs.read();
        let evaluations = logs
            .evaluations
            .get(flag_key)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut value_distribution: HashMap<String, u64> = HashMap::new();
        for evaluation in evaluations {
            *value_distribution
                .entry(evaluation.value.distribution_key())
                .or_default() += 1;
        }
        let unique_users = evaluations
            .iter()
            .map(|e| e.user_id.as_str())
            .collect::<HashSet<_>>()
            .len() as u64;
        let default_evaluations = evaluations
            .iter()
            .filter(|e| e.value == e.default_value)
            .count() as u64;

        FlagAnalytics {
            flag_key: flag_key.to_string(),
            total_evaluations: evaluations.len() as u64,
            unique_users,
            default_evaluations,
            value_distribution,
        }
    }

    /// Unique exposed users and, among them, unique converted users per variant.
    pub fn variant_samples(&self, experiment_id: &str) -> HashMap<String, VariantSample> {
        let logs = self.logs.read();
        let mut exposed: HashMap<&str, HashSet<&str>> = HashMap::new();
        for exposure in logs.exposures.get(experiment_id).into_iter().flatten() {
            exposed
                .entry(exposure.variant_id.as_str())
                .or_default()
                .insert(exposure.user_id.as_str());
        }

        let mut converted: HashMap<&str, HashSet<&str>> = HashMap::new();
        for conversion in logs.conversions.get(experiment_id).into_iter().flatten() {
            let was_exposed = exposed
                .get(conversion.variant_id.as_str())
                .is_some_and(|users| users.contains(conversion.user_id.as_str()));
            if was_exposed {
                converted
                    .entry(conversion.variant_id.as_str())
                    .or_default()
                    .insert(conversion.user_id.as_str());
            }
        }

        exposed
            .iter()
            .map(|(variant_id, users)| {
                let conversions = converted.get(variant_id).map_or(0, |c| c.len() as u64);
                (
                    variant_id.to_string(),
                    VariantSample {
                        samples: users.len() as u64,
                        conversions,
                    },
                )
            })
            .collect()
    }

    /// Rebuilds the metrics snapshot from the surviving events and stores it.
    pub fn process_metrics(&self, now: DateTime<Utc>) -> AnalyticsMetrics {
        let mut metrics = AnalyticsMetrics {
            last_updated: Some(now),
            ..AnalyticsMetrics::default()
        };
        {
            let logs = self.logs.read();
            for (experiment_id, exposures) in &logs.exposures {
                let by_variant = metrics
                    .exposures_by_variant
                    .entry(experiment_id.clone())
                    .or_default();
                for exposure in exposures {
                    *by_variant.entry(exposure.variant_id.clone()).or_default() += 1;
                }
                metrics.total_exposures += exposures.len() as u64;
            }
            for (experiment_id, conversions) in &logs.conversions {
                let by_variant = metrics
                    .conversions_by_variant
                    .entry(experiment_id.clone())
                    .or_default();
                for conversion in conversions {
                    *by_variant.entry(conversion.variant_id.clone()).or_default() += 1;
                }
                metrics.total_conversions += conversions.len() as u64;
            }
            for (flag_key, evaluations) in &logs.evaluations {
                metrics
                    .flag_evaluations
                    .insert(flag_key.clone(), evaluations.len() as u64);
                metrics.total_evaluations += evaluations.len() as u64;
            }
        }

        for (experiment_id, exposures) in &metrics.exposures_by_variant {
            let conversions = metrics.conversions_by_variant.get(experiment_id);
            let rates = exposures
                .iter()
                .map(|(variant_id, exposed)| {
                    let converted = conversions
                        .and_then(|c| c.get(variant_id))
                        .copied()
                        .unwrap_or_default();
                    (variant_id.clone(), safe_ratio(converted, *exposed))
                })
                .collect();
            metrics.conversion_rates.insert(experiment_id.clone(), rates);
        }

        *self.metrics.write() = metrics.clone();
        debug!(
            "processed analytics: {} exposures, {} conversions, {} evaluations",
            metrics.total_exposures, metrics.total_conversions, metrics.total_evaluations
        );
        metrics
    }

    /// The snapshot computed by the last [Analytics::process_metrics] run.
    pub fn metrics(&self) -> AnalyticsMetrics {
        self.metrics.read().clone()
    }

    /// Drops every event older than the retention window. Returns how many were removed.
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = match chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
        {
            Some(cutoff) => cutoff,
            None => return 0,
        };

        let removed = {
            let mut logs = self.logs.write();
            prune(&mut logs.exposures, |e| e.timestamp > cutoff)
                + prune(&mut logs.conversions, |e| e.timestamp > cutoff)
                + prune(&mut logs.evaluations, |e| e.timestamp > cutoff)
        };
        debug!("analytics cleanup removed {} events older than {}", removed, cutoff);
        removed
    }
}

fn variant_entry<'a>(
    variants: &'a mut HashMap<String, VariantAnalytics>,
    variant_id: &str,
) -> &'a mut VariantAnalytics {
    variants
        .entry(variant_id.to_string())
        .or_insert_with(|| VariantAnalytics {
            variant_id: variant_id.to_string(),
            ..VariantAnalytics::default()
        })
}

fn prune<T>(buckets: &mut HashMap<String, Vec<T>>, keep: impl Fn(&T) -> bool) -> usize {
    let mut removed = 0;
    buckets.retain(|_, events| {
        let before = events.len();
        events.retain(|e| keep(e));
        removed += before - events.len();
        !events.is_empty()
    });
    removed
}

fn hour_of(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp
        .duration_trunc(chrono::Duration::hours(1))
        .unwrap_or(timestamp)
}

fn timeline(exposures: &[ExposureEvent], conversions: &[ConversionEvent]) -> Vec<TimelinePoint> {
    let mut hours: BTreeMap<DateTime<Utc>, (u64, u64)> = BTreeMap::new();
    for exposure in exposures {
        hours.entry(hour_of(exposure.timestamp)).or_default().0 += 1;
    }
    for conversion in conversions {
        hours.entry(hour_of(conversion.timestamp)).or_default().1 += 1;
    }
    hours
        .into_iter()
        .map(|(timestamp, (exposures, conversions))| TimelinePoint {
            timestamp,
            exposures,
            conversions,
            conversion_rate: safe_ratio(conversions, exposures),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_include;
    use chrono::TimeZone;
    use serde_json::json;
    use spectral::prelude::*;

    const DAY: u64 = 24 * 60 * 60;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap()
    }

    fn analytics() -> Analytics {
        Analytics::new(Duration::from_secs(30 * DAY))
    }

    fn evaluation(user_id: &str, value: FlagValue, timestamp: DateTime<Utc>) -> EvaluationEvent {
        EvaluationEvent {
            user_id: user_id.into(),
            flag_key: "new-checkout".into(),
            value,
            default_value: FlagValue::Bool(false),
            reason: "fallthrough".into(),
            duration: Duration::from_micros(40),
            timestamp,
        }
    }

    #[test]
    fn zero_exposures_give_zero_rates() {
        let analytics = analytics();
        analytics.record_conversion_at("exp1", "B", "u1", "purchase", 10.0, t0());

        let report = analytics.experiment_analytics("exp1");
        assert_eq!(report.total_exposures, 0);
        assert_eq!(report.overall_conversion_rate, 0.0);
        assert_eq!(report.variants["B"].conversion_rate, 0.0);
        assert_eq!(report.variants["B"].conversions, 1);
    }

    #[test]
    fn unknown_experiment_is_empty() {
        let report = analytics().experiment_analytics("nope");
        assert_eq!(report.total_exposures, 0);
        assert_that!(report.variants).is_empty();
        assert_that!(report.timeline).is_empty();
    }

    #[test]
    fn variant_report() {
        let analytics = analytics();
        for user in ["u1", "u2", "u3", "u1"] {
            analytics.record_exposure_at("exp1", "A", user, t0());
        }
        analytics.record_exposure_at("exp1", "B", "u4", t0());
        analytics.record_conversion_at("exp1", "A", "u1", "purchase", 10.0, t0());
        analytics.record_conversion_at("exp1", "A", "u2", "purchase", 30.0, t0());

        let report = analytics.experiment_analytics("exp1");
        assert_eq!(report.total_exposures, 5);
        assert_eq!(report.total_conversions, 2);
        assert_that!(report.overall_conversion_rate).is_close_to(0.4, 1e-12);

        let a = &report.variants["A"];
        assert_eq!(a.exposures, 4);
        assert_eq!(a.unique_users, 3);
        assert_eq!(a.conversion_rate, 0.5);
        assert_eq!(a.average_value, 20.0);

        let b = &report.variants["B"];
        assert_eq!(b.conversions, 0);
        assert_eq!(b.average_value, 0.0);
    }

    #[test]
    fn timeline_groups_by_hour() {
        let analytics = analytics();
        analytics.record_exposure_at("exp1", "A", "u1", t0());
        analytics.record_exposure_at("exp1", "A", "u2", t0() + chrono::Duration::minutes(30));
        analytics.record_exposure_at("exp1", "A", "u3", t0() + chrono::Duration::hours(2));
        analytics.record_conversion_at("exp1", "A", "u1", "click", 0.0, t0());

        let timeline = analytics.experiment_analytics("exp1").timeline;
        assert_eq!(timeline.len(), 2);
        assert_eq!(
            timeline[0].timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(timeline[0].exposures, 2);
        assert_eq!(timeline[0].conversion_rate, 0.5);
        assert_eq!(timeline[1].exposures, 1);
        assert_eq!(timeline[1].conversions, 0);
    }

    #[test]
    fn samples_count_unique_users() {
        let analytics = analytics();
        analytics.record_exposure_at("exp1", "A", "u1", t0());
        analytics.record_exposure_at("exp1", "A", "u1", t0());
        analytics.record_exposure_at("exp1", "A", "u2", t0());
        analytics.record_conversion_at("exp1", "A", "u1", "purchase", 1.0, t0());
        analytics.record_conversion_at("exp1", "A", "u1", "purchase", 1.0, t0());
        // never exposed to A
        analytics.record_conversion_at("exp1", "A", "u9", "purchase", 1.0, t0());

        let samples = analytics.variant_samples("exp1");
        assert_eq!(
            samples["A"],
            VariantSample {
                samples: 2,
                conversions: 1
            }
        );
    }

    #[test]
    fn flag_report() {
        let analytics = analytics();
        analytics.record_evaluation(evaluation("u1", FlagValue::Bool(true), t0()));
        analytics.record_evaluation(evaluation("u2", FlagValue::Bool(false), t0()));
        analytics.record_evaluation(evaluation("u1", FlagValue::Bool(true), t0()));

        let report = analytics.flag_analytics("new-checkout");
        assert_eq!(report.total_evaluations, 3);
        assert_eq!(report.unique_users, 2);
        assert_eq!(report.default_evaluations, 1);
        assert_eq!(report.value_distribution["true"], 2);
        assert_eq!(report.value_distribution["false"], 1);
    }

    #[test]
    fn cleanup_prunes_events_past_retention() {
        let analytics = analytics();
        let old = t0() - chrono::Duration::days(31);
        analytics.record_exposure_at("old", "A", "u1", old);
        analytics.record_exposure_at("exp1", "A", "u1", old);
        analytics.record_exposure_at("exp1", "A", "u2", t0());
        analytics.record_conversion_at("exp1", "A", "u1", "purchase", 1.0, old);
        analytics.record_evaluation(evaluation("u1", FlagValue::Bool(true), old));

        assert_eq!(analytics.cleanup_expired(t0()), 4);

        let report = analytics.experiment_analytics("exp1");
        assert_eq!(report.total_exposures, 1);
        assert_eq!(report.total_conversions, 0);
        assert_eq!(analytics.experiment_analytics("old").total_exposures, 0);
        assert_eq!(analytics.flag_analytics("new-checkout").total_evaluations, 0);

        let metrics = analytics.process_metrics(t0());
        assert_that!(metrics.exposures_by_variant.contains_key("old")).is_false();
        assert_eq!(analytics.cleanup_expired(t0()), 0);
    }

    #[test]
    fn metrics_snapshot() {
        let analytics = analytics();
        analytics.record_exposure_at("exp1", "A", "u1", t0());
        analytics.record_exposure_at("exp1", "A", "u2", t0());
        analytics.record_exposure_at("exp1", "B", "u3", t0());
        analytics.record_conversion_at("exp1", "A", "u1", "purchase", 5.0, t0());
        analytics.record_evaluation(evaluation("u1", FlagValue::Str("blue".into()), t0()));

        assert_eq!(analytics.metrics(), AnalyticsMetrics::default());
        let metrics = analytics.process_metrics(t0());
        assert_eq!(analytics.metrics(), metrics);

        assert_json_include!(
            actual: serde_json::to_value(&metrics).unwrap(),
            expected: json!({
                "total_exposures": 3,
                "total_conversions": 1,
                "total_evaluations": 1,
                "exposures_by_variant": {"exp1": {"A": 2, "B": 1}},
                "conversions_by_variant": {"exp1": {"A": 1}},
                "flag_evaluations": {"new-checkout": 1},
                "conversion_rates": {"exp1": {"A": 0.5, "B": 0.0}}
            })
        );
    }
}
