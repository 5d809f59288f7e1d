//! Statistical comparison of experiment variants.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

use crate::experiment::{Experiment, ExperimentStatus, Variant};
use crate::util::safe_ratio;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Fewer samples than the configured minimum.
    #[default]
    InProgress,
    Significant,
    Insignificant,
    /// Enough samples, but the test cannot be computed (an arm without samples, or no variance).
    Inconclusive,
}

/// Exposure and conversion counts of one variant, in unique users.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VariantSample {
    pub samples: u64,
    pub conversions: u64,
}

impl VariantSample {
    pub fn rate(&self) -> f64 {
        safe_ratio(self.conversions, self.samples)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    pub level: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariantResult {
    pub variant_id: String,
    pub samples: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
    pub confidence: ConfidenceInterval,
}

#[serde_as]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub status: ResultStatus,
    /// `1 - p_value`, or 0 when no test could be run.
    pub confidence: f64,
    pub significant_result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winning_variant: Option<String>,
    #[serde(default)]
    pub variant_results: HashMap<String, VariantResult>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default)]
    pub duration: Option<Duration>,
    pub total_samples: u64,
    #[serde(default)]
    pub p_value: Option<f64>,
    /// Absolute difference between the conversion rates of the compared arms.
    pub effect_size: f64,
}

/// Compares the control against the best-performing treatment with a pooled two-proportion
/// z-test.
///
/// `significance` is the required confidence level, e.g. 0.95, and also the level of every
/// variant's confidence interval. Variants absent from `samples` count as having no samples.
pub fn calculate(
    experiment: &Experiment,
    samples: &HashMap<String, VariantSample>,
    significance: f64,
    min_sample_size: u64,
    now: DateTime<Utc>,
) -> ExperimentResults {
    let sample_of = |variant: &Variant| samples.get(&variant.id).copied().unwrap_or_default();
    let z = critical_z(significance);

    let variant_results: HashMap<String, VariantResult> = experiment
        .variants
        .iter()
        .map(|variant| {
            let sample = sample_of(variant);
            (
                variant.id.clone(),
                VariantResult {
                    variant_id: variant.id.clone(),
                    samples: sample.samples,
                    conversions: sample.conversions,
                    conversion_rate: sample.rate(),
                    confidence: wald_interval(sample, significance, z),
                },
            )
        })
        .collect();
    let total_samples = variant_results.values().map(|r| r.samples).sum();

    let end_time = match experiment.status {
        ExperimentStatus::Completed | ExperimentStatus::Archived => experiment.end_time,
        _ => None,
    };
    let duration = experiment
        .start_time
        .and_then(|start| (end_time.unwrap_or(now) - start).to_std().ok());

    let mut results = ExperimentResults {
        status: ResultStatus::InProgress,
        confidence: 0.0,
        significant_result: false,
        winning_variant: None,
        variant_results,
        start_time: experiment.start_time,
        end_time,
        duration,
        total_samples,
        p_value: None,
        effect_size: 0.0,
    };

    let control = match experiment.control() {
        Some(control) => control,
        None => return results,
    };
    let challenger = experiment
        .variants
        .iter()
        .filter(|v| v.id != control.id)
        .fold(None::<&Variant>, |best, v| match best {
            Some(b) if sample_of(b).rate() >= sample_of(v).rate() => Some(b),
            _ => Some(v),
        });
    let challenger = match challenger {
        Some(challenger) => challenger,
        None => return results,
    };

    let control_sample = sample_of(control);
    let challenger_sample = sample_of(challenger);
    results.effect_size = (challenger_sample.rate() - control_sample.rate()).abs();

    let p_value = two_proportion_test(control_sample, challenger_sample);
    results.p_value = p_value;
    results.confidence = p_value.map(|p| (1.0 - p).clamp(0.0, 1.0)).unwrap_or(0.0);

    if total_samples < min_sample_size {
        return results;
    }

    match p_value {
        None => results.status = ResultStatus::Inconclusive,
        Some(p) if p < 1.0 - significance => {
            results.status = ResultStatus::Significant;
            results.significant_result = true;
            let winner = if challenger_sample.rate() > control_sample.rate() {
                challenger
            } else {
                control
            };
            results.winning_variant = Some(winner.id.clone());
        }
        Some(_) => results.status = ResultStatus::Insignificant,
    }
    results
}

fn two_proportion_test(a: VariantSample, b: VariantSample) -> Option<f64> {
    if a.samples == 0 || b.samples == 0 {
        return None;
    }
    let n1 = a.samples as f64;
    let n2 = b.samples as f64;
    let pooled = (a.conversions + b.conversions) as f64 / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if se == 0.0 || !se.is_finite() {
        return None;
    }
    let z = (a.rate() - b.rate()) / se;
    Some((2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0))
}

// Abramowitz-Stegun approximation, valid for z >= 0.
fn normal_cdf(z: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.231_641_9 * z);
    let d = 0.398_942_3 * (-0.5 * z * z).exp();
    let prob = d
        * t
        * (0.319_381_5
            + t * (-0.356_563_8 + t * (1.781_478 + t * (-1.821_256 + t * 1.330_274))));
    1.0 - prob
}

/// Two-sided critical value for `level`, found by bisection on [normal_cdf].
fn critical_z(level: f64) -> f64 {
    let target = 1.0 - (1.0 - level.clamp(0.0, 1.0)) / 2.0;
    let (mut lo, mut hi) = (0.0_f64, 10.0_f64);
    for _ in 0..64 {
        let mid = (lo + hi) / 2.0;
        if normal_cdf(mid) < target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    (lo + hi) / 2.0
}

fn wald_interval(sample: VariantSample, level: f64, z: f64) -> ConfidenceInterval {
    if sample.samples == 0 {
        return ConfidenceInterval {
            lower: 0.0,
            upper: 0.0,
            level,
        };
    }
    let p = sample.rate();
    let margin = z * (p * (1.0 - p) / sample.samples as f64).sqrt();
    ConfidenceInterval {
        lower: (p - margin).max(0.0),
        upper: (p + margin).min(1.0),
        level,
    }
}
