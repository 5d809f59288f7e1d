use crate::bucket::fine_bucket;
use crate::context::UserContext;
use crate::experiment::{Experiment, Variant};
use crate::rule;
use crate::store::Store;

const VARIANT_SALT: &str = "_variant";

/// Picks the variant `context` is served in `experiment`, or None when the user is not part of
/// it.
///
/// The decision is sticky: it depends only on the experiment definition and the user id, so the
/// same user keeps the same variant for as long as the definition is unchanged. Segment ids that
/// cannot be resolved through `store` are ignored. The assigner never records anything; exposure
/// bookkeeping is the caller's job.
pub fn assign<'a>(
    experiment: &'a Experiment,
    context: &UserContext,
    store: &dyn Store,
    segmentation_enabled: bool,
) -> Option<&'a Variant> {
    if !rule::matches(&experiment.targeting_rules, context) {
        return None;
    }

    if segmentation_enabled && !experiment.user_segments.is_empty() {
        let in_any_segment = experiment
            .user_segments
            .iter()
            .filter_map(|id| store.segment(id))
            .any(|segment| segment.contains(context));
        if !in_any_segment {
            return None;
        }
    }

    if fine_bucket(&experiment.id, context.user_id()) >= experiment.traffic_percent {
        return None;
    }

    weighted_pick(experiment, context.user_id())
}

fn weighted_pick<'a>(experiment: &'a Experiment, user_id: &str) -> Option<&'a Variant> {
    let total = experiment.total_weight();
    if total > 0.0 {
        let salted = format!("{}{}", experiment.id, VARIANT_SALT);
        let bucket = fine_bucket(&salted, user_id);

        let mut cumulative = 0.0;
        for variant in &experiment.variants {
            cumulative += variant.weight / total * 100.0;
            if variant.weight > 0.0 && bucket <= cumulative {
                return Some(variant);
            }
        }
    }

    // rounding can leave the walk a hair short of 100
    experiment.control()
}
