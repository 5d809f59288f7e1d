mod analytics;
mod attribute_value;
mod bucket;
mod config;
mod context;
mod engine;
mod error;
mod eval;
mod experiment;
mod flag;
mod flag_value;
mod results;
mod rollout;
mod rule;
mod scheduler;
mod segment;
mod store;
mod telemetry;
mod test_common;
mod util;
mod variant;

pub use analytics::*;
pub use attribute_value::*;
pub use bucket::{bucket, fine_bucket};
pub use config::*;
pub use context::*;
pub use engine::*;
pub use error::*;
pub use eval::{Detail, Error as EvalError, Reason};
pub use experiment::*;
pub use flag::*;
pub use flag_value::*;
pub use results::{
    calculate as calculate_results, ConfidenceInterval, ExperimentResults, ResultStatus,
    VariantResult, VariantSample,
};
pub use rollout::{
    default_strategies, should_receive, Comparison, FailedCheck, MetricsSource, RollbackStrategy,
    RolloutKind, RolloutProgress, RolloutStage, RolloutStrategy, SafetyAction, SafetyCheck,
};
pub use rule::{Op, Rule, ValueType};
pub use scheduler::*;
pub use segment::*;
pub use store::*;
pub use telemetry::*;
pub use variant::assign as assign_variant;
