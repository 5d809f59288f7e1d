use std::fmt;

use thiserror::Error;

use crate::experiment::ExperimentStatus;

pub type Result<T> = std::result::Result<T, Error>;

/// Error is returned by the management operations of [crate::FlagEngine]. Flag evaluation never
/// returns an error; see [crate::Reason] instead.
#[derive(Debug, Error, PartialEq)]
pub enum Error {
    /// A definition was rejected. Nothing was applied.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The referenced entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// An entity with the same id is already registered.
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: EntityKind, id: String },

    /// The requested lifecycle transition is not allowed from the current status. The experiment
    /// is left unchanged.
    #[error("experiment {id} cannot be {operation} from status {status}")]
    InvalidState {
        id: String,
        status: ExperimentStatus,
        operation: &'static str,
    },

    /// The field cannot change once the experiment is live.
    #[error("experiment {id} is running, {field} cannot be changed")]
    Immutable { id: String, field: &'static str },
}

impl Error {
    pub(crate) fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    Experiment,
    Variant,
    Segment,
    RolloutStrategy,
    Flag,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Experiment => "experiment",
            EntityKind::Variant => "variant",
            EntityKind::Segment => "segment",
            EntityKind::RolloutStrategy => "rollout strategy",
            EntityKind::Flag => "flag",
        };
        f.write_str(name)
    }
}

/// One variant per constraint a definition can violate.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("experiment ID is required")]
    MissingExperimentId,
    #[error("experiment name is required")]
    MissingExperimentName,
    #[error("experiment must have at least 2 variants, got {0}")]
    TooFewVariants(usize),
    #[error("variant {0} has a negative weight")]
    NegativeWeight(String),
    #[error("total variant weight must be greater than 0")]
    ZeroTotalWeight,
    #[error("traffic percent must be between 0 and 100, got {0}")]
    TrafficPercentOutOfRange(f64),
    #[error("at most one variant can be the control, got {0}")]
    MultipleControls(usize),
    #[error("variant IDs must be unique, {0} is repeated")]
    DuplicateVariant(String),
    #[error("new experiments must be draft or scheduled, got {0}")]
    InitialStatus(ExperimentStatus),
    #[error("segment ID is required")]
    MissingSegmentId,
    #[error("rollout strategy ID is required")]
    MissingStrategyId,
    #[error("rollout strategy {0} has no stages")]
    NoStages(String),
    #[error("stage {stage} percentage must be between 0 and 100, got {percentage}")]
    StagePercentOutOfRange { stage: String, percentage: f64 },
    #[error("flag key is required")]
    MissingFlagKey,
}
