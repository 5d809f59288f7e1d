use serde::Serialize;

/// The result of a flag evaluation together with an explanation of how it was reached.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detail<T> {
    /// The value served. When nothing applied this is the default the caller passed in.
    pub value: T,

    /// The experiment variant the user was assigned, if the value came from an experiment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,

    /// Why this value was served.
    pub reason: Reason,
}

impl<T> Detail<T> {
    /// Returns a detail serving `default` because evaluation could not proceed.
    pub fn err_default(error: Error, default: T) -> Detail<T> {
        Detail {
            value: default,
            variant_id: None,
            reason: Reason::Error { error },
        }
    }

    pub(crate) fn with_reason(value: T, reason: Reason) -> Detail<T> {
        Detail {
            value,
            variant_id: None,
            reason,
        }
    }

    /// Converts the served value, keeping the variant and reason.
    pub fn map<U, F>(self, f: F) -> Detail<U>
    where
        F: FnOnce(T) -> U,
    {
        Detail {
            value: f(self.value),
            variant_id: self.variant_id,
            reason: self.reason,
        }
    }
}

/// The rule of the evaluation order that decided a flag's value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum Reason {
    /// The user was assigned a variant of a running experiment and got that variant's value.
    #[serde(rename_all = "camelCase")]
    Experiment {
        experiment_id: String,
        variant_id: String,
    },
    /// The flag is behind a rollout whose active stage does not include the user, so the
    /// caller's default was served.
    #[serde(rename_all = "camelCase")]
    RolloutExcluded { strategy_id: String },
    /// The flag is off and served its off value, or the caller's default when it has none.
    Off,
    /// The flag is on and served its value.
    Fallthrough,
    /// The flag could not be evaluated. The caller's default was served.
    Error {
        #[serde(rename = "errorKind")]
        error: Error,
    },
}

impl Reason {
    /// Short label for this reason, used in analytics and telemetry.
    pub fn label(&self) -> &'static str {
        match self {
            Reason::Experiment { .. } => "experiment",
            Reason::RolloutExcluded { .. } => "rollout_excluded",
            Reason::Off => "off",
            Reason::Fallthrough => "fallthrough",
            Reason::Error { .. } => "error",
        }
    }

    pub fn is_in_experiment(&self) -> bool {
        matches!(self, Reason::Experiment { .. })
    }
}

/// Error is returned via a [Reason::Error] when a flag could not be evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Error {
    /// No experiment serves the flag and no flag with the requested key is registered.
    FlagNotFound,
}
