use serde::{Deserialize, Serialize};

use crate::error::{Result, ValidationError};
use crate::eval::{Detail, Reason};
use crate::flag_value::FlagValue;

/// A basic flag: a single value that is either served or not.
///
/// Experiments and rollouts are layered on top of flags by the engine. A flag that names a
/// rollout strategy is only served to the users inside that rollout's active stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub description: String,

    pub on: bool,
    pub value: FlagValue,
    /// Served while the flag is off. Without one the caller's default is served.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off_value: Option<FlagValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_strategy: Option<String>,
}

impl Flag {
    pub fn new(key: impl Into<String>, value: impl Into<FlagValue>) -> Self {
        Flag {
            key: key.into(),
            version: 0,
            description: String::new(),
            on: true,
            value: value.into(),
            off_value: None,
            rollout_strategy: None,
        }
    }

    pub fn with_rollout(mut self, strategy_id: impl Into<String>) -> Self {
        self.rollout_strategy = Some(strategy_id.into());
        self
    }

    pub fn off(mut self, off_value: Option<FlagValue>) -> Self {
        self.on = false;
        self.off_value = off_value;
        self
    }

    /// The value this flag serves on its own, before rollouts are considered.
    pub fn evaluate(&self, default: FlagValue) -> Detail<FlagValue> {
        if !self.on {
            let value = self.off_value.clone().unwrap_or(default);
            return Detail::with_reason(value, Reason::Off);
        }
        Detail::with_reason(self.value.clone(), Reason::Fallthrough)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(ValidationError::MissingFlagKey.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;

    #[test]
    fn on_flag_serves_its_value() {
        let detail = Flag::new("dark-mode", true).evaluate(FlagValue::Bool(false));
        assert_eq!(detail.value, FlagValue::Bool(true));
        assert_eq!(detail.reason, Reason::Fallthrough);
    }

    #[test]
    fn off_flag_serves_off_value_or_default() {
        let with_off_value = Flag::new("color", "blue").off(Some("grey".into()));
        assert_eq!(
            with_off_value.evaluate("red".into()).value,
            FlagValue::Str("grey".into())
        );

        let without = Flag::new("color", "blue").off(None);
        let detail = without.evaluate("red".into());
        assert_eq!(detail.value, FlagValue::Str("red".into()));
        assert_eq!(detail.reason, Reason::Off);
    }

    #[test]
    fn parse_flag() {
        let flag: Flag = serde_json::from_str(
            r#"{"key": "limit", "on": true, "value": 25, "rollout_strategy": "canary_deployment"}"#,
        )
        .expect("should parse");

        assert_eq!(flag.value, FlagValue::Int(25));
        assert_that!(flag.off_value).is_none();
        assert_that!(flag.rollout_strategy).contains_value("canary_deployment".to_string());
        assert_that!(flag.validate()).is_ok();
    }

    #[test]
    fn flag_requires_a_key() {
        assert!(Flag::new("", true).validate().is_err());
    }
}
