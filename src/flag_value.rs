use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::f64_to_i64_safe;

/// The value a flag or an experiment variant serves.
///
/// Serialized untagged, so `true`, `"blue"`, `3` and `{"layout": "grid"}` all read as the
/// matching variant.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Str(String),
    Int(i64),
    Float(f64),
    Json(Value),
}

macro_rules! flag_value_from {
    ($($source:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$source> for FlagValue {
                fn from(v: $source) -> FlagValue {
                    FlagValue::$variant(v.into())
                }
            }
        )*
    };
}

flag_value_from!(bool => Bool, &str => Str, String => Str, i64 => Int, f64 => Float);

/// Variant configs are free JSON; numbers become `Int` when they fit, then `Float`.
impl From<&Value> for FlagValue {
    fn from(json: &Value) -> Self {
        match json {
            Value::Bool(b) => FlagValue::Bool(*b),
            Value::String(s) => FlagValue::Str(s.clone()),
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => FlagValue::Int(i),
                (None, Some(f)) => FlagValue::Float(f),
                (None, None) => {
                    warn!("variant value {} does not fit a number, keeping it as json", n);
                    FlagValue::Json(json.clone())
                }
            },
            Value::Null | Value::Array(_) | Value::Object(_) => FlagValue::Json(json.clone()),
        }
    }
}

impl FlagValue {
    pub fn as_bool(&self) -> Option<bool> {
        if let FlagValue::Bool(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    pub fn as_string(&self) -> Option<String> {
        if let FlagValue::Str(s) = self {
            Some(s.clone())
        } else {
            None
        }
    }

    /// Integers widen to floats.
    pub fn as_float(&self) -> Option<f64> {
        match *self {
            FlagValue::Float(f) => Some(f),
            FlagValue::Int(i) => Some(i as f64),
            _ => None,
        }
    }

    /// Floats truncate toward zero, or None outside the exactly representable integer range.
    pub fn as_int(&self) -> Option<i64> {
        match *self {
            FlagValue::Int(i) => Some(i),
            FlagValue::Float(f) => f64_to_i64_safe(f),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Value {
        match self {
            FlagValue::Json(v) => v.clone(),
            FlagValue::Bool(b) => Value::Bool(*b),
            FlagValue::Str(s) => Value::String(s.clone()),
            FlagValue::Int(i) => (*i).into(),
            FlagValue::Float(f) => (*f).into(),
        }
    }

    /// Short label used to bucket evaluations by value in flag analytics.
    pub(crate) fn distribution_key(&self) -> String {
        match self {
            FlagValue::Str(s) => s.clone(),
            FlagValue::Json(Value::Null) => "null".to_string(),
            FlagValue::Json(_) => "other".to_string(),
            scalar => scalar.as_json().to_string(),
        }
    }
}
