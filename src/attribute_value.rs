use std::collections::HashMap;

use itertools::Itertools;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::format_number;

/// A typed value in a user's attribute bag, or the comparison value of a [crate::Rule].
///
/// Numbers are always floats so that `31` in a context and `31.0` in a rule are the same value.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Number(f64),
    Bool(bool),
    Array(Vec<AttributeValue>),
    #[default]
    Null,
}

macro_rules! attribute_value_from {
    ($($source:ty => |$v:ident| $convert:expr),* $(,)?) => {
        $(
            impl From<$source> for AttributeValue {
                fn from($v: $source) -> AttributeValue {
                    $convert
                }
            }
        )*
    };
}

attribute_value_from!(
    &str => |s| AttributeValue::String(s.to_owned()),
    String => |s| AttributeValue::String(s),
    bool => |b| AttributeValue::Bool(b),
    i64 => |i| AttributeValue::Number(i as f64),
    f64 => |f| AttributeValue::Number(f),
);

impl<T> From<Vec<T>> for AttributeValue
where
    AttributeValue: From<T>,
{
    fn from(v: Vec<T>) -> AttributeValue {
        v.into_iter().collect()
    }
}

impl<T> FromIterator<T> for AttributeValue
where
    AttributeValue: From<T>,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        AttributeValue::Array(iter.into_iter().map(AttributeValue::from).collect())
    }
}

/// Attributes supplied as JSON. Objects have no typed counterpart and are kept as their JSON text.
impl From<&Value> for AttributeValue {
    fn from(json: &Value) -> Self {
        match json {
            Value::Null => AttributeValue::Null,
            Value::Bool(b) => (*b).into(),
            Value::String(s) => s.as_str().into(),
            Value::Number(n) => n.as_f64().map(AttributeValue::Number).unwrap_or_else(|| {
                warn!("attribute number {} is not a finite float, keeping it as a string", n);
                AttributeValue::String(n.to_string())
            }),
            Value::Array(items) => items.iter().collect(),
            Value::Object(_) => {
                warn!("object attributes are not supported, storing the json text");
                AttributeValue::String(json.to_string())
            }
        }
    }
}

impl AttributeValue {
    /// The string itself, without coercing other kinds.
    pub fn as_str(&self) -> Option<&str> {
        if let AttributeValue::String(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// Coerces numbers and numeric strings into a float. Anything else, including strings that do
    /// not parse, returns None.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(f) => Some(*f),
            AttributeValue::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        }
    }

    /// Coerces booleans and the strings "true"/"false" (case-insensitive) into a bool.
    pub fn to_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            AttributeValue::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
            AttributeValue::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
    }

    /// The string representation used by string operators and loose comparisons.
    pub fn to_display_string(&self) -> String {
        match self {
            AttributeValue::String(s) => s.clone(),
            AttributeValue::Number(f) => format_number(*f),
            AttributeValue::Bool(b) => b.to_string(),
            AttributeValue::Array(values) => values
                .iter()
                .map(AttributeValue::to_display_string)
                .join(","),
            AttributeValue::Null => String::new(),
        }
    }

    /// Typed equality, falling back to comparing string representations so that a rule value of
    /// `"42"` matches an attribute of `42`.
    pub fn loosely_equals(&self, other: &AttributeValue) -> bool {
        if self == other {
            return true;
        }
        match (self, other) {
            (AttributeValue::Null, _) | (_, AttributeValue::Null) => false,
            (AttributeValue::Array(_), _) | (_, AttributeValue::Array(_)) => false,
            _ => self.to_display_string() == other.to_display_string(),
        }
    }

    /// Returns the elements of an array, or the value itself as a one-element slice.
    pub fn as_list(&self) -> &[AttributeValue] {
        match self {
            AttributeValue::Array(values) => values,
            other => std::slice::from_ref(other),
        }
    }
}

/// A bag of named attributes attached to a user.
pub type Attributes = HashMap<String, AttributeValue>;
