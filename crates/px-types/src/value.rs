//! Concrete parameter values exchanged between samplers, stores and adapters.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A concrete parameter value produced by a sampler or read back from a store.
///
/// `Json` is the opaque form a value takes when it comes straight out of the
/// configuration document (categorical choices, fixed defaults). Plain
/// variants are what adapters normally see once a value has been normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ParamValue>),
    Json(Value),
}

/// Flat parameter assignment keyed by parameter name, in declaration order.
pub type Params = IndexMap<String, ParamValue>;

/// Custom attributes attached to a trial by the objective.
pub type UserAttrs = IndexMap<String, Value>;

impl ParamValue {
    /// Numeric view of the value, if it has one. Booleans are not numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Json(Value::Number(n)) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Json(Value::Number(n)) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::Json(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Convert into a plain JSON value. Non-finite floats become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(v) => Value::Bool(*v),
            Self::Int(v) => Value::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Str(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Json(v) => v.clone(),
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v}"),
            Self::List(_) | Self::Json(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Wraps configuration data as-is; see [`ParamValue::Json`].
impl From<Value> for ParamValue {
    fn from(v: Value) -> Self {
        Self::Json(v)
    }
}

impl From<&ParamValue> for Value {
    fn from(v: &ParamValue) -> Self {
        v.to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn untagged_deserialization_picks_plain_variants() {
        let values: Vec<ParamValue> =
            serde_json::from_value(json!([true, 3, 2.5, "adam", [1, "a"], null])).unwrap();
        assert_eq!(values[0], ParamValue::Bool(true));
        assert_eq!(values[1], ParamValue::Int(3));
        assert_eq!(values[2], ParamValue::Float(2.5));
        assert_eq!(values[3], ParamValue::Str("adam".into()));
        assert_eq!(
            values[4],
            ParamValue::List(vec![ParamValue::Int(1), ParamValue::Str("a".into())])
        );
        assert_eq!(values[5], ParamValue::Json(Value::Null));
    }

    #[test]
    fn numeric_views() {
        assert_eq!(ParamValue::Int(4).as_f64(), Some(4.0));
        assert_eq!(ParamValue::Json(json!(7)).as_i64(), Some(7));
        assert_eq!(ParamValue::Bool(true).as_f64(), None);
        assert_eq!(ParamValue::Json(json!("x")).as_str(), Some("x"));
    }

    #[test]
    fn non_finite_floats_serialize_as_null() {
        assert_eq!(ParamValue::Float(f64::NAN).to_json(), Value::Null);
        assert_eq!(ParamValue::Float(0.5).to_string(), "0.5");
    }
}
