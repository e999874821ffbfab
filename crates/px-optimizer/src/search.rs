//! Search space definitions: parsing parameter domains out of a nested
//! configuration tree, flattening it, and rebuilding nested reports.

use indexmap::IndexMap;
use px_types::{ParamValue, Params, PxResult, SearchSpaceError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::warn;

use crate::sampler::Distribution;
use crate::study::Trial;

/// Declared domain of a single parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamSpec {
    /// Constant; never sampled, never recorded on the trial.
    Fixed(Value),
    /// One of an ordered list of choices.
    Categorical(Vec<Value>),
    /// Numeric interval `[low, high]`, optionally stepped or log-scaled.
    Range {
        low: Number,
        high: Number,
        step: Option<Number>,
        log: bool,
    },
}

fn invalid(name: &str, message: impl Into<String>) -> SearchSpaceError {
    SearchSpaceError::InvalidSpec {
        name: name.to_string(),
        message: message.into(),
    }
}

fn invalid_range(name: &str, message: impl Into<String>) -> SearchSpaceError {
    SearchSpaceError::InvalidRangeConfig {
        name: name.to_string(),
        message: message.into(),
    }
}

fn plain_number(value: &Value) -> Option<&Number> {
    match value {
        Value::Number(n) => Some(n),
        _ => None,
    }
}

fn is_integral(n: &Number) -> bool {
    n.is_i64() || n.is_u64()
}

impl ParamSpec {
    /// Numeric range with both bounds validated.
    fn range(
        name: &str,
        low: &Number,
        high: &Number,
        step: Option<Number>,
        log: bool,
    ) -> Result<Self, SearchSpaceError> {
        let (lo, hi) = (low.as_f64().unwrap_or(f64::NAN), high.as_f64().unwrap_or(f64::NAN));
        if !(lo < hi) {
            return Err(invalid(name, format!("lower bound {low} must be below upper bound {high}")));
        }
        Ok(Self::Range {
            low: low.clone(),
            high: high.clone(),
            step,
            log,
        })
    }

    /// Turn the declared domain into something a sampler can draw from.
    ///
    /// Integer sampling is chosen when both bounds are integers and the step,
    /// if any, is integral; everything else is sampled as a float. Returns
    /// `None` for fixed parameters.
    pub fn distribution(&self, name: &str) -> Result<Option<Distribution>, SearchSpaceError> {
        match self {
            Self::Fixed(_) => Ok(None),
            Self::Categorical(choices) => Ok(Some(Distribution::Categorical {
                choices: choices.clone(),
            })),
            Self::Range {
                low,
                high,
                step,
                log,
            } => {
                let step_value = step.as_ref().and_then(Number::as_f64);
                if let Some(s) = step_value {
                    if !(s > 0.0) {
                        return Err(invalid_range(name, format!("step must be positive, got {s}")));
                    }
                }
                let lo = low.as_f64().unwrap_or(f64::NAN);
                let hi = high.as_f64().unwrap_or(f64::NAN);
                if *log && lo <= 0.0 {
                    return Err(invalid_range(
                        name,
                        format!("log scale needs a positive lower bound, got {low}"),
                    ));
                }

                let step_is_int = step_value.map_or(true, |s| s.fract() == 0.0);
                let bounds_are_int = is_integral(low) && is_integral(high);
                if bounds_are_int && step_is_int {
                    if *log && step.is_some() {
                        return Err(invalid_range(
                            name,
                            "cannot use log with a step for int range",
                        ));
                    }
                    let (Some(low), Some(high)) = (low.as_i64(), high.as_i64()) else {
                        return Err(invalid_range(
                            name,
                            format!("integer bounds [{low}, {high}] must fit in i64"),
                        ));
                    };
                    let step = match step {
                        None => 1,
                        Some(s) => s.as_i64().unwrap_or(step_value.unwrap_or(1.0) as i64),
                    };
                    return Ok(Some(Distribution::Int {
                        low,
                        high,
                        step,
                        log: *log,
                    }));
                }

                if *log && step.is_some() {
                    return Err(invalid_range(name, "cannot use log with a step for float range"));
                }
                Ok(Some(Distribution::Float {
                    low: lo,
                    high: hi,
                    step: step_value,
                    log: *log,
                }))
            }
        }
    }
}

/// Parse one leaf of the configuration tree.
///
/// - `{"range": [lo, hi], "step"?: s, "log"?: bool}` is a range
/// - `{"choices": [...]}` is categorical
/// - a two-element, all-numeric list (no booleans) is an inclusive range
/// - any other list is categorical
/// - anything else is a fixed value
pub fn parse_spec(raw: &Value, name: &str) -> Result<ParamSpec, SearchSpaceError> {
    match raw {
        Value::Object(obj) if obj.contains_key("range") => {
            let bounds = obj["range"]
                .as_array()
                .filter(|b| b.len() == 2)
                .ok_or_else(|| invalid(name, "'range' must be a [low, high] pair"))?;
            let (low, high) = match (plain_number(&bounds[0]), plain_number(&bounds[1])) {
                (Some(low), Some(high)) => (low, high),
                _ => return Err(invalid(name, "'range' bounds must be numbers")),
            };
            let step = match obj.get("step") {
                None | Some(Value::Null) => None,
                Some(Value::Number(n)) => Some(n.clone()),
                Some(other) => return Err(invalid(name, format!("'step' must be a number, got {other}"))),
            };
            let log = match obj.get("log") {
                None | Some(Value::Null) => false,
                Some(Value::Bool(b)) => *b,
                Some(other) => return Err(invalid(name, format!("'log' must be a boolean, got {other}"))),
            };
            ParamSpec::range(name, low, high, step, log)
        }
        Value::Object(obj) if obj.contains_key("choices") => match &obj["choices"] {
            Value::Array(choices) if !choices.is_empty() => Ok(ParamSpec::Categorical(choices.clone())),
            _ => Err(invalid(name, "'choices' must be a non-empty list")),
        },
        Value::Array(items) => {
            if let [Value::Number(low), Value::Number(high)] = items.as_slice() {
                return ParamSpec::range(name, low, high, None, false);
            }
            if items.is_empty() {
                return Err(invalid(name, "an empty list has no choices"));
            }
            Ok(ParamSpec::Categorical(items.clone()))
        }
        other => Ok(ParamSpec::Fixed(other.clone())),
    }
}

/// True for a mapping that declares a domain rather than a nested group.
pub fn is_spec_marker(raw: &Value) -> bool {
    matches!(raw, Value::Object(obj) if obj.contains_key("range") || obj.contains_key("choices"))
}

/// Flatten a nested tree into name → raw leaf spec.
///
/// Names are global: a leaf nested under one group overwrites an earlier
/// leaf of the same name from anywhere else in the tree.
pub fn flatten(tree: &Map<String, Value>) -> IndexMap<String, Value> {
    let mut flat = IndexMap::new();
    flatten_into(tree, &mut flat);
    flat
}

fn flatten_into(tree: &Map<String, Value>, flat: &mut IndexMap<String, Value>) {
    for (key, value) in tree {
        match value {
            Value::Object(children) if !is_spec_marker(value) => flatten_into(children, flat),
            leaf => {
                if flat.insert(key.clone(), leaf.clone()).is_some() {
                    warn!(param = %key, "search space name collision; later declaration wins");
                }
            }
        }
    }
}

/// Mirror the shape of `tree`, keeping only leaves that have a value.
///
/// Groups are always emitted, even when none of their leaves survive.
pub fn rebuild_tree(tree: &Map<String, Value>, values: &Params) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, spec) in tree {
        match spec {
            Value::Object(children) if !is_spec_marker(spec) => {
                out.insert(key.clone(), Value::Object(rebuild_tree(children, values)));
            }
            _ => {
                if let Some(value) = values.get(key) {
                    out.insert(key.clone(), value.to_json());
                }
            }
        }
    }
    out
}

/// Value of `name` from `known`, falling back to the fixed default.
pub fn resolve_value(
    name: &str,
    spec: &ParamSpec,
    known: &Params,
) -> Result<ParamValue, SearchSpaceError> {
    if let Some(value) = known.get(name) {
        return Ok(value.clone());
    }
    match spec {
        ParamSpec::Fixed(value) => Ok(ParamValue::Json(value.clone())),
        _ => Err(SearchSpaceError::MissingParameter {
            name: name.to_string(),
        }),
    }
}

/// Unwrap configuration-shaped values into plain scalars and lists.
///
/// Idempotent; already-plain values pass through untouched. `null` and
/// mappings have no plain form and stay wrapped.
pub fn normalize(value: ParamValue) -> ParamValue {
    match value {
        ParamValue::List(items) => ParamValue::List(items.into_iter().map(normalize).collect()),
        ParamValue::Json(raw) => unwrap_json(raw),
        plain => plain,
    }
}

fn unwrap_json(raw: Value) -> ParamValue {
    match raw {
        Value::Bool(b) => ParamValue::Bool(b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => ParamValue::Int(i),
            (None, Some(f)) => ParamValue::Float(f),
            _ => ParamValue::Json(Value::Number(n)),
        },
        Value::String(s) => ParamValue::Str(s),
        Value::Array(items) => ParamValue::List(items.into_iter().map(unwrap_json).collect()),
        other => ParamValue::Json(other),
    }
}

/// The compiled, flat search space. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSpace {
    params: IndexMap<String, ParamSpec>,
    tree: Map<String, Value>,
}

impl SearchSpace {
    /// Flatten `tree` and parse every leaf.
    pub fn compile(tree: &Map<String, Value>) -> Result<Self, SearchSpaceError> {
        let params = flatten(tree)
            .into_iter()
            .map(|(name, raw)| parse_spec(&raw, &name).map(|spec| (name, spec)))
            .collect::<Result<IndexMap<_, _>, _>>()?;
        Ok(Self {
            params,
            tree: tree.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.params.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamSpec)> {
        self.params.iter()
    }

    /// The nested tree the space was compiled from.
    pub fn tree(&self) -> &Map<String, Value> {
        &self.tree
    }

    /// Every declared parameter resolved against `known`, normalized.
    pub fn resolve_all(&self, known: &Params) -> Result<Params, SearchSpaceError> {
        self.params
            .iter()
            .map(|(name, spec)| {
                resolve_value(name, spec, known).map(|v| (name.clone(), normalize(v)))
            })
            .collect()
    }
}

/// Produce a concrete value for one parameter on a live trial.
pub fn suggest_value(trial: &mut Trial, name: &str, spec: &ParamSpec) -> PxResult<ParamValue> {
    match spec.distribution(name)? {
        Some(distribution) => trial.suggest(name, distribution),
        None => Ok(resolve_value(name, spec, &Params::new())?),
    }
}

/// Suggest every parameter of the space, normalized.
pub fn suggest_params(trial: &mut Trial, space: &SearchSpace) -> PxResult<Params> {
    space
        .iter()
        .map(|(name, spec)| Ok((name.clone(), normalize(suggest_value(trial, name, spec)?))))
        .collect()
}
