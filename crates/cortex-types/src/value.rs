//! Typed dynamic values for execution context, task parameters, and outputs.
//!
//! `ContextValue` keeps the free-form shape of JSON/YAML configuration while
//! giving callers explicit accessors instead of an untyped bag. It serializes
//! untagged, so `{"retries": 3, "tags": ["a"]}` round-trips naturally.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// String-keyed map of context values (ordered for stable output).
pub type ValueMap = BTreeMap<String, ContextValue>;

/// A dynamically shaped value: string, number, bool, list, or map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    /// Absent / JSON `null`.
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<ContextValue>),
    Map(ValueMap),
}

impl ContextValue {
    /// Short name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            ContextValue::Null => "null",
            ContextValue::Bool(_) => "bool",
            ContextValue::Number(_) => "number",
            ContextValue::String(_) => "string",
            ContextValue::List(_) => "list",
            ContextValue::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ContextValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ContextValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ContextValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Integer view of a number. Returns `None` for fractional values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ContextValue::Number(n) if n.fract() == 0.0 && n.is_finite() => {
                if *n >= i64::MIN as f64 && *n <= i64::MAX as f64 {
                    Some(*n as i64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ContextValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ContextValue]> {
        match self {
            ContextValue::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            ContextValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a key when this value is a map.
    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Resolve a dotted path (`build.artifact.name`) through nested maps.
    ///
    /// Numeric segments index into lists (`items.0`).
    pub fn get_path(&self, path: &str) -> Option<&ContextValue> {
        let mut current = self;
        for segment in path.split('.') {
            current = match current {
                ContextValue::Map(map) => map.get(segment)?,
                ContextValue::List(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Convert into a `serde_json::Value`.
    ///
    /// Integral numbers are emitted as JSON integers; non-finite numbers
    /// become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ContextValue::Null => serde_json::Value::Null,
            ContextValue::Bool(b) => serde_json::Value::Bool(*b),
            ContextValue::Number(n) => match self.as_i64() {
                Some(i) => serde_json::Value::from(i),
                None => serde_json::Number::from_f64(*n)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null),
            },
            ContextValue::String(s) => serde_json::Value::String(s.clone()),
            ContextValue::List(items) => {
                serde_json::Value::Array(items.iter().map(ContextValue::to_json).collect())
            }
            ContextValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

/// Look up a dotted path in a top-level value map.
pub fn lookup_path<'a>(map: &'a ValueMap, path: &str) -> Option<&'a ContextValue> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let root = map.get(head)?;
    match rest {
        Some(rest) => root.get_path(rest),
        None => Some(root),
    }
}

/// Convert a value map into a JSON object.
pub fn map_to_json(map: &ValueMap) -> serde_json::Value {
    serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextValue::String(s) => f.write_str(s),
            ContextValue::Number(n) => match self.as_i64() {
                Some(i) => write!(f, "{i}"),
                None => write!(f, "{n}"),
            },
            other => write!(f, "{}", other.to_json()),
        }
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl From<serde_json::Value> for ContextValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ContextValue::Null,
            serde_json::Value::Bool(b) => ContextValue::Bool(b),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(ContextValue::Number)
                .unwrap_or(ContextValue::Null),
            serde_json::Value::String(s) => ContextValue::String(s),
            serde_json::Value::Array(items) => {
                ContextValue::List(items.into_iter().map(ContextValue::from).collect())
            }
            serde_json::Value::Object(map) => ContextValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, ContextValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&ContextValue> for serde_json::Value {
    fn from(value: &ContextValue) -> Self {
        value.to_json()
    }
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        ContextValue::Bool(value)
    }
}

impl From<f64> for ContextValue {
    fn from(value: f64) -> Self {
        ContextValue::Number(value)
    }
}

impl From<i64> for ContextValue {
    fn from(value: i64) -> Self {
        ContextValue::Number(value as f64)
    }
}

impl From<i32> for ContextValue {
    fn from(value: i32) -> Self {
        ContextValue::Number(f64::from(value))
    }
}

impl From<u32> for ContextValue {
    fn from(value: u32) -> Self {
        ContextValue::Number(f64::from(value))
    }
}

impl From<u64> for ContextValue {
    fn from(value: u64) -> Self {
        ContextValue::Number(value as f64)
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        ContextValue::String(value.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        ContextValue::String(value)
    }
}

impl From<Vec<ContextValue>> for ContextValue {
    fn from(value: Vec<ContextValue>) -> Self {
        ContextValue::List(value)
    }
}

impl From<ValueMap> for ContextValue {
    fn from(value: ValueMap) -> Self {
        ContextValue::Map(value)
    }
}
