//! Metric value model.
//!
//! Events handed to the agent are maps from string keys to
//! [`MetricValue`]s. The model is deliberately wider than what the ingest
//! endpoint accepts: nested maps, sequences, sets, and error values are
//! all legal inputs and are reduced to flat scalars by
//! [`flatten::flatten`] at ship time.

pub mod flatten;

use std::collections::BTreeMap;

pub use flatten::{flatten, FlatMap, FlatValue};

/// One metric event: string keys to metric values.
pub type MetricMap = BTreeMap<String, MetricValue>;

/// A value a producer can attach to an event.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// Dropped silently by the flattener.
    Null,
    /// Coerced to `1` / `0`.
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Stringified by the flattener.
    BigInt(i128),
    Str(String),
    /// Plain nested mapping; recursed with a `parent_` key prefix.
    Map(MetricMap),
    /// Mapping with arbitrary keys; non-string keys are dropped.
    Entries(Vec<(MetricValue, MetricValue)>),
    /// Ordered sequence; collapsed to a mean or its first item.
    Seq(Vec<MetricValue>),
    /// Unordered collection, captured in iteration order; collapsed like
    /// a sequence.
    Set(Vec<MetricValue>),
    /// A caught error, coerced to its name/message/code surface.
    Error(ErrorInfo),
    /// A value with no data representation (function pointers and the
    /// like). Flattening fails with `UnsupportedProperty`.
    Opaque(&'static str),
}

impl MetricValue {
    /// Short kind label used in diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            MetricValue::Null => "null",
            MetricValue::Bool(_) => "boolean",
            MetricValue::Int(_) | MetricValue::Float(_) => "number",
            MetricValue::BigInt(_) => "bigint",
            MetricValue::Str(_) => "string",
            MetricValue::Map(_) => "map",
            MetricValue::Entries(_) => "entries",
            MetricValue::Seq(_) => "sequence",
            MetricValue::Set(_) => "set",
            MetricValue::Error(_) => "error",
            MetricValue::Opaque(kind) => kind,
        }
    }
}

/// Error surface carried on a metric value.
///
/// Mirrors what the platform attaches to a thrown error: a name, a
/// message, an optional code, and any extra own properties. The stack
/// trace is deliberately not part of the surface.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
    pub code: Option<String>,
    pub extras: MetricMap,
}

impl ErrorInfo {
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorInfo {
            name: name.into(),
            message: message.into(),
            code: None,
            extras: MetricMap::new(),
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<bool> for MetricValue {
    fn from(value: bool) -> Self {
        MetricValue::Bool(value)
    }
}

impl From<i32> for MetricValue {
    fn from(value: i32) -> Self {
        MetricValue::Int(i64::from(value))
    }
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        MetricValue::Int(value)
    }
}

impl From<u32> for MetricValue {
    fn from(value: u32) -> Self {
        MetricValue::Int(i64::from(value))
    }
}

impl From<u64> for MetricValue {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or_else(|_| MetricValue::BigInt(i128::from(value)), MetricValue::Int)
    }
}

impl From<i128> for MetricValue {
    fn from(value: i128) -> Self {
        MetricValue::BigInt(value)
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Float(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Str(value.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Str(value)
    }
}

impl From<ErrorInfo> for MetricValue {
    fn from(value: ErrorInfo) -> Self {
        MetricValue::Error(value)
    }
}

impl From<serde_json::Value> for MetricValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => MetricValue::Null,
            serde_json::Value::Bool(b) => MetricValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    MetricValue::Int(i)
                } else {
                    MetricValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => MetricValue::Str(s),
            serde_json::Value::Array(items) => {
                MetricValue::Seq(items.into_iter().map(MetricValue::from).collect())
            }
            serde_json::Value::Object(map) => MetricValue::Map(
                map.into_iter()
                    .map(|(key, value)| (key, MetricValue::from(value)))
                    .collect(),
            ),
        }
    }
}
