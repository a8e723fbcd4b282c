//! Event flattener.
//!
//! The ingest endpoint only accepts flat objects whose values are numbers
//! or strings. [`flatten`] reduces an arbitrary [`MetricMap`] to that
//! shape: nested maps are inlined with a `parent_` key prefix, booleans
//! and big integers are coerced, sequences and sets collapse to a single
//! summary key, and long strings are truncated.
//!
//! The function is pure and deterministic; its only observable failure is
//! [`FlattenError::UnsupportedProperty`] for values with no data
//! representation.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::env::env_u64;
use crate::metrics::{ErrorInfo, MetricMap, MetricValue};

/// Truncation bound for ordinary string values.
pub const DEFAULT_MAX_STRING_LENGTH: usize = 100;

/// Truncation bound for error-ish keys (`message`, `errorMessage`,
/// `error`), overridable via `NEW_RELIC_ERROR_METRIC_MAX_STRING_LENGTH`.
pub const DEFAULT_ERROR_METRIC_MAX_STRING_LENGTH: usize = 1500;

/// A flattened event, ready for JSON serialization.
pub type FlatMap = BTreeMap<String, FlatValue>;

/// Scalar values accepted by the ingest endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FlatValue {
    Int(i64),
    Float(f64),
    Str(String),
}

/// Failure raised while flattening an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlattenError {
    /// The event contained a value that has no data representation.
    #[error("unsupported property {key:?} of kind {kind}")]
    UnsupportedProperty { key: String, kind: &'static str },
}

/// Flattens an event to the scalar mapping the ingest endpoint accepts.
pub fn flatten(event: &MetricMap) -> Result<FlatMap, FlattenError> {
    let limits = Limits::from_env();
    let mut out = FlatMap::new();
    for (key, value) in event {
        flatten_value(&mut out, key, value, &limits)?;
    }
    Ok(out)
}

struct Limits {
    max_string: usize,
    max_error_string: usize,
}

impl Limits {
    fn from_env() -> Self {
        Limits {
            max_string: DEFAULT_MAX_STRING_LENGTH,
            max_error_string: env_u64("NEW_RELIC_ERROR_METRIC_MAX_STRING_LENGTH")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(DEFAULT_ERROR_METRIC_MAX_STRING_LENGTH),
        }
    }
}

fn flatten_value(
    out: &mut FlatMap,
    key: &str,
    value: &MetricValue,
    limits: &Limits,
) -> Result<(), FlattenError> {
    match value {
        MetricValue::Null => {}
        MetricValue::Bool(b) => {
            out.insert(key.to_string(), FlatValue::Int(i64::from(*b)));
        }
        MetricValue::Int(i) => {
            out.insert(key.to_string(), FlatValue::Int(*i));
        }
        MetricValue::Float(f) => {
            out.insert(key.to_string(), FlatValue::Float(*f));
        }
        MetricValue::BigInt(i) => {
            out.insert(key.to_string(), FlatValue::Str(i.to_string()));
        }
        MetricValue::Str(s) => {
            out.insert(key.to_string(), FlatValue::Str(truncate(key, s, limits)));
        }
        MetricValue::Map(map) => {
            for (child_key, child) in map {
                flatten_value(out, &format!("{key}_{child_key}"), child, limits)?;
            }
        }
        MetricValue::Entries(entries) => {
            // Only string keys survive; anything else is dropped.
            for (entry_key, child) in entries {
                if let MetricValue::Str(entry_key) = entry_key {
                    flatten_value(out, &format!("{key}_{entry_key}"), child, limits)?;
                }
            }
        }
        MetricValue::Seq(items) | MetricValue::Set(items) => {
            flatten_collection(out, key, items, limits)?;
        }
        MetricValue::Error(info) => {
            let coerced = coerce_error(info);
            for (child_key, child) in &coerced {
                flatten_value(out, &format!("{key}_{child_key}"), child, limits)?;
            }
        }
        MetricValue::Opaque(kind) => {
            return Err(FlattenError::UnsupportedProperty {
                key: key.to_string(),
                kind,
            });
        }
    }
    Ok(())
}

/// Collapses a sequence or set to a single summary key.
///
/// An all-integer collection reduces to its mean under `<key>_mean`; any
/// other non-empty collection reduces to its first item under
/// `<key>_item`. Empty collections vanish.
fn flatten_collection(
    out: &mut FlatMap,
    key: &str,
    items: &[MetricValue],
    limits: &Limits,
) -> Result<(), FlattenError> {
    if items.is_empty() {
        return Ok(());
    }
    let integers: Option<Vec<i64>> = items
        .iter()
        .map(|item| match item {
            MetricValue::Int(i) => Some(*i),
            _ => None,
        })
        .collect();
    if let Some(integers) = integers {
        let mean = integers.iter().sum::<i64>() as f64 / integers.len() as f64;
        out.insert(format!("{key}_mean"), FlatValue::Float(mean));
        Ok(())
    } else {
        flatten_value(out, &format!("{key}_item"), &items[0], limits)
    }
}

/// Coerces an error value to its `{name, message, code, …}` surface.
fn coerce_error(info: &ErrorInfo) -> MetricMap {
    let mut map = MetricMap::new();
    map.insert("name".to_string(), MetricValue::Str(info.name.clone()));
    map.insert("message".to_string(), MetricValue::Str(info.message.clone()));
    if let Some(code) = &info.code {
        map.insert("code".to_string(), MetricValue::Str(code.clone()));
    }
    for (key, value) in &info.extras {
        map.entry(key.clone()).or_insert_with(|| value.clone());
    }
    map
}

fn truncate(key: &str, value: &str, limits: &Limits) -> String {
    let limit = if is_error_key(key) {
        limits.max_error_string
    } else {
        limits.max_string
    };
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let mut truncated: String = value.chars().take(limit).collect();
    truncated.push_str("...");
    truncated
}

/// Error-ish keys get the long truncation bound. The check looks at the
/// final `_`-segment so nested keys like `http_errorMessage` qualify.
fn is_error_key(key: &str) -> bool {
    let leaf = key.rsplit('_').next().unwrap_or(key);
    matches!(leaf, "message" | "errorMessage" | "error")
}
