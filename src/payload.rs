//! Cross-boundary payloads and call arguments.
//!
//! `Payload` is the only value type a task may produce. It is closed over
//! primitive scalars and composites of them, so every result can be handed
//! from an isolated worker back to its submitter.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// A value safe to move across the worker/submitter boundary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Payload>),
    Map(BTreeMap<String, Payload>),
}

impl Payload {
    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(b) => Some(*b as i64 as f64),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Payload]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Payload>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Truthiness, used by `and`/`or`/`not` in expressions.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Text(s) => !s.is_empty(),
            Self::List(items) => !items.is_empty(),
            Self::Map(map) => !map.is_empty(),
        }
    }

    /// Verify the value can be handed across an address-space boundary.
    ///
    /// Non-finite floats have no portable encoding and are rejected.
    pub fn ensure_portable(&self) -> Result<(), TaskError> {
        match self {
            Self::Float(f) if !f.is_finite() => Err(TaskError::UnserializableValue {
                reason: format!("non-finite float {f}"),
            }),
            Self::List(items) => items.iter().try_for_each(Payload::ensure_portable),
            Self::Map(map) => map.values().try_for_each(Payload::ensure_portable),
            _ => Ok(()),
        }
    }

    /// Encode, then decode, the value through its wire form.
    pub fn seal(self) -> Result<Payload, TaskError> {
        self.ensure_portable()?;
        let bytes = serde_json::to_vec(&self).map_err(|e| TaskError::UnserializableValue {
            reason: e.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| TaskError::UnserializableValue {
            reason: e.to_string(),
        })
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Payload {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Payload {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Payload {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<usize> for Payload {
    fn from(v: usize) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for Payload {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Payload {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Payload {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<Payload>> From<Vec<T>> for Payload {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, Payload>> for Payload {
    fn from(v: BTreeMap<String, Payload>) -> Self {
        Self::Map(v)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::None,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::Text(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Payload::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Payload::from(v))).collect())
            }
        }
    }
}

/// Arguments handed to an invocable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Args {
    Positional(Vec<Payload>),
    Keyword(BTreeMap<String, Payload>),
}

impl Args {
    pub fn none() -> Self {
        Self::Positional(Vec::new())
    }

    pub fn positional(values: impl IntoIterator<Item = Payload>) -> Self {
        Self::Positional(values.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Positional(v) => v.is_empty(),
            Self::Keyword(m) => m.is_empty(),
        }
    }

    /// Positional arguments, or an error naming `target` if keywords were given.
    pub fn into_positional(self, target: &str) -> Result<Vec<Payload>, TaskError> {
        match self {
            Self::Positional(v) => Ok(v),
            Self::Keyword(m) if m.is_empty() => Ok(Vec::new()),
            Self::Keyword(_) => Err(TaskError::arguments(
                target,
                "keyword arguments are not accepted",
            )),
        }
    }

    /// Fetch argument `index` (positional) or `name` (keyword).
    pub fn get(&self, index: usize, name: &str) -> Option<&Payload> {
        match self {
            Self::Positional(v) => v.get(index),
            Self::Keyword(m) => m.get(name),
        }
    }
}

impl Default for Args {
    fn default() -> Self {
        Self::none()
    }
}

impl From<Payload> for Args {
    /// A map becomes keyword arguments, a list positional ones, anything
    /// else a single positional argument.
    fn from(p: Payload) -> Self {
        match p {
            Payload::Map(m) => Self::Keyword(m),
            Payload::List(v) => Self::Positional(v),
            Payload::None => Self::none(),
            other => Self::Positional(vec![other]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_json_shape() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Payload::Int(1));
        map.insert("b".to_string(), Payload::from(vec!["x", "y"]));
        let json = serde_json::to_string(&Payload::Map(map)).unwrap();
        assert_eq!(json, r#"{"a":1,"b":["x","y"]}"#);
    }

    #[test]
    fn ensure_portable_rejects_nan_deep_inside() {
        let nested = Payload::List(vec![Payload::Int(1), Payload::List(vec![f64::NAN.into()])]);
        assert!(matches!(
            nested.ensure_portable(),
            Err(TaskError::UnserializableValue { .. })
        ));
        assert!(Payload::from(1.5).ensure_portable().is_ok());
    }

    #[test]
    fn seal_preserves_value() {
        let value = Payload::from(vec![Payload::Int(3), Payload::from("abc"), Payload::None]);
        assert_eq!(value.clone().seal().unwrap(), value);
    }

    #[test]
    fn display_reads_like_literals() {
        let value = Payload::from(vec![Payload::Bool(true), Payload::from("a"), Payload::Float(2.0)]);
        assert_eq!(value.to_string(), r#"[True, "a", 2.0]"#);
    }

    #[test]
    fn args_from_payload() {
        assert!(matches!(Args::from(Payload::Int(1)), Args::Positional(v) if v.len() == 1));
        assert!(Args::from(Payload::None).is_empty());
        let mut map = BTreeMap::new();
        map.insert("x".to_string(), Payload::Int(2));
        let args = Args::from(Payload::Map(map));
        assert_eq!(args.get(0, "x"), Some(&Payload::Int(2)));
        assert!(args.into_positional("f").is_err());
    }

    #[test]
    fn truthiness() {
        assert!(!Payload::None.is_truthy());
        assert!(!Payload::from("").is_truthy());
        assert!(Payload::Int(-1).is_truthy());
    }
}
