//! Dynamic value tree stored inside tracked containers.
//!
//! Leaf values are plain (`Null`, `Bool`, `Int`, `Float`, `Str`); references
//! to other tracked containers are [`Value::Tracked`]. The composite literal
//! variants (`Object`, `Array`, `Dict`) exist only as *inputs*: writing one
//! into a container materializes it into a new tracked container owned by the
//! same store, so a read never observes an untracked composite.

use std::sync::Arc;

use enum_as_inner::EnumAsInner;
use serde_json::json;

use crate::trackable::Trackable;

/// A value held by (or written into) a tracked container.
///
/// Derived equality is structural (tracked references compare by id); see
/// [`Value::same`] for the identity relation used by write suppression.
#[derive(Clone, Debug, Default, PartialEq, EnumAsInner)]
pub enum Value {
    /// Absent or explicitly-null value. Reading a property that was never set
    /// yields `Null`.
    #[default]
    Null,
    /// Boolean leaf.
    Bool(bool),
    /// Integer leaf.
    Int(i64),
    /// Floating-point leaf.
    Float(f64),
    /// String leaf.
    Str(Arc<str>),
    /// Reference to a tracked container.
    Tracked(Trackable),
    /// Object literal, materialized into a tracked object on write.
    Object(Vec<(String, Value)>),
    /// Array literal, materialized into a tracked array on write.
    Array(Vec<Value>),
    /// Dictionary literal, materialized into a tracked dictionary on write.
    Dict(Vec<(String, Value)>),
}

impl Value {
    /// Object literal builder.
    pub fn obj<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Array literal builder.
    pub fn arr<I: IntoIterator<Item = Value>>(items: I) -> Self {
        Self::Array(items.into_iter().collect())
    }

    /// Dictionary literal builder.
    pub fn dict<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self::Dict(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Identity comparison used for write suppression and collection diffing:
    /// value equality for primitives, trax-id identity for tracked references.
    /// Composite literals are never identical to anything; they stand for
    /// "fresh content" until materialized.
    #[must_use]
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tracked(a), Value::Tracked(b)) => a.id() == b.id(),
            _ => false,
        }
    }

    /// Whether this is a composite literal that still needs materialization.
    #[must_use]
    pub fn is_composite_literal(&self) -> bool {
        matches!(self, Value::Object(_) | Value::Array(_) | Value::Dict(_))
    }

    /// JSON projection used for event payloads. Tracked references render as
    /// their id string.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Int(n) => json!(n),
            Value::Float(f) => {
                serde_json::Number::from_f64(*f).map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
            Value::Str(s) => json!(&**s),
            Value::Tracked(t) => json!(t.id().as_str()),
            Value::Object(entries) | Value::Dict(entries) => serde_json::Value::Object(
                entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(Arc::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(Arc::from(value))
    }
}

impl From<Trackable> for Value {
    fn from(value: Trackable) -> Self {
        Self::Tracked(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod test {
    use super::Value;

    #[test]
    fn primitive_identity() {
        assert!(Value::Int(4).same(&Value::Int(4)));
        assert!(!Value::Int(4).same(&Value::Float(4.0)));
        assert!(Value::from("a").same(&Value::from("a")));
        assert!(Value::Null.same(&Value::Null));
        assert!(!Value::Null.same(&Value::Bool(false)));
    }

    #[test]
    fn literals_are_never_identical() {
        let lit = Value::arr([Value::Int(1)]);
        assert!(!lit.same(&Value::arr([Value::Int(1)])));
        assert!(!lit.same(&lit.clone()));
    }

    #[test]
    fn json_projection() {
        let v = Value::obj([("n", Value::Int(1)), ("s", Value::from("x"))]);
        assert_eq!(v.to_json(), serde_json::json!({"n": 1, "s": "x"}));
    }
}
