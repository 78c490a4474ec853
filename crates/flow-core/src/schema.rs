//! Declared input schemas for processor kinds.
//!
//! The original dynamic design validated keyword inputs by inspecting the
//! `process` signature at call time. Here every kind ships an explicit
//! [`Signature`]; the graph validates binding names and literal types when a
//! node is added, and resolved values once more before the node first runs.

use crate::value::Value;

/// Declared shape of a single input parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueType {
    /// Matches anything. The escape hatch for payloads only the kind
    /// understands (pair with `encode`/`decode` on the kind).
    Any,
    Null,
    Bool,
    Number,
    String,
    Bytes,
    Array(Box<ValueType>),
    /// A string-keyed map with uniformly typed values.
    Object(Box<ValueType>),
    /// Raw JSON payload.
    Json,
}

impl ValueType {
    /// Untyped array, equivalent to `Array(Any)`.
    pub fn array() -> Self {
        ValueType::Array(Box::new(ValueType::Any))
    }

    /// Untyped map, equivalent to `Object(Any)`.
    pub fn object() -> Self {
        ValueType::Object(Box::new(ValueType::Any))
    }

    /// Recursively checks whether `value` satisfies this type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValueType::Any => true,
            ValueType::Null => value.is_null(),
            ValueType::Bool => matches!(value, Value::Bool(_)),
            ValueType::Number => matches!(value, Value::Number(_)),
            ValueType::String => matches!(value, Value::String(_)),
            ValueType::Bytes => matches!(value, Value::Bytes(_)),
            ValueType::Array(inner) => match value {
                Value::Array(items) => items.iter().all(|item| inner.matches(item)),
                _ => false,
            },
            ValueType::Object(inner) => match value {
                Value::Object(map) => map.values().all(|item| inner.matches(item)),
                _ => false,
            },
            ValueType::Json => matches!(value, Value::Json(_)),
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueType::Any => write!(f, "any"),
            ValueType::Null => write!(f, "null"),
            ValueType::Bool => write!(f, "bool"),
            ValueType::Number => write!(f, "number"),
            ValueType::String => write!(f, "string"),
            ValueType::Bytes => write!(f, "bytes"),
            ValueType::Array(inner) => write!(f, "array<{}>", inner),
            ValueType::Object(inner) => write!(f, "object<{}>", inner),
            ValueType::Json => write!(f, "json"),
        }
    }
}

/// One named, typed parameter of a `process` signature.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: ValueType,
}

/// The full declared input signature of a processor kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
    params: Vec<Param>,
}

impl Signature {
    pub fn new() -> Self {
        Self { params: Vec::new() }
    }

    /// Builder-style parameter declaration.
    pub fn param(mut self, name: impl Into<String>, ty: ValueType) -> Self {
        self.params.push(Param {
            name: name.into(),
            ty,
        });
        self
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}
