//! Attribute values.
//!
//! Declared attributes are a tagged union of literals and unresolved
//! references. Resolution substitutes producer outputs in dependency order and
//! yields plain JSON values, which is what providers and state records see.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use super::address::Reference;

/// Resolved attribute or output map as seen by providers and state.
pub type AttrMap = BTreeMap<String, serde_json::Value>;

/// A declared attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Explicit null.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Integer literal.
    Int(i64),
    /// Floating point literal.
    Float(f64),
    /// String literal.
    String(String),
    /// List literal, possibly containing references.
    List(Vec<Value>),
    /// Map literal, possibly containing references.
    Map(BTreeMap<String, Value>),
    /// Unresolved reference to another resource's output.
    Reference(Reference),
}

/// Why a raw value could not be converted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueParseError {
    /// A `${...}` expression is not a valid reference.
    InvalidReference(String),
    /// The value shape is not supported.
    Unsupported(String),
}

/// A value in a plan: either known now, or only after apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedValue {
    /// Concrete value.
    Known(serde_json::Value),
    /// Depends on an output not available at plan time.
    Unknown,
}

impl Value {
    /// Converts a raw YAML value from a declaration.
    ///
    /// A string that is exactly `${kind.name.output}` becomes a reference.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed references, non-string map keys,
    /// tagged values and embedded `${...}` interpolation.
    pub fn from_yaml(raw: &serde_yaml::Value) -> Result<Self, ValueParseError> {
        match raw {
            serde_yaml::Value::Null => Ok(Self::Null),
            serde_yaml::Value::Bool(b) => Ok(Self::Bool(*b)),
            serde_yaml::Value::Number(n) => Ok(n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN)), Self::Int)),
            serde_yaml::Value::String(s) => Self::from_str_literal(s),
            serde_yaml::Value::Sequence(items) => items
                .iter()
                .map(Self::from_yaml)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            serde_yaml::Value::Mapping(mapping) => {
                let mut map = BTreeMap::new();
                for (key, value) in mapping {
                    let key = key.as_str().ok_or_else(|| {
                        ValueParseError::Unsupported(String::from("map keys must be strings"))
                    })?;
                    map.insert(key.to_string(), Self::from_yaml(value)?);
                }
                Ok(Self::Map(map))
            }
            serde_yaml::Value::Tagged(tagged) => Err(ValueParseError::Unsupported(format!(
                "tagged value {}",
                tagged.tag
            ))),
        }
    }

    fn from_str_literal(s: &str) -> Result<Self, ValueParseError> {
        if let Some(body) = s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
            return Reference::parse_expression(body)
                .map(Self::Reference)
                .ok_or_else(|| ValueParseError::InvalidReference(s.to_string()));
        }
        if s.contains("${") {
            return Err(ValueParseError::Unsupported(format!(
                "'{s}' embeds a reference; a reference must be the whole value"
            )));
        }
        Ok(Self::String(s.to_string()))
    }

    /// Converts a resolved JSON value back into a literal.
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN)), Self::Int),
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            serde_json::Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Returns a short type name for error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) | Self::Float(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Reference(_) => "reference",
        }
    }

    /// Collects every reference in this value, including nested ones.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Reference(r) => out.push(r),
            Self::List(items) => items.iter().for_each(|v| v.collect_references(out)),
            Self::Map(map) => map.values().for_each(|v| v.collect_references(out)),
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::String(_) => {}
        }
    }

    /// Returns true if the value contains no references.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.references().is_empty()
    }

    /// Substitutes references using `lookup`.
    ///
    /// Returns `None` if any reference cannot be resolved yet.
    pub fn resolve<F>(&self, lookup: &F) -> Option<serde_json::Value>
    where
        F: Fn(&Reference) -> Option<serde_json::Value>,
    {
        match self {
            Self::Null => Some(serde_json::Value::Null),
            Self::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Self::Int(i) => Some(serde_json::Value::from(*i)),
            Self::Float(f) => Some(
                serde_json::Number::from_f64(*f)
                    .map_or(serde_json::Value::Null, serde_json::Value::Number),
            ),
            Self::String(s) => Some(serde_json::Value::String(s.clone())),
            Self::List(items) => items
                .iter()
                .map(|v| v.resolve(lookup))
                .collect::<Option<Vec<_>>>()
                .map(serde_json::Value::Array),
            Self::Map(map) => map
                .iter()
                .map(|(k, v)| v.resolve(lookup).map(|r| (k.clone(), r)))
                .collect::<Option<serde_json::Map<_, _>>>()
                .map(serde_json::Value::Object),
            Self::Reference(r) => lookup(r),
        }
    }

    /// Resolves the value into a planned value.
    pub fn plan<F>(&self, lookup: &F) -> PlannedValue
    where
        F: Fn(&Reference) -> Option<serde_json::Value>,
    {
        self.resolve(lookup)
            .map_or(PlannedValue::Unknown, PlannedValue::Known)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference(r) => write!(f, "{r}"),
            other => {
                let json = other.resolve(&|_| None).unwrap_or(serde_json::Value::Null);
                write!(f, "{json}")
            }
        }
    }
}

impl PlannedValue {
    /// Returns true if the value is known at plan time.
    #[must_use]
    pub const fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }

    /// Returns the concrete value, if known.
    #[must_use]
    pub const fn known(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Known(v) => Some(v),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(v) => write!(f, "{v}"),
            Self::Unknown => write!(f, "(known after apply)"),
        }
    }
}

impl Serialize for PlannedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Known(v) => v.serialize(serializer),
            Self::Unknown => serializer.serialize_str("(known after apply)"),
        }
    }
}
