//! Per-kind resource schemas.
//!
//! A schema tells the engine which attributes a kind accepts, which are
//! required, which force replacement when changed, and which outputs the
//! provider exports after creation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::value::Value;

/// Output every kind exports: the provider-assigned identifier.
pub const ID_OUTPUT: &str = "id";

/// Expected type of an attribute.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    /// UTF-8 string.
    String,
    /// Integer or float.
    Number,
    /// Boolean.
    Bool,
    /// List of values.
    List,
    /// Map of values.
    Map,
    /// Any value.
    #[default]
    Any,
}

/// Schema of a single attribute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AttributeSchema {
    /// Expected type.
    #[serde(rename = "type", default)]
    pub kind: AttributeType,
    /// Whether the attribute must be declared.
    #[serde(default)]
    pub required: bool,
    /// Whether a change forces the resource to be replaced.
    #[serde(default)]
    pub immutable: bool,
}

/// Schema of a resource kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSchema {
    /// Resource kind.
    pub kind: String,
    /// Accepted attributes.
    pub attributes: BTreeMap<String, AttributeSchema>,
    /// Outputs exported after creation, besides `id`.
    pub outputs: Vec<String>,
}

impl ResourceSchema {
    /// Creates an empty schema for a kind.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: BTreeMap::new(),
            outputs: Vec::new(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn attribute(mut self, name: impl Into<String>, schema: AttributeSchema) -> Self {
        self.attributes.insert(name.into(), schema);
        self
    }

    /// Adds an exported output.
    #[must_use]
    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    /// Returns true if changing `attribute` forces replacement.
    #[must_use]
    pub fn is_immutable(&self, attribute: &str) -> bool {
        self.attributes.get(attribute).is_some_and(|a| a.immutable)
    }

    /// Returns true if the kind exports `output`.
    #[must_use]
    pub fn exports(&self, output: &str) -> bool {
        output == ID_OUTPUT || self.outputs.iter().any(|o| o == output)
    }
}

impl AttributeSchema {
    /// Optional mutable attribute of the given type.
    #[must_use]
    pub const fn optional(kind: AttributeType) -> Self {
        Self {
            kind,
            required: false,
            immutable: false,
        }
    }

    /// Required mutable attribute of the given type.
    #[must_use]
    pub const fn required(kind: AttributeType) -> Self {
        Self {
            kind,
            required: true,
            immutable: false,
        }
    }

    /// Marks the attribute as forcing replacement.
    #[must_use]
    pub const fn force_new(mut self) -> Self {
        self.immutable = true;
        self
    }
}

impl AttributeType {
    /// Returns true if `value` is acceptable for this type.
    ///
    /// References and nulls are accepted for every type: their concrete
    /// type is only known after apply.
    #[must_use]
    pub const fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Any, _)
            | (_, Value::Reference(_) | Value::Null)
            | (Self::String, Value::String(_))
            | (Self::Number, Value::Int(_) | Value::Float(_))
            | (Self::Bool, Value::Bool(_))
            | (Self::List, Value::List(_))
            | (Self::Map, Value::Map(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Map => "map",
            Self::Any => "any",
        };
        write!(f, "{s}")
    }
}
