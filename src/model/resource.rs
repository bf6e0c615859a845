//! Typed resources parsed from declarations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::ResourceDecl;
use crate::error::SchemaError;

use super::address::{Address, Reference};
use super::schema::ResourceSchema;
use super::value::{Value, ValueParseError};

/// Lifecycle flags controlling replacement and destruction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Lifecycle {
    /// Always create the replacement before destroying the old object.
    #[serde(default)]
    pub create_before_destroy: bool,
    /// Refuse any plan that destroys this resource.
    #[serde(default)]
    pub prevent_destroy: bool,
}

/// A declared resource. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Unique address.
    pub address: Address,
    /// Name of the provider serving this kind.
    pub provider: String,
    /// Declared attributes.
    pub attributes: BTreeMap<String, Value>,
    /// Explicit ordering dependencies without attribute references.
    pub depends_on: Vec<Address>,
    /// Lifecycle flags.
    pub lifecycle: Lifecycle,
}

impl Resource {
    /// Parses a declaration against its kind's schema.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] if a required attribute is missing, an
    /// attribute is unknown or has the wrong type, or a reference or
    /// `depends_on` entry is malformed.
    pub fn parse(
        decl: &ResourceDecl,
        schema: &ResourceSchema,
        provider: &str,
    ) -> Result<Self, SchemaError> {
        let address = Address::new(&decl.kind, &decl.name);
        let mut attributes = BTreeMap::new();

        for (name, raw) in &decl.attributes {
            let Some(attr_schema) = schema.attributes.get(name) else {
                return Err(SchemaError::UnknownAttribute {
                    address,
                    attribute: name.clone(),
                });
            };

            let value = Value::from_yaml(raw).map_err(|e| match e {
                ValueParseError::InvalidReference(raw) => SchemaError::InvalidReference {
                    address: address.clone(),
                    raw,
                },
                ValueParseError::Unsupported(message) => SchemaError::UnsupportedValue {
                    address: address.clone(),
                    attribute: name.clone(),
                    message,
                },
            })?;

            if !attr_schema.kind.accepts(&value) {
                return Err(SchemaError::TypeMismatch {
                    address,
                    attribute: name.clone(),
                    expected: attr_schema.kind.to_string(),
                    found: value.type_name().to_string(),
                });
            }

            attributes.insert(name.clone(), value);
        }

        for (name, attr_schema) in &schema.attributes {
            let missing = attributes.get(name).is_none_or(|v| *v == Value::Null);
            if attr_schema.required && missing {
                return Err(SchemaError::MissingAttribute {
                    address,
                    attribute: name.clone(),
                });
            }
        }

        let depends_on = decl
            .depends_on
            .iter()
            .map(|raw| raw.parse::<Address>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            address,
            provider: provider.to_string(),
            attributes,
            depends_on,
            lifecycle: decl.lifecycle,
        })
    }

    /// Returns every reference in the attribute tree, in attribute order.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        self.attributes
            .values()
            .flat_map(Value::references)
            .collect()
    }

    /// Returns the addresses this resource depends on, deduplicated.
    #[must_use]
    pub fn dependencies(&self) -> Vec<Address> {
        let mut deps: Vec<Address> = self
            .references()
            .into_iter()
            .map(|r| r.target.clone())
            .chain(self.depends_on.iter().cloned())
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeSchema, AttributeType};

    fn queue_schema() -> ResourceSchema {
        ResourceSchema::new("queue")
            .attribute(
                "name",
                AttributeSchema::required(AttributeType::String).force_new(),
            )
            .attribute("visibility_timeout", AttributeSchema::optional(AttributeType::Number))
            .attribute("policy", AttributeSchema::optional(AttributeType::Map))
            .output("arn")
    }

    fn decl(yaml: &str) -> ResourceDecl {
        serde_yaml::from_str(yaml).expect("valid declaration")
    }

    #[test]
    fn test_parse_valid_resource() {
        let d = decl(
            r#"
kind: queue
name: hashes
attributes:
  name: hashes-queue
  visibility_timeout: 30
  policy:
    source: "${topic.submissions.arn}"
depends_on: ["role.worker"]
"#,
        );
        let resource = Resource::parse(&d, &queue_schema(), "local").expect("valid resource");
        assert_eq!(resource.address.to_string(), "queue.hashes");
        assert_eq!(resource.provider, "local");
        assert_eq!(
            resource.dependencies(),
            vec![Address::new("role", "worker"), Address::new("topic", "submissions")]
        );
    }

    #[test]
    fn test_missing_required_attribute() {
        let d = decl("kind: queue\nname: hashes\nattributes:\n  visibility_timeout: 30\n");
        let err = Resource::parse(&d, &queue_schema(), "local").expect_err("should fail");
        assert_eq!(
            err,
            SchemaError::MissingAttribute {
                address: Address::new("queue", "hashes"),
                attribute: String::from("name"),
            }
        );
    }

    #[test]
    fn test_type_mismatch() {
        let d = decl("kind: queue\nname: hashes\nattributes:\n  name: q\n  visibility_timeout: soon\n");
        let err = Resource::parse(&d, &queue_schema(), "local").expect_err("should fail");
        assert!(matches!(err, SchemaError::TypeMismatch { ref attribute, .. } if attribute == "visibility_timeout"));
    }

    #[test]
    fn test_unknown_attribute() {
        let d = decl("kind: queue\nname: hashes\nattributes:\n  name: q\n  colour: blue\n");
        let err = Resource::parse(&d, &queue_schema(), "local").expect_err("should fail");
        assert!(matches!(err, SchemaError::UnknownAttribute { .. }));
    }

    #[test]
    fn test_reference_satisfies_required_attribute() {
        let d = decl("kind: queue\nname: hashes\nattributes:\n  name: \"${topic.t.id}\"\n");
        let resource = Resource::parse(&d, &queue_schema(), "local").expect("valid resource");
        assert_eq!(resource.references().len(), 1);
    }
}
