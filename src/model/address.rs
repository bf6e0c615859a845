//! Resource addresses and cross-resource references.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::SchemaError;

/// Globally unique address of a resource: kind plus symbolic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    /// Resource kind (e.g. `queue`).
    pub kind: String,
    /// Symbolic name, unique within the kind.
    pub name: String,
}

/// A dependency of one resource's attribute on another resource's output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    /// Producing resource.
    pub target: Address,
    /// Output exported by the producer.
    pub output: String,
}

impl Address {
    /// Creates a new address.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl FromStr for Address {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchemaError::InvalidAddress { raw: s.to_string() };
        let (kind, name) = s.split_once('.').ok_or_else(invalid)?;
        if !is_valid_segment(kind) || !is_valid_segment(name) {
            return Err(invalid());
        }
        Ok(Self::new(kind, name))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Reference {
    /// Creates a new reference.
    #[must_use]
    pub fn new(target: Address, output: impl Into<String>) -> Self {
        Self {
            target,
            output: output.into(),
        }
    }

    /// Parses the body of a `${kind.name.output}` expression.
    ///
    /// Returns `None` when the expression is not a well-formed reference.
    #[must_use]
    pub fn parse_expression(expr: &str) -> Option<Self> {
        let mut parts = expr.trim().splitn(3, '.');
        let kind = parts.next()?;
        let name = parts.next()?;
        let output = parts.next()?;
        if [kind, name, output].iter().all(|s| is_valid_segment(s)) {
            Some(Self::new(Address::new(kind, name), output))
        } else {
            None
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.target, self.output)
    }
}

/// Returns true if the string is a valid address segment.
///
/// Segments are non-empty and made of ASCII alphanumerics, `_` and `-`.
#[must_use]
pub fn is_valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_roundtrip_display() {
        let addr: Address = "queue.hashes".parse().expect("valid address");
        assert_eq!(addr, Address::new("queue", "hashes"));
        assert_eq!(addr.to_string(), "queue.hashes");
    }

    #[test]
    fn test_invalid_addresses() {
        assert!("queue".parse::<Address>().is_err());
        assert!(".hashes".parse::<Address>().is_err());
        assert!("queue.has hes".parse::<Address>().is_err());
        assert!("queue.a.b".parse::<Address>().is_err());
    }

    #[test]
    fn test_parse_reference_expression() {
        let r = Reference::parse_expression("topic.submissions.arn").expect("valid reference");
        assert_eq!(r.target, Address::new("topic", "submissions"));
        assert_eq!(r.output, "arn");
        assert_eq!(r.to_string(), "${topic.submissions.arn}");

        assert!(Reference::parse_expression("topic.submissions").is_none());
        assert!(Reference::parse_expression("topic..arn").is_none());
    }
}
