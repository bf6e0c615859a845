//! Provider plugin interface.
//!
//! Providers perform the actual create/read/update/delete calls for resource
//! kinds. The engine never talks to infrastructure directly:
//! - [`Provider`] is the async plugin trait
//! - [`ProviderRegistry`] maps kinds to providers and schemas
//! - [`LocalProvider`] stores objects as JSON files
//! - [`MemoryProvider`] keeps objects in process, with failure injection

mod local;
mod memory;
mod registry;

use async_trait::async_trait;
use std::fmt::Debug;

use crate::error::ProviderError;
use crate::model::{Address, AttrMap, ResourceSchema};

pub use local::{LocalProvider, LOCAL_PROVIDER};
pub use memory::{CallKind, FailureMode, MemoryProvider, ProviderCall};
pub use registry::ProviderRegistry;

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    /// Provider-assigned identifier.
    pub id: String,
    /// Outputs exported by the new object.
    pub outputs: AttrMap,
}

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// A provider plugin serving one or more resource kinds.
///
/// Implementations must be safe to call concurrently for different
/// addresses; the engine never issues two calls for the same address at once.
#[async_trait]
pub trait Provider: Send + Sync + Debug {
    /// Provider name referenced by `kinds.<kind>.provider`.
    fn name(&self) -> &str;

    /// Built-in schemas for kinds this provider serves.
    fn schemas(&self) -> Vec<ResourceSchema> {
        Vec::new()
    }

    /// Returns the built-in schema for a kind, if any.
    fn schema(&self, kind: &str) -> Option<ResourceSchema> {
        self.schemas().into_iter().find(|s| s.kind == kind)
    }

    /// Creates a new object.
    async fn create(
        &self,
        address: &Address,
        schema: &ResourceSchema,
        attributes: &AttrMap,
    ) -> ProviderResult<Created>;

    /// Reads the current attributes of an object.
    async fn read(&self, address: &Address, id: &str) -> ProviderResult<AttrMap>;

    /// Updates mutable attributes in place and returns the new outputs.
    async fn update(
        &self,
        address: &Address,
        schema: &ResourceSchema,
        id: &str,
        attributes: &AttrMap,
    ) -> ProviderResult<AttrMap>;

    /// Deletes an object.
    async fn delete(&self, address: &Address, id: &str) -> ProviderResult<()>;
}

/// Builds the outputs for an object.
///
/// An output named like an attribute echoes that attribute; any other output
/// is derived from the provider, kind and id.
pub(crate) fn derive_outputs(
    provider: &str,
    schema: &ResourceSchema,
    id: &str,
    attributes: &AttrMap,
) -> AttrMap {
    schema
        .outputs
        .iter()
        .map(|output| {
            let value = attributes.get(output).cloned().unwrap_or_else(|| {
                serde_json::Value::String(format!("{provider}://{}/{id}/{output}", schema.kind))
            });
            (output.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_derive_outputs() {
        let schema = ResourceSchema::new("queue").output("arn").output("name");
        let attrs = AttrMap::from([(String::from("name"), json!("hashes"))]);

        let outputs = derive_outputs("memory", &schema, "q-1", &attrs);
        assert_eq!(outputs["arn"], json!("memory://queue/q-1/arn"));
        assert_eq!(outputs["name"], json!("hashes"));
    }
}
