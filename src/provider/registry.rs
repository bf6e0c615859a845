//! Kind to provider mapping.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::DeclarationFile;
use crate::error::{ConfigError, ProviderError, SchemaError};
use crate::model::{Resource, ResourceSchema};

use super::Provider;

/// A kind bound to the provider that serves it.
#[derive(Debug, Clone)]
struct KindBinding {
    provider: Arc<dyn Provider>,
    schema: ResourceSchema,
}

/// Registry of providers and the kinds they serve.
#[derive(Debug, Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
    kinds: BTreeMap<String, KindBinding>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider and every kind it has a built-in schema for.
    pub fn add_provider(&mut self, provider: Arc<dyn Provider>) {
        for schema in provider.schemas() {
            debug!(kind = %schema.kind, provider = %provider.name(), "registering built-in kind");
            self.kinds.insert(
                schema.kind.clone(),
                KindBinding {
                    provider: Arc::clone(&provider),
                    schema,
                },
            );
        }
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Builder-style [`Self::add_provider`].
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.add_provider(provider);
        self
    }

    /// Binds a kind to a registered provider with an explicit schema.
    ///
    /// # Errors
    ///
    /// Returns an error if no provider with that name is registered.
    pub fn bind(
        &mut self,
        schema: ResourceSchema,
        provider_name: &str,
    ) -> Result<(), ConfigError> {
        let provider = self.providers.get(provider_name).ok_or_else(|| {
            ConfigError::validation(
                format!("Unknown provider '{provider_name}' for kind '{}'", schema.kind),
                format!("kinds.{}.provider", schema.kind),
            )
        })?;

        self.kinds.insert(
            schema.kind.clone(),
            KindBinding {
                provider: Arc::clone(provider),
                schema,
            },
        );
        Ok(())
    }

    /// Builds a registry from the declaration's `kinds` section.
    ///
    /// Declared kinds override built-in schemas of the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if a kind names a provider that is not available.
    pub fn from_declaration(
        declaration: &DeclarationFile,
        providers: impl IntoIterator<Item = Arc<dyn Provider>>,
    ) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for provider in providers {
            registry.add_provider(provider);
        }

        for (kind, config) in &declaration.kinds {
            registry.bind(config.to_schema(kind), &config.provider)?;
        }

        Ok(registry)
    }

    /// Returns the provider serving a kind.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Unsupported`] if the kind is not registered.
    pub fn provider(&self, kind: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        self.kinds
            .get(kind)
            .map(|b| Arc::clone(&b.provider))
            .ok_or_else(|| ProviderError::Unsupported {
                kind: kind.to_string(),
            })
    }

    /// Returns a provider by name.
    #[must_use]
    pub fn provider_named(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Returns the schema of a kind.
    #[must_use]
    pub fn schema(&self, kind: &str) -> Option<&ResourceSchema> {
        self.kinds.get(kind).map(|b| &b.schema)
    }

    /// Returns every registered kind.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }

    /// Parses every declared resource against its kind's schema.
    ///
    /// # Errors
    ///
    /// Returns the first [`SchemaError`] encountered.
    pub fn parse_resources(&self, declaration: &DeclarationFile) -> Result<Vec<Resource>, SchemaError> {
        declaration
            .resources
            .iter()
            .map(|decl| {
                let binding = self.kinds.get(&decl.kind).ok_or_else(|| SchemaError::UnknownKind {
                    kind: decl.kind.clone(),
                    address: decl.address(),
                })?;
                Resource::parse(decl, &binding.schema, binding.provider.name())
            })
            .collect()
    }
}
