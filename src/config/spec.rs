//! Declaration file types.
//!
//! This module defines the structs that map to `converge.yaml`. They describe
//! the desired state: which kinds exist, which resources are declared, and
//! how the engine should store state and run applies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{AttributeSchema, Lifecycle, ResourceSchema};

/// The root structure of a declaration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeclarationFile {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Apply settings.
    #[serde(default)]
    pub settings: ApplySettings,
    /// Resource kinds and their schemas.
    #[serde(default)]
    pub kinds: BTreeMap<String, KindConfig>,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// State directory (for the local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// One JSON file per resource in a local directory.
    #[default]
    Local,
    /// In-process state, discarded on exit.
    Memory,
}

/// Settings controlling plan and apply runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplySettings {
    /// Maximum number of provider operations in flight.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Re-read recorded resources from their providers before diffing.
    #[serde(default = "default_true")]
    pub refresh: bool,
    /// Retries for transient provider failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay between retries in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// A resource kind: which provider serves it and its schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindConfig {
    /// Provider serving this kind.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Accepted attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeSchema>,
    /// Outputs exported after creation, besides `id`.
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// A single declared resource, before parsing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDecl {
    /// Resource kind.
    pub kind: String,
    /// Symbolic name.
    pub name: String,
    /// Raw attribute values; `${kind.name.output}` strings are references.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_yaml::Value>,
    /// Explicit dependencies as `kind.name` addresses.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Lifecycle flags.
    #[serde(default)]
    pub lifecycle: Lifecycle,
}

fn default_environment() -> String {
    String::from("dev")
}

const fn default_parallelism() -> usize {
    4
}

const fn default_true() -> bool {
    true
}

const fn default_max_retries() -> u32 {
    2
}

const fn default_retry_delay_ms() -> u64 {
    250
}

fn default_provider() -> String {
    String::from("local")
}

impl Default for ApplySettings {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            refresh: true,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl KindConfig {
    /// Builds the engine schema for this kind.
    #[must_use]
    pub fn to_schema(&self, kind: &str) -> ResourceSchema {
        ResourceSchema {
            kind: kind.to_string(),
            attributes: self.attributes.clone(),
            outputs: self.outputs.clone(),
        }
    }
}

impl DeclarationFile {
    /// Returns the number of declared resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Returns the declared resources of a kind.
    #[must_use]
    pub fn resources_of_kind(&self, kind: &str) -> Vec<&ResourceDecl> {
        self.resources.iter().filter(|r| r.kind == kind).collect()
    }
}

impl ResourceDecl {
    /// Returns the `kind.name` address string.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}.{}", self.kind, self.name)
    }
}
