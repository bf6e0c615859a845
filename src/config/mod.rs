//! Configuration module for the converge engine.
//!
//! This module handles all declaration-related functionality:
//! - Parsing and deserializing `converge.yaml`
//! - Validation of declared kinds, resources and settings
//! - Computing hashes for change detection and run history

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{find_config_file, ConfigParser, DEFAULT_CONFIG_FILES};
pub use spec::{
    ApplySettings, DeclarationFile, KindConfig, ProjectConfig, ResourceDecl, StateBackend,
    StateConfig,
};
pub use validator::{ConfigValidator, IssueKind, ValidationIssue, ValidationResult};
