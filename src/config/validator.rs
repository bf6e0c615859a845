//! Declaration validation.
//!
//! This module checks a declaration file before any resource is parsed:
//! names, kinds, addresses, explicit dependencies and settings. Schema
//! checks on individual attribute values happen later, in the resource model.

use crate::error::{ConfigError, ConvergeError, Result};
use crate::model::{is_valid_segment, Address, ID_OUTPUT};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{ApplySettings, DeclarationFile, KindConfig, ProjectConfig};

/// Upper bound above which parallelism triggers a warning.
const PARALLELISM_WARN_THRESHOLD: usize = 64;

/// Validator for declaration files.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all issues found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationIssue>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationIssue {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
    /// What kind of problem was found.
    pub kind: IssueKind,
}

/// Classification of a validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueKind {
    /// A field holds an invalid value.
    Invalid,
    /// Two resources share this address.
    DuplicateAddress(String),
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a declaration file.
    ///
    /// # Errors
    ///
    /// Returns the first error found; duplicate addresses are reported as
    /// [`ConfigError::DuplicateAddress`].
    pub fn validate(&self, declaration: &DeclarationFile) -> Result<ValidationResult> {
        let result = self.collect(declaration);

        if result.errors.is_empty() {
            debug!(warnings = result.warnings.len(), "declaration validation passed");
            return Ok(result);
        }

        let first = &result.errors[0];
        if let IssueKind::DuplicateAddress(address) = &first.kind {
            return Err(ConvergeError::Config(ConfigError::DuplicateAddress {
                address: address.clone(),
            }));
        }
        Err(ConvergeError::Config(ConfigError::ValidationError {
            message: first.message.clone(),
            field: Some(first.field.clone()),
        }))
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn collect(&self, declaration: &DeclarationFile) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&declaration.project, &mut result);
        Self::validate_settings(&declaration.settings, &mut result);
        for (kind, config) in &declaration.kinds {
            Self::validate_kind(kind, config, &mut result);
        }
        Self::validate_resources(declaration, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.push_error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.push_error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.push_error("project.environment", "Environment cannot be empty");
        }
    }

    /// Validates apply settings.
    fn validate_settings(settings: &ApplySettings, result: &mut ValidationResult) {
        if settings.parallelism == 0 {
            result.push_error("settings.parallelism", "Parallelism must be at least 1");
        } else if settings.parallelism > PARALLELISM_WARN_THRESHOLD {
            result.warnings.push(format!(
                "settings.parallelism: {} concurrent provider calls is unusually high",
                settings.parallelism
            ));
        }
    }

    /// Validates a kind definition.
    fn validate_kind(kind: &str, config: &KindConfig, result: &mut ValidationResult) {
        let prefix = format!("kinds.{kind}");

        if !is_valid_segment(kind) {
            result.push_error(&prefix, format!("Kind name '{kind}' is invalid"));
        }

        if config.provider.is_empty() {
            result.push_error(format!("{prefix}.provider"), "Provider name cannot be empty");
        }

        for attribute in config.attributes.keys() {
            if !is_valid_segment(attribute) {
                result.push_error(
                    format!("{prefix}.attributes.{attribute}"),
                    format!("Attribute name '{attribute}' is invalid"),
                );
            }
        }

        let mut seen = HashSet::new();
        for output in &config.outputs {
            if output == ID_OUTPUT {
                result.warnings.push(format!(
                    "{prefix}.outputs: '{ID_OUTPUT}' is always exported and need not be listed"
                ));
            } else if !is_valid_segment(output) {
                result.push_error(
                    format!("{prefix}.outputs"),
                    format!("Output name '{output}' is invalid"),
                );
            } else if !seen.insert(output) {
                result.push_error(
                    format!("{prefix}.outputs"),
                    format!("Duplicate output '{output}'"),
                );
            }
        }
    }

    /// Validates declared resources.
    fn validate_resources(declaration: &DeclarationFile, result: &mut ValidationResult) {
        if declaration.resources.is_empty() {
            result.warnings.push(String::from("No resources declared"));
            return;
        }

        let mut seen = HashSet::new();

        for (i, resource) in declaration.resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");
            let address = resource.address();

            if !seen.insert(address.clone()) {
                result.errors.push(ValidationIssue {
                    field: format!("resources.{address}"),
                    message: format!("Duplicate resource address: {address}"),
                    kind: IssueKind::DuplicateAddress(address.clone()),
                });
            }

            if !is_valid_segment(&resource.name) {
                result.push_error(
                    format!("{prefix}.name"),
                    format!("Resource name '{}' is invalid", resource.name),
                );
            }

            if !declaration.kinds.contains_key(&resource.kind) {
                result.push_error(
                    format!("{prefix}.kind"),
                    format!("Kind '{}' is not declared under kinds", resource.kind),
                );
            }

            for (j, dep) in resource.depends_on.iter().enumerate() {
                match dep.parse::<Address>() {
                    Ok(dep_address) if dep_address.to_string() == address => {
                        result.push_error(
                            format!("{prefix}.depends_on[{j}]"),
                            format!("{address} cannot depend on itself"),
                        );
                    }
                    Ok(_) => {}
                    Err(e) => result.push_error(format!("{prefix}.depends_on[{j}]"), e.to_string()),
                }
            }

            if resource.lifecycle.prevent_destroy && resource.lifecycle.create_before_destroy {
                debug!(%address, "prevent_destroy also blocks replacement");
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    fn push_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
            kind: IssueKind::Invalid,
        });
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
