//! Error types for the converge reconciliation engine.
//!
//! Errors are grouped by the phase that raises them: declaration loading,
//! resource parsing, graph construction, planning, provider calls and state
//! storage. Everything before apply is fatal for the run; provider errors are
//! contained to the failing resource and its dependents by the executor.

use std::path::PathBuf;
use thiserror::Error;

use crate::model::Address;

/// The main error type for the converge engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Declaration file errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource declaration does not match its kind's schema.
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Dependency graph could not be built.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Declaration file errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The declaration file was not found.
    #[error("Declaration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The declaration file could not be parsed.
    #[error("Failed to parse declaration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Declaration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Duplicate resource address.
    #[error("Duplicate resource address: {address}")]
    DuplicateAddress {
        /// The duplicated address.
        address: String,
    },
}

/// A resource declaration violates its kind's schema.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    /// No provider serves the resource kind.
    #[error("Unknown resource kind '{kind}' (declared by {address})")]
    UnknownKind {
        /// The unknown kind.
        kind: String,
        /// Resource that declared it.
        address: String,
    },

    /// A required attribute is missing.
    #[error("{address}: missing required attribute '{attribute}'")]
    MissingAttribute {
        /// Resource address.
        address: Address,
        /// Missing attribute.
        attribute: String,
    },

    /// An attribute is not part of the kind's schema.
    #[error("{address}: unknown attribute '{attribute}'")]
    UnknownAttribute {
        /// Resource address.
        address: Address,
        /// Unexpected attribute.
        attribute: String,
    },

    /// An attribute value has the wrong type.
    #[error("{address}: attribute '{attribute}' expects {expected}, found {found}")]
    TypeMismatch {
        /// Resource address.
        address: Address,
        /// Offending attribute.
        attribute: String,
        /// Expected type name.
        expected: String,
        /// Found type name.
        found: String,
    },

    /// A `${...}` expression could not be parsed as a reference.
    #[error("{address}: invalid reference '{raw}' (expected ${{kind.name.output}})")]
    InvalidReference {
        /// Resource address.
        address: Address,
        /// Raw expression.
        raw: String,
    },

    /// An address string could not be parsed.
    #[error("Invalid resource address '{raw}' (expected kind.name)")]
    InvalidAddress {
        /// Raw address string.
        raw: String,
    },

    /// A value cannot be represented in the attribute model.
    #[error("{address}: unsupported value for attribute '{attribute}': {message}")]
    UnsupportedValue {
        /// Resource address.
        address: Address,
        /// Offending attribute.
        attribute: String,
        /// Reason.
        message: String,
    },
}

/// Dependency graph construction errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// References form a cycle.
    #[error("Dependency cycle detected: {}", format_cycle(.path))]
    Cycle {
        /// Addresses along the cycle, first address repeated at the end.
        path: Vec<Address>,
    },

    /// A reference points to an address that is not declared.
    #[error("{from} references undeclared resource {target}")]
    DanglingReference {
        /// Referencing resource.
        from: Address,
        /// Missing target.
        target: Address,
    },

    /// A reference names an output the target kind does not export.
    #[error("{from} references unknown output '{output}' of {target}")]
    UnknownOutput {
        /// Referencing resource.
        from: Address,
        /// Target resource.
        target: Address,
        /// Missing output name.
        output: String,
    },

    /// Two resources share an address.
    #[error("Resource {address} is declared more than once")]
    DuplicateAddress {
        /// The duplicated address.
        address: Address,
    },
}

/// Planning errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    /// A destroy cannot be ordered safely.
    #[error("Cannot schedule destroy of {address}: {reason}")]
    Unschedulable {
        /// Resource whose destroy is blocked.
        address: Address,
        /// Why it cannot be scheduled.
        reason: String,
    },

    /// The plan would destroy a resource marked `prevent_destroy`.
    #[error("Plan would destroy {address}, which has lifecycle.prevent_destroy set")]
    DestroyPrevented {
        /// Protected resource.
        address: Address,
    },

    /// A targeted address is not present in state.
    #[error("Target {address} is not present in state")]
    UnknownTarget {
        /// Target address.
        address: Address,
    },

    /// State or declaration changed after the plan was approved.
    #[error("The plan changed since it was approved, run plan again")]
    Stale,
}

/// Errors reported by provider plugins.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The remote object does not exist.
    #[error("object {id} not found")]
    NotFound {
        /// Provider-assigned identifier.
        id: String,
    },

    /// The provider rejected the request.
    #[error("{message}")]
    Rejected {
        /// Message from the provider.
        message: String,
    },

    /// Transient failure talking to the provider.
    #[error("transient failure: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// Provider is throttling requests.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited {
        /// Suggested wait before retrying.
        retry_after_ms: u64,
    },

    /// No provider is registered for the kind.
    #[error("no provider registered for kind '{kind}'")]
    Unsupported {
        /// Resource kind.
        kind: String,
    },

    /// The provider returned something the engine cannot use.
    #[error("invalid provider response: {message}")]
    InvalidResponse {
        /// Description.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Result type alias for converge operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

fn format_cycle(path: &[Address]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl ProviderError {
    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Creates a transient error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::RateLimited { .. })
    }

    /// Returns the suggested retry delay in milliseconds, if applicable.
    #[must_use]
    pub const fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            Self::Unavailable { .. } => Some(500),
            _ => None,
        }
    }
}

impl StateError {
    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}
